//! Rollback ledger
//!
//! Every filesystem effect a fix has is recorded here first, so it can be
//! undone. Small snapshots stay in memory; larger ones are spilled to
//! `<backup_dir>/<timestamp-ms>_<seq>.bak`.
//!
//! Indices are stable until [`RollbackLedger::cleanup`] runs, which is why
//! cleanup only happens between sessions.

use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_MEMORY_THRESHOLD: usize = 64 * 1024;
pub const DEFAULT_MAX_ENTRIES: usize = 256;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("rollback ledger is full ({0} entries)")]
    Full(usize),
    #[error("no ledger entry at index {0}")]
    NoSuchEntry(usize),
    #[error("entry {0} was already rolled back")]
    AlreadyRolledBack(usize),
    #[error("entry {0} cannot be rolled back")]
    NotReversible(usize),
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    FileCreated,
    FileModified,
    FileDeleted,
    DirCreated,
    DirDeleted,
    /// Audit only; commands cannot be undone.
    Command,
}

impl fmt::Display for LedgerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LedgerOp::FileCreated => "file created",
            LedgerOp::FileModified => "file modified",
            LedgerOp::FileDeleted => "file deleted",
            LedgerOp::DirCreated => "directory created",
            LedgerOp::DirDeleted => "directory deleted",
            LedgerOp::Command => "command",
        };
        f.write_str(label)
    }
}

/// Where the pre-change bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    None,
    Memory(Vec<u8>),
    Disk(PathBuf),
}

impl Snapshot {
    fn read(&self) -> Result<Option<Vec<u8>>, LedgerError> {
        match self {
            Snapshot::None => Ok(None),
            Snapshot::Memory(bytes) => Ok(Some(bytes.clone())),
            Snapshot::Disk(path) => fs::read(path).map(Some).map_err(io_err(path)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub op: LedgerOp,
    /// File, directory, or command line.
    pub target: PathBuf,
    pub snapshot: Snapshot,
    pub original_size: u64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub can_rollback: bool,
    rolled_back: bool,
    permissions: Option<fs::Permissions>,
}

impl RollbackEntry {
    pub fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub backup_dir: PathBuf,
    /// Snapshots up to this many bytes stay in memory.
    pub memory_threshold: usize,
    pub max_entries: usize,
    pub retention_days: u32,
}

impl LedgerConfig {
    /// Defaults with backups under `<project>/.buildmedic/backups`.
    pub fn for_project(root: &Path) -> Self {
        Self {
            backup_dir: root.join(".buildmedic").join("backups"),
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            max_entries: DEFAULT_MAX_ENTRIES,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug)]
pub struct RollbackLedger {
    config: LedgerConfig,
    entries: Vec<RollbackEntry>,
    seq: u64,
}

impl RollbackLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            seq: 0,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn entries(&self) -> &[RollbackEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_capacity(&self) -> Result<(), LedgerError> {
        if self.entries.len() >= self.config.max_entries {
            return Err(LedgerError::Full(self.config.max_entries));
        }
        Ok(())
    }

    fn push(&mut self, entry: RollbackEntry) -> usize {
        tracing::debug!(op = %entry.op, target = %entry.target.display(), "ledger entry recorded");
        self.entries.push(entry);
        self.entries.len() - 1
    }

    fn entry(op: LedgerOp, target: &Path, description: String, can_rollback: bool) -> RollbackEntry {
        RollbackEntry {
            op,
            target: target.to_path_buf(),
            snapshot: Snapshot::None,
            original_size: 0,
            timestamp: Utc::now(),
            description,
            can_rollback,
            rolled_back: false,
            permissions: None,
        }
    }

    /// Snapshot `path` before it is modified or deleted.
    ///
    /// A missing file is recorded as a creation instead, so rollback
    /// removes whatever the fix writes there.
    pub fn backup_file(&mut self, path: &Path, op: LedgerOp) -> Result<usize, LedgerError> {
        self.ensure_capacity()?;
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == IoErrorKind::NotFound => return self.record_create(path),
            Err(err) => return Err(io_err(path)(err)),
        };
        let permissions = fs::metadata(path).ok().map(|m| m.permissions());

        let original_size = bytes.len() as u64;
        let snapshot = if bytes.len() <= self.config.memory_threshold {
            Snapshot::Memory(bytes)
        } else {
            Snapshot::Disk(self.spill(&bytes)?)
        };

        let mut entry = Self::entry(op, path, format!("Backup of {}", path.display()), true);
        entry.snapshot = snapshot;
        entry.original_size = original_size;
        entry.permissions = permissions;
        Ok(self.push(entry))
    }

    fn spill(&mut self, bytes: &[u8]) -> Result<PathBuf, LedgerError> {
        let dir = &self.config.backup_dir;
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        self.seq += 1;
        let path = dir.join(format!("{}_{}.bak", Utc::now().timestamp_millis(), self.seq));
        fs::write(&path, bytes).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Record that `path` is about to be created; rollback deletes it.
    pub fn record_create(&mut self, path: &Path) -> Result<usize, LedgerError> {
        self.ensure_capacity()?;
        let entry = Self::entry(
            LedgerOp::FileCreated,
            path,
            format!("Created {}", path.display()),
            true,
        );
        Ok(self.push(entry))
    }

    /// Record a created directory; rollback removes it if it is empty.
    pub fn record_mkdir(&mut self, path: &Path) -> Result<usize, LedgerError> {
        self.ensure_capacity()?;
        let entry = Self::entry(
            LedgerOp::DirCreated,
            path,
            format!("Created directory {}", path.display()),
            true,
        );
        Ok(self.push(entry))
    }

    /// Audit record of a removed directory. Its contents are not kept, so
    /// the entry is not reversible.
    pub fn record_rmdir(&mut self, path: &Path) -> Result<usize, LedgerError> {
        self.ensure_capacity()?;
        let entry = Self::entry(
            LedgerOp::DirDeleted,
            path,
            format!("Removed directory {} (contents are not restored)", path.display()),
            false,
        );
        Ok(self.push(entry))
    }

    /// Audit record of a command run on the user's behalf.
    pub fn record_command(&mut self, command: &str) -> Result<usize, LedgerError> {
        self.ensure_capacity()?;
        let entry = Self::entry(
            LedgerOp::Command,
            Path::new(command),
            format!("Ran `{}`", command),
            false,
        );
        Ok(self.push(entry))
    }

    /// Undo one entry. A second call for the same entry is an error and has
    /// no effect.
    pub fn rollback_entry(&mut self, index: usize) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(LedgerError::NoSuchEntry(index))?;
        if entry.rolled_back {
            return Err(LedgerError::AlreadyRolledBack(index));
        }
        if !entry.can_rollback {
            return Err(LedgerError::NotReversible(index));
        }

        restore(entry)?;

        let entry = &mut self.entries[index];
        if let Snapshot::Disk(spill) = &entry.snapshot {
            if let Err(err) = fs::remove_file(spill) {
                tracing::warn!(path = %spill.display(), error = %err, "failed to remove spilled backup");
            }
            entry.snapshot = Snapshot::None;
        }
        entry.can_rollback = false;
        entry.rolled_back = true;
        tracing::info!(op = %entry.op, target = %entry.target.display(), "rolled back");
        Ok(())
    }

    /// Undo entries at `indices`, newest first. Returns how many were undone.
    fn rollback_indices(&mut self, mut indices: Vec<usize>) -> usize {
        indices.sort_unstable_by(|a, b| b.cmp(a));
        let mut reversed = 0;
        for index in indices {
            let entry = &self.entries[index];
            if !entry.can_rollback {
                continue;
            }
            match self.rollback_entry(index) {
                Ok(()) => reversed += 1,
                Err(err) => tracing::warn!(index, error = %err, "rollback failed"),
            }
        }
        reversed
    }

    /// Undo the most recent `n` entries.
    pub fn rollback_last(&mut self, n: usize) -> usize {
        let start = self.entries.len().saturating_sub(n);
        self.rollback_indices((start..self.entries.len()).collect())
    }

    /// Undo every entry recorded at or after `since`.
    pub fn rollback_since(&mut self, since: DateTime<Utc>) -> usize {
        let indices = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.timestamp >= since)
            .map(|(i, _)| i)
            .collect();
        self.rollback_indices(indices)
    }

    /// Undo every entry from `index` onward.
    pub fn rollback_from(&mut self, index: usize) -> usize {
        let start = index.min(self.entries.len());
        self.rollback_indices((start..self.entries.len()).collect())
    }

    /// Drop entries older than the retention window, deleting their spilled
    /// backups. Shifts indices; do not call while a session holds any.
    pub fn cleanup(&mut self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.retention_days as i64);
        let before = self.entries.len();
        self.entries.retain(|entry| {
            if entry.timestamp >= cutoff {
                return true;
            }
            if let Snapshot::Disk(spill) = &entry.snapshot {
                if let Err(err) = fs::remove_file(spill) {
                    tracing::warn!(path = %spill.display(), error = %err, "failed to remove expired backup");
                }
            }
            false
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "purged expired ledger entries");
        }
        removed
    }
}

fn restore(entry: &RollbackEntry) -> Result<(), LedgerError> {
    let target = entry.target.as_path();
    match entry.op {
        LedgerOp::FileModified | LedgerOp::FileDeleted => {
            let bytes = entry.snapshot.read()?.unwrap_or_default();
            if let Some(parent) = target.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
            }
            fs::write(target, &bytes).map_err(io_err(target))?;
            if let Some(perms) = &entry.permissions {
                fs::set_permissions(target, perms.clone()).map_err(io_err(target))?;
            }
            Ok(())
        }
        LedgerOp::FileCreated => match fs::remove_file(target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(target)(err)),
        },
        LedgerOp::DirCreated => match fs::remove_dir(target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(target)(err)),
        },
        LedgerOp::DirDeleted | LedgerOp::Command => Ok(()),
    }
}
