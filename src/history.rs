//! Fix history persistence
//!
//! Remembers which fixes worked for which error signatures, in
//! `<data_dir>/buildmedic/fix_history.json`:
//! - one entry per (error kind, signature, fix kind, fix target)
//! - success/failure counters and a running average duration
//! - the best-supported fix is offered back to the diagnoser
//!
//! The whole document is loaded on open and rewritten on save, under an
//! exclusive lock on a sibling `.lock` file.

use crate::diagnose::{ErrorDiagnosis, ErrorKind};
use crate::fix::{risk, FixAction, FixKind};
use crate::project::ProjectContext;
use crate::util::write_atomic;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const HISTORY_VERSION: u32 = 1;
const HISTORY_FILE: &str = "fix_history.json";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize fix history: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("timed out waiting for history lock ({0}s)")]
    LockTimeout(u64),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HistoryError + '_ {
    move |source| HistoryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixHistoryEntry {
    pub error_kind: ErrorKind,
    pub signature: String,
    pub fix_kind: FixKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_value: Option<String>,
    #[serde(default)]
    pub fix_description: String,
    #[serde(default)]
    pub project_type: String,
    #[serde(default)]
    pub build_system: String,
    pub success_count: u32,
    pub failure_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub avg_duration_ms: u64,
}

impl FixHistoryEntry {
    pub fn attempts(&self) -> u32 {
        self.success_count + self.failure_count
    }

    pub fn success_ratio(&self) -> f64 {
        match self.attempts() {
            0 => 0.0,
            n => self.success_count as f64 / n as f64,
        }
    }

    fn matches(&self, diagnosis: &ErrorDiagnosis, action: &FixAction) -> bool {
        self.error_kind == diagnosis.kind
            && self.signature == diagnosis.signature
            && self.fix_kind == action.kind
            && self.fix_target == action.target
    }

    /// The fix this entry remembers, ready to be applied again.
    pub fn to_action(&self) -> FixAction {
        let mut action = FixAction {
            kind: self.fix_kind,
            description: if self.fix_description.is_empty() {
                format!("{} (worked before)", self.fix_kind)
            } else {
                self.fix_description.clone()
            },
            command: self.fix_command.clone(),
            target: self.fix_target.clone(),
            value: self.fix_value.clone(),
            requires_confirmation: false,
        };
        action.requires_confirmation = risk::assess(&action).requires_confirmation;
        action
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    #[serde(default)]
    entries: Vec<FixHistoryEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub entries: usize,
    pub unique_errors: usize,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl HistoryStats {
    pub fn success_rate(&self) -> f64 {
        let total = self.total_successes + self.total_failures;
        if total == 0 {
            0.0
        } else {
            self.total_successes as f64 / total as f64
        }
    }

    pub fn display(&self) -> String {
        format!(
            "Fix History\n\
             ───────────\n\
             Entries:        {}\n\
             Unique errors:  {}\n\
             Successes:      {}\n\
             Failures:       {}\n\
             Success rate:   {:.1}%",
            self.entries,
            self.unique_errors,
            self.total_successes,
            self.total_failures,
            self.success_rate() * 100.0
        )
    }
}

/// The learning store. Saved on drop when it holds unsaved changes.
#[derive(Debug)]
pub struct FixHistory {
    path: PathBuf,
    entries: Vec<FixHistoryEntry>,
    dirty: bool,
    save_on_drop: bool,
}

struct HistoryLock {
    file: fs::File,
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FixHistory {
    /// `<data_dir>/buildmedic/fix_history.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("buildmedic").join(HISTORY_FILE))
    }

    /// Open the store at `path`, loading it if present.
    ///
    /// An unreadable document is moved aside to `*.json.corrupt` and the
    /// store starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let mut history = Self {
            path,
            entries: Vec::new(),
            dirty: false,
            save_on_drop: true,
        };
        history.load()?;
        Ok(history)
    }

    /// An empty store that does not load `path` and only writes it on an
    /// explicit [`save`](Self::save).
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            dirty: false,
            save_on_drop: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<(), HistoryError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(&self.path)(err)),
        };

        match serde_json::from_str::<HistoryFile>(&content) {
            Ok(file) if file.version == HISTORY_VERSION => {
                tracing::debug!(entries = file.entries.len(), path = %self.path.display(), "loaded fix history");
                self.entries = file.entries;
            }
            Ok(file) => {
                tracing::warn!(version = file.version, "unsupported fix history version; starting fresh");
                preserve_corrupt(&self.path, &content);
            }
            Err(err) => {
                tracing::warn!(error = %err, "fix history was corrupted; a backup was saved");
                preserve_corrupt(&self.path, &content);
            }
        }
        Ok(())
    }

    /// Upsert the outcome of one attempt.
    pub fn record(
        &mut self,
        diagnosis: &ErrorDiagnosis,
        action: &FixAction,
        success: bool,
        duration_ms: u64,
    ) {
        self.record_in(diagnosis, action, success, duration_ms, None);
    }

    /// [`record`](Self::record), also noting the project the fix ran in.
    pub fn record_in(
        &mut self,
        diagnosis: &ErrorDiagnosis,
        action: &FixAction,
        success: bool,
        duration_ms: u64,
        project: Option<&ProjectContext>,
    ) {
        let now = Utc::now();
        let index = match self
            .entries
            .iter()
            .position(|entry| entry.matches(diagnosis, action))
        {
            Some(index) => index,
            None => {
                self.entries.push(FixHistoryEntry {
                    error_kind: diagnosis.kind,
                    signature: diagnosis.signature.clone(),
                    fix_kind: action.kind,
                    fix_command: action.command.clone(),
                    fix_target: action.target.clone(),
                    fix_value: action.value.clone(),
                    fix_description: action.description.clone(),
                    project_type: String::new(),
                    build_system: String::new(),
                    success_count: 0,
                    failure_count: 0,
                    first_seen: now,
                    last_seen: now,
                    avg_duration_ms: 0,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        let n = entry.attempts() as u128;
        let total = entry.avg_duration_ms as u128 * (n - 1) + duration_ms as u128;
        entry.avg_duration_ms = ((total + n / 2) / n) as u64;
        entry.last_seen = now;
        entry.fix_command = action.command.clone();
        entry.fix_value = action.value.clone();
        if let Some(project) = project {
            entry.project_type = project.project_type().to_string();
            entry.build_system = project.build_system.name().to_string();
        }
        self.dirty = true;

        tracing::debug!(
            signature = %diagnosis.signature,
            fix = %action.kind,
            success,
            "recorded fix attempt"
        );
    }

    /// Entries for the diagnosis' signature, best success ratio first, then
    /// most recently seen.
    pub fn lookup(&self, diagnosis: &ErrorDiagnosis) -> Vec<&FixHistoryEntry> {
        let mut found: Vec<&FixHistoryEntry> = self
            .entries
            .iter()
            .filter(|e| e.error_kind == diagnosis.kind && e.signature == diagnosis.signature)
            .collect();
        found.sort_by(|a, b| {
            b.success_ratio()
                .total_cmp(&a.success_ratio())
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        found
    }

    /// The best-supported fix, if it has ever succeeded.
    pub fn suggest(&self, diagnosis: &ErrorDiagnosis) -> Option<FixAction> {
        self.lookup(diagnosis)
            .into_iter()
            .find(|entry| entry.success_count > 0)
            .map(FixHistoryEntry::to_action)
    }

    pub fn entries(&self) -> &[FixHistoryEntry] {
        &self.entries
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn stats(&self) -> HistoryStats {
        let unique: HashSet<(&ErrorKind, &str)> = self
            .entries
            .iter()
            .map(|e| (&e.error_kind, e.signature.as_str()))
            .collect();
        HistoryStats {
            entries: self.entries.len(),
            unique_errors: unique.len(),
            total_successes: self.entries.iter().map(|e| e.success_count as u64).sum(),
            total_failures: self.entries.iter().map(|e| e.failure_count as u64).sum(),
        }
    }

    /// Keep the `max_entries` most recently seen entries. Returns how many
    /// were dropped.
    pub fn prune(&mut self, max_entries: usize) -> usize {
        if self.entries.len() <= max_entries {
            return 0;
        }
        self.entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        let dropped = self.entries.len() - max_entries;
        self.entries.truncate(max_entries);
        self.dirty = true;
        dropped
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Write the whole document atomically.
    pub fn save(&mut self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err(parent))?;
            }
        }

        let _lock = self.lock()?;
        let document = HistoryFile {
            version: HISTORY_VERSION,
            entries: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&document)?;
        write_atomic(&self.path, content.as_bytes()).map_err(io_err(&self.path))?;
        self.dirty = false;
        tracing::debug!(entries = self.entries.len(), path = %self.path.display(), "saved fix history");
        Ok(())
    }

    fn lock(&self) -> Result<HistoryLock, HistoryError> {
        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(HistoryLock { file }),
                Err(err) if err.kind() == IoErrorKind::WouldBlock => {
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(HistoryError::LockTimeout(LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
                Err(err) => return Err(io_err(&lock_path)(err)),
            }
        }
    }
}

impl Drop for FixHistory {
    fn drop(&mut self) {
        if self.dirty && self.save_on_drop {
            if let Err(err) = self.save() {
                tracing::warn!(error = %err, "failed to save fix history on shutdown");
            }
        }
    }
}

fn preserve_corrupt(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnose::{Catalog, Diagnoser};
    use tempfile::tempdir;

    fn header_diagnosis() -> ErrorDiagnosis {
        let catalog = Catalog::builtin();
        Diagnoser::new(&catalog).diagnose("fatal error: SDL2/SDL.h: No such file or directory", None)
    }

    #[test]
    fn test_repeated_records_aggregate() {
        let dir = tempdir().unwrap();
        let mut history = FixHistory::open(dir.path().join(HISTORY_FILE)).unwrap();
        let diag = header_diagnosis();
        let fix = FixAction::install_package("libsdl2-dev");

        for _ in 0..3 {
            history.record(&diag, &fix, true, 100);
        }

        let stats = history.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.unique_errors, 1);
        assert_eq!(stats.total_successes, 3);
        assert_eq!(history.lookup(&diag)[0].success_count, 3);
        assert_eq!(history.suggest(&diag), Some(fix.clone()));
    }

    #[test]
    fn test_running_average_duration() {
        let dir = tempdir().unwrap();
        let mut history = FixHistory::open(dir.path().join(HISTORY_FILE)).unwrap();
        let diag = header_diagnosis();
        let fix = FixAction::retry();
        history.record(&diag, &fix, false, 100);
        history.record(&diag, &fix, true, 200);
        history.record(&diag, &fix, true, 600);
        assert_eq!(history.entries()[0].avg_duration_ms, 300);
        assert_eq!(history.entries()[0].failure_count, 1);
    }

    #[test]
    fn test_suggest_requires_a_success() {
        let dir = tempdir().unwrap();
        let mut history = FixHistory::open(dir.path().join(HISTORY_FILE)).unwrap();
        let diag = header_diagnosis();
        history.record(&diag, &FixAction::install_package("libsdl2-dev"), false, 10);
        assert!(history.suggest(&diag).is_none());
        assert_eq!(history.lookup(&diag).len(), 1);
    }

    #[test]
    fn test_lookup_orders_by_success_ratio() {
        let dir = tempdir().unwrap();
        let mut history = FixHistory::open(dir.path().join(HISTORY_FILE)).unwrap();
        let diag = header_diagnosis();
        let weak = FixAction::clean_build(None);
        let strong = FixAction::install_package("libsdl2-dev");
        history.record(&diag, &weak, true, 10);
        history.record(&diag, &weak, false, 10);
        history.record(&diag, &strong, true, 10);

        let found = history.lookup(&diag);
        assert_eq!(found[0].fix_kind, FixKind::InstallPackage);
        assert_eq!(found[1].fix_kind, FixKind::CleanBuild);
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(HISTORY_FILE);
        let diag = header_diagnosis();
        let env_fix = FixAction::set_env("MAKEFLAGS", "-j1");
        let install = FixAction::install_package("libsdl2-dev");
        let saved = {
            let mut history = FixHistory::open(&path).unwrap();
            history.record(&diag, &env_fix, true, 42);
            history.record(&diag, &env_fix, false, 10);
            history.record(&diag, &install, false, 900);
            history.record(&diag, &install, false, 700);
            history.record(&diag, &install, true, 800);
            history.save().unwrap();
            assert!(!history.is_dirty());
            counts(&history)
        };

        let reloaded = FixHistory::open(&path).unwrap();
        assert_eq!(reloaded.entries().len(), 2);
        assert_eq!(counts(&reloaded), saved);
        assert!(saved.iter().any(|(_, s, f)| *s == 1 && *f == 1));
        assert!(saved.iter().any(|(_, s, f)| *s == 1 && *f == 2));
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"version\": 1"));
    }

    fn counts(history: &FixHistory) -> Vec<(String, u32, u32)> {
        history
            .entries()
            .iter()
            .map(|e| (e.fix_description.clone(), e.success_count, e.failure_count))
            .collect()
    }

    #[test]
    fn test_in_memory_history_is_not_saved_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        {
            let mut history = FixHistory::in_memory(&path);
            history.record(&header_diagnosis(), &FixAction::retry(), true, 1);
            assert!(history.is_dirty());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_dirty_history_saves_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        {
            let mut history = FixHistory::open(&path).unwrap();
            history.record(&header_diagnosis(), &FixAction::retry(), true, 1);
        }
        assert_eq!(FixHistory::open(&path).unwrap().entries().len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(HISTORY_FILE);
        fs::write(&path, "{not json").unwrap();

        let history = FixHistory::open(&path).unwrap();
        assert!(history.entries().is_empty());
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let mut history = FixHistory::open(dir.path().join(HISTORY_FILE)).unwrap();
        let diag = header_diagnosis();
        history.record(&diag, &FixAction::install_package("a"), true, 1);
        history.record(&diag, &FixAction::install_package("b"), true, 1);
        history.record(&diag, &FixAction::install_package("c"), true, 1);

        assert_eq!(history.prune(2), 1);
        assert_eq!(history.entries().len(), 2);
        assert_eq!(history.prune(5), 0);

        history.clear();
        assert!(history.entries().is_empty());
    }
}
