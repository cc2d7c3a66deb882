//! Sandboxed command execution
//!
//! Runs one command with stdio piped and best-effort resource caps. This is
//! resource limiting, not a jail: network denial in particular is advisory.
//!
//! Each call owns its child process, so independent calls may run in
//! parallel.

mod limits;

pub use limits::{LimitGuard, PlatformLimiter, ResourceLimiter, ResourceLimits};

use crate::util::{canonicalize_existing_parent, combine_output, shell_invocation};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to apply resource limits: {0}")]
    Limits(#[source] std::io::Error),
    #[error("failed to capture {0}")]
    Capture(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxLevel {
    /// Plain execution.
    #[default]
    None,
    Light,
    Medium,
    /// Writes denied outside the allowlist; no subprocesses.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub level: SandboxLevel,
    pub allow_network: bool,
    pub allow_subprocess: bool,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub max_memory_bytes: Option<u64>,
    pub max_cpu_secs: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::for_level(SandboxLevel::None)
    }
}

impl SandboxConfig {
    /// Default caps for a level. Callers override individual fields.
    pub fn for_level(level: SandboxLevel) -> Self {
        let (memory, cpu, files, allow_network, allow_subprocess) = match level {
            SandboxLevel::None => (None, None, None, true, true),
            SandboxLevel::Light => (None, Some(600), Some(4096), true, true),
            SandboxLevel::Medium => (Some(4096 * MIB), Some(300), Some(1024), true, true),
            SandboxLevel::Strict => (Some(1024 * MIB), Some(60), Some(256), false, false),
        };
        Self {
            level,
            allow_network,
            allow_subprocess,
            read_paths: Vec::new(),
            write_paths: Vec::new(),
            max_memory_bytes: memory,
            max_cpu_secs: cpu,
            max_open_files: files,
            max_file_size_bytes: None,
            env: Vec::new(),
        }
    }

    pub fn with_cpu_secs(mut self, secs: u64) -> Self {
        self.max_cpu_secs = Some(secs);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    pub fn allow_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.write_paths.push(path.into());
        self
    }

    /// Limits actually installed; level `None` installs nothing.
    pub fn limits(&self) -> ResourceLimits {
        if self.level == SandboxLevel::None {
            return ResourceLimits::default();
        }
        ResourceLimits {
            memory_bytes: self.max_memory_bytes,
            cpu_secs: self.max_cpu_secs,
            open_files: self.max_open_files,
            file_size_bytes: self.max_file_size_bytes,
            max_processes: if self.allow_subprocess { None } else { Some(0) },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxResult {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub was_killed: bool,
    pub kill_reason: Option<String>,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
    pub wall_time: Duration,
}

impl SandboxResult {
    pub fn output(&self) -> String {
        combine_output(&self.stdout, &self.stderr)
    }
}

/// The sandboxed executor: one config, any number of runs.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<SandboxResult, SandboxError> {
        run(program, args, cwd, &self.config)
    }

    /// Run a command line through the platform shell.
    pub fn run_shell(&self, command: &str, cwd: &Path) -> Result<SandboxResult, SandboxError> {
        let (program, args) = shell_invocation(command);
        run(&program, &args, cwd, &self.config)
    }

    pub fn path_allowed(&self, path: &Path, for_write: bool) -> bool {
        path_allowed(&self.config, path, for_write)
    }
}

/// Spawn `program` under `config`, wait for it, and capture everything.
pub fn run(
    program: &str,
    args: &[String],
    cwd: &Path,
    config: &SandboxConfig,
) -> Result<SandboxResult, SandboxError> {
    let limits = config.limits();
    let limiter = PlatformLimiter::default();

    if !config.allow_network && config.level != SandboxLevel::None {
        tracing::debug!(program, "network denial is advisory and not enforced");
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &config.env {
        command.env(key, value);
    }
    limiter.before_spawn(&mut command, &limits);

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let guard = match limiter.after_spawn(&child, &limits) {
        Ok(guard) => guard,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SandboxError::Limits(err));
        }
    };

    let stdout = child.stdout.take().ok_or(SandboxError::Capture("stdout"))?;
    let stderr = child.stderr.take().ok_or(SandboxError::Capture("stderr"))?;
    let stdout_handle = thread::spawn(move || read_all(stdout));
    let stderr_handle = thread::spawn(move || read_all(stderr));

    let reaped = wait_with_usage(&mut child)?;
    let wall_time = start.elapsed();
    drop(guard);

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    let kill_reason = classify_termination(&reaped.status, &limits, reaped.cpu_time);
    let result = SandboxResult {
        exit_code: reaped.status.code(),
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        success: reaped.status.success(),
        was_killed: kill_reason.is_some(),
        kill_reason,
        cpu_time: reaped.cpu_time,
        peak_memory_bytes: reaped.peak_memory_bytes,
        wall_time,
    };

    if result.was_killed {
        tracing::warn!(
            program,
            reason = result.kill_reason.as_deref().unwrap_or(""),
            "sandboxed command was killed"
        );
    } else {
        tracing::debug!(program, code = ?result.exit_code, "sandboxed command finished");
    }

    Ok(result)
}

fn read_all(reader: impl Read) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut reader = BufReader::new(reader);
    let _ = reader.read_to_end(&mut buf);
    buf
}

struct Reaped {
    status: ExitStatus,
    cpu_time: Duration,
    peak_memory_bytes: u64,
}

#[cfg(unix)]
fn wait_with_usage(child: &mut Child) -> Result<Reaped, SandboxError> {
    use std::os::unix::process::ExitStatusExt;

    let pid = child.id() as libc::pid_t;
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; wait4 fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: `status` and `usage` are valid for writes; `pid` is our child.
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(SandboxError::Wait(err));
        }
    }

    let cpu_time = timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime);
    // ru_maxrss is kilobytes on Linux, bytes on macOS.
    let maxrss = usage.ru_maxrss.max(0) as u64;
    let peak_memory_bytes = if cfg!(target_os = "macos") {
        maxrss
    } else {
        maxrss * 1024
    };

    Ok(Reaped {
        status: ExitStatus::from_raw(status),
        cpu_time,
        peak_memory_bytes,
    })
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

#[cfg(not(unix))]
fn wait_with_usage(child: &mut Child) -> Result<Reaped, SandboxError> {
    let start = Instant::now();
    let status = child.wait().map_err(SandboxError::Wait)?;
    Ok(Reaped {
        status,
        // Job accounting is not queried; wall time bounds CPU time.
        cpu_time: start.elapsed(),
        peak_memory_bytes: 0,
    })
}

#[cfg(unix)]
fn classify_termination(
    status: &ExitStatus,
    limits: &ResourceLimits,
    cpu_time: Duration,
) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let signal = status.signal()?;
    match signal {
        libc::SIGXCPU => Some(format!(
            "CPU time limit exceeded ({}s)",
            limits.cpu_secs.unwrap_or_default()
        )),
        libc::SIGXFSZ => Some("file size limit exceeded".to_string()),
        libc::SIGKILL if !limits.is_unlimited() => match limits.cpu_secs {
            Some(cap) if cpu_time.as_secs() >= cap => {
                Some(format!("CPU time hard limit exceeded ({}s)", cap))
            }
            _ => Some("killed by SIGKILL (resource limit or OOM killer)".to_string()),
        },
        libc::SIGSEGV | libc::SIGABRT | libc::SIGBUS if limits.memory_bytes.is_some() => Some(
            format!("memory limit likely exceeded (signal {})", signal),
        ),
        _ => None,
    }
}

#[cfg(not(unix))]
fn classify_termination(
    status: &ExitStatus,
    limits: &ResourceLimits,
    cpu_time: Duration,
) -> Option<String> {
    // Job objects terminate with ERROR_NOT_ENOUGH_QUOTA when a cap trips.
    const ERROR_NOT_ENOUGH_QUOTA: i32 = 1816;
    if limits.is_unlimited() || status.code() != Some(ERROR_NOT_ENOUGH_QUOTA) {
        return None;
    }
    match limits.cpu_secs {
        Some(cap) if cpu_time.as_secs() >= cap => {
            Some(format!("CPU time limit exceeded ({}s)", cap))
        }
        _ => Some("job object resource limit exceeded".to_string()),
    }
}

/// Whether a fix may read (or write) `path` under `config`.
///
/// `Strict` denies writes outside `write_paths`; other levels restrict only
/// once an allowlist is configured. Level `None` allows everything.
pub fn path_allowed(config: &SandboxConfig, path: &Path, for_write: bool) -> bool {
    if config.level == SandboxLevel::None {
        return true;
    }

    let allowlist = if for_write {
        &config.write_paths
    } else {
        &config.read_paths
    };
    if allowlist.is_empty() {
        return !(for_write && config.level == SandboxLevel::Strict);
    }

    let Some(resolved) = resolve_for_check(path) else {
        return false;
    };
    allowlist.iter().any(|allowed| {
        resolve_for_check(allowed)
            .map(|allowed| resolved.starts_with(&allowed))
            .unwrap_or(false)
    })
}

/// Canonical form of `path`, tolerating components that do not exist yet.
fn resolve_for_check(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Some(canonical);
    }
    let base = canonicalize_existing_parent(path).ok()?;

    let mut existing = path.to_path_buf();
    while !existing.exists() {
        if !existing.pop() {
            return None;
        }
    }
    let rest = path.strip_prefix(&existing).ok()?;
    if rest
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return None;
    }
    Some(base.join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> (String, Vec<String>) {
        shell_invocation(script)
    }

    #[cfg(unix)]
    #[test]
    fn test_plain_run_captures_output_and_status() {
        let dir = tempdir().unwrap();
        let (program, args) = sh("echo hello; echo oops >&2; exit 3");
        let result = run(&program, &args, dir.path(), &SandboxConfig::default()).unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success);
        assert!(!result.was_killed);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_cpu_cap_kills_busy_loop() {
        let dir = tempdir().unwrap();
        let config = SandboxConfig::for_level(SandboxLevel::Light).with_cpu_secs(1);
        let (program, args) = sh("while :; do :; done");
        let result = run(&program, &args, dir.path(), &config).unwrap();
        assert!(result.was_killed);
        assert!(!result.success);
        assert!(result
            .kill_reason
            .as_deref()
            .is_some_and(|reason| !reason.is_empty()));
        assert!(result.cpu_time >= Duration::from_millis(900));
    }

    #[cfg(unix)]
    #[test]
    fn test_sigkill_without_limits_is_not_a_limit_kill() {
        use std::os::unix::process::ExitStatusExt;

        let killed = ExitStatus::from_raw(libc::SIGKILL);
        let unlimited = ResourceLimits::default();
        assert_eq!(classify_termination(&killed, &unlimited, Duration::ZERO), None);

        let capped = ResourceLimits {
            memory_bytes: Some(64 << 20),
            ..ResourceLimits::default()
        };
        assert!(classify_termination(&killed, &capped, Duration::ZERO).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_self_kill_in_unlimited_sandbox_is_plain_failure() {
        let dir = tempdir().unwrap();
        let (program, args) = sh("kill -9 $$");
        let result = run(&program, &args, dir.path(), &SandboxConfig::default()).unwrap();
        assert!(!result.success);
        assert!(!result.was_killed);
        assert_eq!(result.kill_reason, None);
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let err = run(
            "buildmedic-definitely-not-a-program",
            &[],
            dir.path(),
            &SandboxConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }));
    }

    #[test]
    fn test_level_none_installs_no_limits() {
        let config = SandboxConfig {
            max_cpu_secs: Some(1),
            ..SandboxConfig::default()
        };
        assert!(config.limits().is_unlimited());
        assert_eq!(
            SandboxConfig::for_level(SandboxLevel::Strict).limits().max_processes,
            Some(0)
        );
    }

    #[test]
    fn test_strict_denies_writes_without_allowlist() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let strict = SandboxConfig::for_level(SandboxLevel::Strict);
        assert!(!path_allowed(&strict, &target, true));
        assert!(path_allowed(&strict, &target, false));

        let allowed = strict.allow_write(dir.path());
        assert!(path_allowed(&allowed, &target, true));
        assert!(path_allowed(&allowed, &dir.path().join("new/deeper.txt"), true));
    }

    #[test]
    fn test_allowlist_rejects_escapes() {
        let root = tempdir().unwrap();
        let inside = root.path().join("inside");
        std::fs::create_dir_all(&inside).unwrap();
        let config = SandboxConfig::for_level(SandboxLevel::Medium).allow_write(&inside);

        assert!(path_allowed(&config, &inside.join("a.txt"), true));
        assert!(!path_allowed(&config, &root.path().join("outside.txt"), true));
        assert!(!path_allowed(&config, &inside.join("missing/../../x.txt"), true));
    }

    #[test]
    fn test_level_none_allows_everything() {
        let config = SandboxConfig::default();
        assert!(path_allowed(&config, Path::new("/definitely/anywhere"), true));
    }
}
