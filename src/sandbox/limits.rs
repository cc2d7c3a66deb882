//! Platform resource limiting
//!
//! POSIX installs `setrlimit` caps in the forked child before `exec`, so they
//! cover the whole program lifetime. Windows has no pre-exec hook; the child
//! is assigned to a job object immediately after spawn.

use std::io;
use std::process::{Child, Command};

/// Caps applied to one child process. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: Option<u64>,
    pub cpu_secs: Option<u64>,
    pub open_files: Option<u64>,
    pub file_size_bytes: Option<u64>,
    /// `Some(0)` forbids the child from spawning processes.
    pub max_processes: Option<u64>,
}

impl ResourceLimits {
    pub fn is_unlimited(&self) -> bool {
        *self == Self::default()
    }
}

/// Keeps platform limit state alive until the child is reaped.
#[derive(Debug, Default)]
pub struct LimitGuard {
    #[cfg(windows)]
    job: Option<windows_job::JobHandle>,
}

/// `apply_limits` contract shared by both platform implementations.
pub trait ResourceLimiter {
    /// Prepare the command before spawning.
    fn before_spawn(&self, command: &mut Command, limits: &ResourceLimits);

    /// Attach limits to the freshly spawned child.
    fn after_spawn(&self, child: &Child, limits: &ResourceLimits) -> io::Result<LimitGuard>;
}

#[cfg(unix)]
pub type PlatformLimiter = PosixLimiter;

#[cfg(windows)]
pub type PlatformLimiter = JobObjectLimiter;

#[cfg(not(any(unix, windows)))]
pub type PlatformLimiter = NoopLimiter;

/// Fallback for targets without a limiting primitive.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {
    fn before_spawn(&self, _command: &mut Command, limits: &ResourceLimits) {
        if !limits.is_unlimited() {
            tracing::warn!("resource limits are not supported on this platform");
        }
    }

    fn after_spawn(&self, _child: &Child, _limits: &ResourceLimits) -> io::Result<LimitGuard> {
        Ok(LimitGuard::default())
    }
}

#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixLimiter;

#[cfg(unix)]
impl ResourceLimiter for PosixLimiter {
    fn before_spawn(&self, command: &mut Command, limits: &ResourceLimits) {
        use std::os::unix::process::CommandExt;

        if limits.is_unlimited() {
            return;
        }
        let limits = *limits;
        // SAFETY: the closure only calls getrlimit/setrlimit, which are
        // async-signal-safe, and allocates nothing.
        unsafe {
            command.pre_exec(move || posix::apply(&limits));
        }
    }

    fn after_spawn(&self, _child: &Child, _limits: &ResourceLimits) -> io::Result<LimitGuard> {
        Ok(LimitGuard::default())
    }
}

#[cfg(unix)]
mod posix {
    use super::ResourceLimits;
    use std::io;

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    type Resource = libc::__rlimit_resource_t;
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    type Resource = libc::c_int;

    pub(super) fn apply(limits: &ResourceLimits) -> io::Result<()> {
        if let Some(secs) = limits.cpu_secs {
            // Soft cap delivers SIGXCPU; the hard cap one second later is SIGKILL.
            set_limit(libc::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        if let Some(bytes) = limits.memory_bytes {
            set_limit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(files) = limits.open_files {
            set_limit(libc::RLIMIT_NOFILE, files, files)?;
        }
        if let Some(bytes) = limits.file_size_bytes {
            set_limit(libc::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(procs) = limits.max_processes {
            set_limit(libc::RLIMIT_NPROC, procs, procs)?;
        }
        Ok(())
    }

    fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `current` is a valid, writable rlimit struct.
        if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
            return Err(io::Error::last_os_error());
        }

        // An unprivileged process may only lower its hard limit.
        let hard = (hard as libc::rlim_t).min(current.rlim_max);
        let soft = (soft as libc::rlim_t).min(hard);
        let wanted = libc::rlimit {
            rlim_cur: soft,
            rlim_max: hard,
        };
        // SAFETY: `wanted` is a valid rlimit struct.
        if unsafe { libc::setrlimit(resource, &wanted) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct JobObjectLimiter;

#[cfg(windows)]
impl ResourceLimiter for JobObjectLimiter {
    fn before_spawn(&self, _command: &mut Command, _limits: &ResourceLimits) {}

    fn after_spawn(&self, child: &Child, limits: &ResourceLimits) -> io::Result<LimitGuard> {
        if limits.is_unlimited() {
            return Ok(LimitGuard::default());
        }
        let job = windows_job::JobHandle::for_child(child, limits)?;
        Ok(LimitGuard { job: Some(job) })
    }
}

#[cfg(windows)]
mod windows_job {
    use super::ResourceLimits;
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::process::Child;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE};
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_ACTIVE_PROCESS, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
        JOB_OBJECT_LIMIT_PROCESS_MEMORY, JOB_OBJECT_LIMIT_PROCESS_TIME,
    };

    #[derive(Debug)]
    pub struct JobHandle(HANDLE);

    impl JobHandle {
        pub fn for_child(child: &Child, limits: &ResourceLimits) -> io::Result<Self> {
            // SAFETY: null attributes and name create an anonymous job.
            let handle = unsafe { CreateJobObjectW(None, PCWSTR::null()) }
                .map_err(|e| io::Error::other(e.to_string()))?;
            let job = JobHandle(handle);

            let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            let mut flags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            if let Some(secs) = limits.cpu_secs {
                // 100ns ticks
                info.BasicLimitInformation.PerProcessUserTimeLimit =
                    (secs as i64).saturating_mul(10_000_000);
                flags |= JOB_OBJECT_LIMIT_PROCESS_TIME;
            }
            if let Some(bytes) = limits.memory_bytes {
                info.ProcessMemoryLimit = bytes as usize;
                flags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
            }
            if limits.max_processes == Some(0) {
                info.BasicLimitInformation.ActiveProcessLimit = 1;
                flags |= JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
            }
            info.BasicLimitInformation.LimitFlags = flags;

            // SAFETY: `info` outlives the call and the size matches its type.
            unsafe {
                SetInformationJobObject(
                    job.0,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const core::ffi::c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
            }
            .map_err(|e| io::Error::other(e.to_string()))?;

            let process = HANDLE(child.as_raw_handle());
            // SAFETY: both handles are live for the duration of the call.
            unsafe { AssignProcessToJobObject(job.0, process) }
                .map_err(|e| io::Error::other(e.to_string()))?;

            Ok(job)
        }
    }

    impl Drop for JobHandle {
        fn drop(&mut self) {
            // SAFETY: the handle was created by CreateJobObjectW and is closed once.
            let _ = unsafe { CloseHandle(self.0) };
        }
    }
}
