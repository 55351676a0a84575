//! Child-side resource limits and process-group signalling.

use std::io;

use crate::config::RunnerConfig;
use crate::program::ResourceLimits;

macro_rules! set_rlimit {
    ($resource:expr, $value:expr) => {{
        let value = $value as libc::rlim_t;
        let limit = libc::rlimit {
            rlim_cur: value,
            rlim_max: value,
        };
        if libc::setrlimit($resource, &limit) != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

/// Limits installed in the forked child right before `exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildLimits {
    pub cpu_seconds: u64,
    pub address_space_bytes: u64,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub isolate_namespaces: bool,
}

impl ChildLimits {
    pub fn new(limits: &ResourceLimits, runner: &RunnerConfig) -> Self {
        // Wall-clock timeout rounded up, plus one second of slack so the
        // watchdog normally fires before the kernel does.
        let millis = u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX);
        let cpu_seconds = millis.div_ceil(1000).saturating_add(1);
        Self {
            cpu_seconds,
            address_space_bytes: limits.max_memory_bytes,
            file_size_bytes: runner.max_file_bytes,
            open_files: runner.max_open_files,
            isolate_namespaces: runner.isolate_namespaces,
        }
    }

    /// Runs between `fork` and `exec`: async-signal-safe calls only, no
    /// allocation, no locks.
    pub fn apply(&self) -> io::Result<()> {
        // SAFETY: setpgid/setrlimit/unshare are async-signal-safe and only
        // touch the calling (child) process.
        unsafe {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            set_rlimit!(libc::RLIMIT_CPU, self.cpu_seconds);
            set_rlimit!(libc::RLIMIT_AS, self.address_space_bytes);
            set_rlimit!(libc::RLIMIT_FSIZE, self.file_size_bytes);
            set_rlimit!(libc::RLIMIT_NOFILE, self.open_files);
            set_rlimit!(libc::RLIMIT_CORE, 0);

            #[cfg(target_os = "linux")]
            if self.isolate_namespaces {
                // Best effort: fails without unprivileged user namespaces,
                // in which case the child keeps the host namespaces.
                let _ = libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET);
            }
        }
        Ok(())
    }
}

/// SIGKILL every process in group `pgid`. Errors (typically ESRCH, the
/// group is already gone) are ignored.
pub(crate) fn kill_process_group(pgid: i32) {
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg has no memory-safety preconditions; pgid > 1 rules
    // out our own group (0) and init.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

/// True while any process in group `pgid` exists.
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: signal 0 performs the existence/permission check only.
    unsafe { libc::kill(-pgid, 0) == 0 }
}
