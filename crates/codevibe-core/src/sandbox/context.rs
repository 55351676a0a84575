//! Per-run sandbox resources and their guaranteed release.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tempfile::TempDir;
use tokio::process::Child;

use super::error::{SandboxError, SandboxResult};
use super::limits::kill_process_group;
use crate::obs;

/// Name of the program file inside the sandbox directory.
pub const PROGRAM_FILE: &str = "main.py";

/// Owns the sandbox directory and the child process for one run.
///
/// [`SandboxContext::release`] is the normal exit path. `Drop` is the
/// backstop for early returns and dropped futures: it kills the process
/// group, and `kill_on_drop` plus `TempDir` take care of the rest.
#[derive(Debug)]
pub(crate) struct SandboxContext {
    dir: Option<TempDir>,
    child: Option<Child>,
    pgid: Option<i32>,
}

impl SandboxContext {
    pub fn create(root: Option<&Path>) -> SandboxResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codevibe-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Workspace)?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(SandboxError::Workspace)?;
        Ok(Self {
            dir: Some(dir),
            child: None,
            pgid: None,
        })
    }

    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    pub async fn write_program(&self, text: &str) -> SandboxResult<PathBuf> {
        let path = self.path().join(PROGRAM_FILE);
        tokio::fs::write(&path, text)
            .await
            .map_err(|source| SandboxError::WriteProgram {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Take ownership of a freshly spawned child. The child is its own
    /// process-group leader, so its pid doubles as the pgid.
    pub fn attach(&mut self, child: Child) -> SandboxResult<u32> {
        let pid = child.id().ok_or(SandboxError::MissingPid)?;
        self.pgid = i32::try_from(pid).ok();
        self.child = Some(child);
        Ok(pid)
    }

    /// Block until the child has exited, leaving it unreaped. While the
    /// zombie exists its pid, and with it the process-group id, cannot be
    /// handed to another process, so the group can still be signalled.
    pub async fn wait_exited(&self) -> SandboxResult<()> {
        let pid = self.pgid.ok_or(SandboxError::MissingPid)?;
        let pid = libc::id_t::try_from(pid).map_err(|_| SandboxError::MissingPid)?;
        tokio::task::spawn_blocking(move || loop {
            // SAFETY: siginfo_t is plain data; waitid only writes into it.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::waitid(libc::P_PID, pid, &mut info, libc::WEXITED | libc::WNOWAIT)
            };
            if rc == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err);
            }
        })
        .await
        .map_err(|err| SandboxError::Wait(std::io::Error::other(err)))?
        .map_err(SandboxError::Wait)
    }

    /// Reap the child. Its process group is forgotten afterwards: once
    /// reaped, the id may belong to someone else.
    pub async fn wait(&mut self) -> SandboxResult<ExitStatus> {
        let child = self.child.as_mut().ok_or(SandboxError::MissingPid)?;
        let status = child.wait().await.map_err(SandboxError::Wait)?;
        self.pgid = None;
        Ok(status)
    }

    /// Kill whatever is left of the process group, reap the child and
    /// remove the directory.
    pub async fn release(mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.wait().await {
                tracing::warn!(event = "sandbox.reap_failed", error = %err);
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => obs::emit_sandbox_released(&path),
                Err(err) => tracing::warn!(
                    event = "sandbox.cleanup_failed",
                    path = %path.display(),
                    error = %err,
                ),
            }
        }
    }
}

impl Drop for SandboxContext {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            tracing::debug!(event = "sandbox.dropped", pgid);
            kill_process_group(pgid);
        }
    }
}
