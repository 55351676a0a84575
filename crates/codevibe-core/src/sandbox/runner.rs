//! The sandbox runner: one isolated interpreter process per program.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::capture::{capture, CapturedStream};
use super::context::{SandboxContext, PROGRAM_FILE};
use super::error::{SandboxError, SandboxResult};
use super::limits::{kill_process_group, ChildLimits};
use super::watchdog::{Completion, CompletionClaim, Watchdog};
use crate::config::RunnerConfig;
use crate::metrics::METRICS;
use crate::obs;
use crate::program::{ResourceLimits, SourceProgram};

/// How the sandboxed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own with this status code.
    Exited { code: i32 },
    /// Killed by a signal the runner did not send (crash, rlimit).
    Signaled { signal: i32 },
    /// Killed by the watchdog after the wall-clock limit.
    TimedOut,
    /// Killed because the caller cancelled.
    Cancelled,
}

/// Everything observed about one sandboxed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExecutionOutcome {
    pub termination: Termination,
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
    /// The limits the run was held to.
    pub limits: ResourceLimits,
    /// `None` when the run was cancelled before a process existed.
    pub pid: Option<u32>,
}

impl RawExecutionOutcome {
    /// Outcome for a run cancelled before spawning.
    pub fn cancelled_before_start(limits: ResourceLimits) -> Self {
        Self {
            termination: Termination::Cancelled,
            stdout: CapturedStream::default(),
            stderr: CapturedStream::default(),
            duration: Duration::ZERO,
            limits,
            pid: None,
        }
    }

    pub fn truncated(&self) -> bool {
        self.stdout.truncated || self.stderr.truncated
    }
}

/// Executes a program under resource limits.
///
/// Implementations must leave nothing behind: no process, no directory,
/// whichever way the run ends.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn run(
        &self,
        program: &SourceProgram,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> SandboxResult<RawExecutionOutcome>;
}

/// [`SandboxRunner`] that spawns the configured interpreter in a fresh
/// private directory with a scrubbed environment and kernel rlimits.
#[derive(Debug)]
pub struct ProcessRunner {
    config: RunnerConfig,
    spawned: AtomicU64,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Processes spawned by this runner so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    fn command(&self, dir: &Path, limits: &ResourceLimits) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(PROGRAM_FILE)
            .current_dir(dir)
            .env_clear()
            .env("PATH", &self.config.path_env)
            .env("HOME", dir)
            .env("TMPDIR", dir)
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child_limits = ChildLimits::new(limits, &self.config);
        // SAFETY: the closure only calls async-signal-safe libc functions
        // and does not allocate.
        unsafe {
            cmd.pre_exec(move || child_limits.apply());
        }
        cmd
    }

    async fn run_in(
        &self,
        ctx: &mut SandboxContext,
        program: &SourceProgram,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> SandboxResult<RawExecutionOutcome> {
        ctx.write_program(program.text()).await?;

        let mut child = self
            .command(ctx.path(), limits)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                interpreter: self.config.interpreter.display().to_string(),
                source,
            })?;
        let started = Instant::now();
        self.spawned.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_sandboxes_spawned();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pid = ctx.attach(child)?;
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(SandboxError::MissingPipe("output"));
        };
        let pgid = i32::try_from(pid).map_err(|_| SandboxError::MissingPid)?;
        obs::emit_sandbox_spawned(pid, ctx.path());

        let claim = Arc::new(CompletionClaim::new());
        let watchdog = Watchdog::arm(pgid, limits.timeout, cancel, claim.clone());
        let cap = limits.max_output_bytes;
        let stdout_task = tokio::spawn(capture(stdout, cap));
        let stderr_task = tokio::spawn(capture(stderr, cap));

        // Signal the group only while the exited leader is still unreaped;
        // after reaping, the pgid is free for reuse.
        let reaped = match ctx.wait_exited().await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(event = "sandbox.wait_exited_failed", pid, error = %err);
                Some(ctx.wait().await)
            }
        };
        let duration = started.elapsed();
        claim.claim(Completion::Exited);
        watchdog.disarm().await;
        // The interpreter is gone; anything it left in the group would
        // keep the pipes open.
        if reaped.is_none() {
            kill_process_group(pgid);
        }
        let waited = match reaped {
            Some(waited) => waited,
            None => ctx.wait().await,
        };

        let grace = self.config.drain_grace();
        let stdout = join_capture(stdout_task, grace, "stdout").await;
        let stderr = join_capture(stderr_task, grace, "stderr").await;
        let status = waited?;

        let termination = match claim.get() {
            Some(Completion::TimedOut) => Termination::TimedOut,
            Some(Completion::Cancelled) => Termination::Cancelled,
            Some(Completion::Exited) | None => termination_of(status),
        };

        Ok(RawExecutionOutcome {
            termination,
            stdout,
            stderr,
            duration,
            limits: *limits,
            pid: Some(pid),
        })
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    async fn run(
        &self,
        program: &SourceProgram,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> SandboxResult<RawExecutionOutcome> {
        if cancel.is_cancelled() {
            return Ok(RawExecutionOutcome::cancelled_before_start(*limits));
        }
        let mut ctx = SandboxContext::create(self.config.workspace_root.as_deref())?;
        let result = self.run_in(&mut ctx, program, limits, cancel).await;
        ctx.release().await;
        result
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited { code },
        (None, Some(signal)) => Termination::Signaled { signal },
        (None, None) => Termination::Exited { code: -1 },
    }
}

async fn join_capture(
    mut task: JoinHandle<CapturedStream>,
    grace: Duration,
    stream: &'static str,
) -> CapturedStream {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(err)) => {
            tracing::warn!(event = "sandbox.capture_failed", stream, error = %err);
            CapturedStream::default()
        }
        Err(_) => {
            task.abort();
            tracing::warn!(event = "sandbox.capture_abandoned", stream);
            CapturedStream {
                truncated: true,
                ..CapturedStream::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_of_exit_code() {
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(termination_of(status), Termination::Exited { code: 3 });
    }

    #[test]
    fn test_termination_of_signal() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(
            termination_of(status),
            Termination::Signaled {
                signal: libc::SIGKILL
            }
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_spawns_nothing() {
        let runner = ProcessRunner::new(RunnerConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let limits = crate::config::LimitPolicy::default().resolve(&Default::default());
        let outcome = runner
            .run(&SourceProgram::python("print(1)"), &limits, cancel)
            .await
            .unwrap();
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(outcome.pid, None);
        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let runner = ProcessRunner::new(RunnerConfig {
            interpreter: "codevibe-no-such-interpreter".into(),
            ..RunnerConfig::default()
        });
        let limits = crate::config::LimitPolicy::default().resolve(&Default::default());
        let err = runner
            .run(
                &SourceProgram::python("print(1)"),
                &limits,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn { .. }), "got {err:?}");
        assert_eq!(runner.spawn_count(), 0);
    }
}
