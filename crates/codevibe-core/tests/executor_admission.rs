//! Admission control, cancellation and fault handling, driven by an
//! in-memory runner so no interpreter is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codevibe_core::sandbox::{CapturedStream, SandboxError, SandboxResult};
use codevibe_core::{
    Cancelled, EngineConfig, ExecutionStatus, Executor, LimitOverrides, RawExecutionOutcome,
    ResourceLimits, RuleTable, SandboxRunner, SourceProgram, Termination,
};
use tokio_util::sync::CancellationToken;

/// What the fake runner does once called.
#[derive(Clone, Copy)]
enum Behaviour {
    /// Print "ok" after the delay.
    Succeed(Duration),
    /// Run until cancelled.
    Hang,
    /// Fail like a spawn error.
    Fail,
}

struct FakeRunner {
    behaviour: Behaviour,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn outcome(termination: Termination, stdout: &str, limits: &ResourceLimits) -> RawExecutionOutcome {
        RawExecutionOutcome {
            termination,
            stdout: CapturedStream {
                bytes: stdout.as_bytes().to_vec(),
                total_bytes: stdout.len() as u64,
                truncated: false,
            },
            stderr: CapturedStream::default(),
            duration: Duration::from_millis(1),
            limits: *limits,
            pid: None,
        }
    }
}

#[async_trait]
impl SandboxRunner for FakeRunner {
    async fn run(
        &self,
        _program: &SourceProgram,
        limits: &ResourceLimits,
        cancel: CancellationToken,
    ) -> SandboxResult<RawExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = match self.behaviour {
            Behaviour::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Self::outcome(Termination::Exited { code: 0 }, "ok\n", limits))
            }
            Behaviour::Hang => {
                cancel.cancelled().await;
                Ok(Self::outcome(Termination::Cancelled, "", limits))
            }
            Behaviour::Fail => Err(SandboxError::Workspace(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "no space for sandboxes",
            ))),
        };
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn executor(max_concurrent: usize, runner: Arc<FakeRunner>) -> Arc<Executor> {
    let config = EngineConfig {
        max_concurrent,
        ..EngineConfig::default()
    };
    let rules = Arc::new(RuleTable::builtin().unwrap());
    Arc::new(Executor::with_runner(&config, rules, runner).unwrap())
}

fn program(source: &str) -> SourceProgram {
    SourceProgram::python(source)
}

// -------------------------------------------------------------------------
// Admission
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrency_never_exceeds_capacity() {
    let runner = FakeRunner::new(Behaviour::Succeed(Duration::from_millis(30)));
    let executor = executor(2, runner.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let executor = executor.clone();
            tokio::spawn(async move {
                let request = executor.request(program("print(1)"), &LimitOverrides::default());
                executor.execute(&request).await
            })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.stdout, "ok\n");
    }

    assert_eq!(runner.calls.load(Ordering::SeqCst), 8);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(executor.available_slots(), 2);
}

#[tokio::test]
async fn test_rejected_program_never_reaches_runner() {
    let runner = FakeRunner::new(Behaviour::Succeed(Duration::ZERO));
    let executor = executor(1, runner.clone());

    for source in ["eval('1')", "import socket", "def f(:", "", "   \n"] {
        let request = executor.request(program(source), &LimitOverrides::default());
        let result = executor.execute(&request).await;
        assert_eq!(result.status, ExecutionStatus::Violation, "{source:?}");
        assert!(!result.violations.is_empty());
    }
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejection_does_not_wait_for_a_slot() {
    let runner = FakeRunner::new(Behaviour::Hang);
    let executor = executor(1, runner.clone());

    let holder_cancel = CancellationToken::new();
    let holder = {
        let executor = executor.clone();
        let cancel = holder_cancel.clone();
        tokio::spawn(async move {
            let request = executor.request(program("print(1)"), &LimitOverrides::default());
            executor.execute_cancellable(&request, cancel).await
        })
    };
    while executor.available_slots() > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let request = executor.request(program("import os"), &LimitOverrides::default());
    let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(&request))
        .await
        .expect("rejection must not queue behind a running sandbox");
    assert_eq!(result.status, ExecutionStatus::Violation);

    holder_cancel.cancel();
    assert_eq!(holder.await.unwrap(), Err(Cancelled));
}

// -------------------------------------------------------------------------
// Cancellation
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_running_execution() {
    let runner = FakeRunner::new(Behaviour::Hang);
    let executor = executor(1, runner.clone());
    let cancel = CancellationToken::new();

    let handle = {
        let executor = executor.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let request = executor.request(program("print(1)"), &LimitOverrides::default());
            executor.execute_cancellable(&request, cancel).await
        })
    };
    while runner.running.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    assert_eq!(handle.await.unwrap(), Err(Cancelled));
    assert_eq!(executor.available_slots(), 1);
}

#[tokio::test]
async fn test_cancel_queued_execution_leaves_queue() {
    let runner = FakeRunner::new(Behaviour::Hang);
    let executor = executor(1, runner.clone());

    let first_cancel = CancellationToken::new();
    let first = {
        let executor = executor.clone();
        let cancel = first_cancel.clone();
        tokio::spawn(async move {
            let request = executor.request(program("print(1)"), &LimitOverrides::default());
            executor.execute_cancellable(&request, cancel).await
        })
    };
    while runner.running.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let queued_cancel = CancellationToken::new();
    let queued = {
        let executor = executor.clone();
        let cancel = queued_cancel.clone();
        tokio::spawn(async move {
            let request = executor.request(program("print(2)"), &LimitOverrides::default());
            executor.execute_cancellable(&request, cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    queued_cancel.cancel();
    assert_eq!(queued.await.unwrap(), Err(Cancelled));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

    first_cancel.cancel();
    assert_eq!(first.await.unwrap(), Err(Cancelled));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_already_cancelled_token_skips_runner() {
    let runner = FakeRunner::new(Behaviour::Succeed(Duration::ZERO));
    let executor = executor(1, runner.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let request = executor.request(program("print(1)"), &LimitOverrides::default());
    assert_eq!(
        executor.execute_cancellable(&request, cancel).await,
        Err(Cancelled)
    );
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

// -------------------------------------------------------------------------
// Faults
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_runner_failure_is_infra_error() {
    let runner = FakeRunner::new(Behaviour::Fail);
    let executor = executor(1, runner.clone());

    let request = executor.request(program("print(1)"), &LimitOverrides::default());
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::InfraError);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, "InfrastructureError");
    assert!(result.errors[0].message.contains("no space for sandboxes"));
    assert_eq!(executor.available_slots(), 1);
}

#[tokio::test]
async fn test_dropped_execution_releases_slot() {
    let runner = FakeRunner::new(Behaviour::Hang);
    let executor = executor(1, runner.clone());

    let request = executor.request(program("print(1)"), &LimitOverrides::default());
    let pending = executor.execute(&request);
    let timed_out = tokio::time::timeout(Duration::from_millis(50), pending).await;
    assert!(timed_out.is_err());
    assert_eq!(executor.available_slots(), 1);
}
