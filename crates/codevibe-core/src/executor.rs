//! Executor: analyze, admit, run, format.
//!
//! Every request follows
//! `Received → Analyzing → {Rejected | Running} → {Completed | TimedOut |
//! Crashed | InfraFault} → Formatted`. Analysis happens before admission,
//! so rejected programs never reach the runner nor occupy a sandbox slot.
//! A counting semaphore bounds concurrently running sandboxes; excess
//! requests wait for a slot.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::analyzer::Analyzer;
use crate::config::{ConfigError, EngineConfig, LimitPolicy};
use crate::metrics::METRICS;
use crate::obs::{self, ExecutionSpan};
use crate::program::{ExecutionRequest, LimitOverrides, SourceProgram};
use crate::report::{self, ExecutionResult, ExecutionStatus, FormatInput};
use crate::rules::{RuleTable, RuleTableError};
use crate::sandbox::{ProcessRunner, SandboxRunner, Termination};

/// The caller cancelled the execution before it produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("execution cancelled")]
pub struct Cancelled;

/// Errors raised while building an [`Executor`]. All are startup errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rules(#[from] RuleTableError),
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle phase of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPhase {
    Received,
    Analyzing,
    Rejected,
    Running,
    Completed,
    TimedOut,
    Crashed,
    InfraFault,
    Formatted,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Received => "received",
            ExecutionPhase::Analyzing => "analyzing",
            ExecutionPhase::Rejected => "rejected",
            ExecutionPhase::Running => "running",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::TimedOut => "timed_out",
            ExecutionPhase::Crashed => "crashed",
            ExecutionPhase::InfraFault => "infra_fault",
            ExecutionPhase::Formatted => "formatted",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_advance_to(self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        matches!(
            (self, next),
            (Received, Analyzing)
                | (Analyzing, Rejected | Running | InfraFault)
                | (Running, Completed | TimedOut | Crashed | InfraFault)
                | (Rejected | Completed | TimedOut | Crashed | InfraFault, Formatted)
        )
    }

    /// The post-run phase for a result status.
    fn after_run(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Ok => ExecutionPhase::Completed,
            ExecutionStatus::Timeout => ExecutionPhase::TimedOut,
            ExecutionStatus::Crashed => ExecutionPhase::Crashed,
            ExecutionStatus::Violation | ExecutionStatus::InfraError => ExecutionPhase::InfraFault,
        }
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs the phase of one execution.
struct Lifecycle {
    id: Uuid,
    phase: ExecutionPhase,
}

impl Lifecycle {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            phase: ExecutionPhase::Received,
        }
    }

    fn advance(&mut self, next: ExecutionPhase) {
        if !self.phase.can_advance_to(next) {
            tracing::error!(
                event = "execution.bad_transition",
                execution_id = %self.id,
                from = self.phase.as_str(),
                to = next.as_str(),
            );
        }
        obs::emit_phase(self.id, self.phase.as_str(), next.as_str());
        self.phase = next;
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Orchestrates analysis, admission and sandboxed execution.
///
/// Shareable across tasks (`Arc<Executor>`); all methods take `&self`.
pub struct Executor {
    analyzer: Analyzer,
    runner: Arc<dyn SandboxRunner>,
    admission: Semaphore,
    capacity: usize,
    policy: LimitPolicy,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("capacity", &self.capacity)
            .field("available", &self.available_slots())
            .field("rule_table_version", &self.analyzer.rules().version())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Build an executor that runs programs with a [`ProcessRunner`].
    ///
    /// Loads the rule table from `config.rules_path`, or the built-in table.
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let rules = match &config.rules_path {
            Some(path) => RuleTable::load(path)?,
            None => RuleTable::builtin()?,
        };
        let runner = Arc::new(ProcessRunner::new(config.runner.clone()));
        Self::with_runner(config, Arc::new(rules), runner)
    }

    /// Build an executor around an arbitrary runner.
    pub fn with_runner(
        config: &EngineConfig,
        rules: Arc<RuleTable>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        tracing::info!(
            event = "executor.ready",
            rules = rules.len(),
            rule_table_version = rules.version(),
            max_concurrent = config.max_concurrent,
        );
        Ok(Self {
            analyzer: Analyzer::new(rules, config.max_source_bytes),
            runner,
            admission: Semaphore::new(config.max_concurrent),
            capacity: config.max_concurrent,
            policy: config.limits.clone(),
        })
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Maximum number of concurrently running sandboxes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sandbox slots currently free.
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    /// Build a request under this executor's limit policy.
    pub fn request(&self, program: SourceProgram, overrides: &LimitOverrides) -> ExecutionRequest {
        ExecutionRequest::new(program, overrides, &self.policy)
    }

    /// Run one request to completion. Never fails: every problem, including
    /// infrastructure faults, is reported inside the result.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        match self
            .execute_cancellable(request, CancellationToken::new())
            .await
        {
            Ok(result) => result,
            Err(cancelled) => report::format(FormatInput::Fault {
                error: &cancelled,
                duration: started.elapsed(),
            }),
        }
    }

    /// Like [`Executor::execute`], but gives up when `cancel` fires.
    ///
    /// A request still waiting for a slot leaves the queue; a running one
    /// has its process group killed. Either way no result is produced.
    pub async fn execute_cancellable(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        let guard = ExecutionSpan::new(request.id(), &request.program().digest());
        let span = guard.span().clone();
        let outcome = self.run_lifecycle(request, cancel).instrument(span).await;
        guard.finish();
        outcome
    }

    async fn run_lifecycle(
        &self,
        request: &ExecutionRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, Cancelled> {
        let started = Instant::now();
        let id = request.id();
        let mut lifecycle = Lifecycle::new(id);
        METRICS.inc_started();
        obs::emit_execution_started(id, request.program().len());

        lifecycle.advance(ExecutionPhase::Analyzing);
        let verdict = self.analyzer.analyze(request.program());
        if !verdict.allowed() {
            lifecycle.advance(ExecutionPhase::Rejected);
            METRICS.inc_rejected();
            obs::emit_execution_rejected(
                id,
                verdict.violations().len(),
                verdict.violations().first().map(|v| v.rule.as_str()),
            );
            let result = report::format(FormatInput::Rejected {
                verdict: &verdict,
                duration: started.elapsed(),
            });
            return Ok(self.finish(lifecycle, result));
        }

        if self.admission.available_permits() == 0 {
            obs::emit_admission_waiting(id, self.capacity);
        }
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(self.cancelled(&lifecycle));
            }
            permit = self.admission.acquire() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(err) => {
                lifecycle.advance(ExecutionPhase::InfraFault);
                return Ok(self.fault(lifecycle, &err, started));
            }
        };

        lifecycle.advance(ExecutionPhase::Running);
        let outcome = self
            .runner
            .run(request.program(), request.limits(), cancel)
            .await;

        let result = match outcome {
            Ok(raw) if raw.termination == Termination::Cancelled => {
                return Err(self.cancelled(&lifecycle));
            }
            Ok(raw) => report::format(FormatInput::Executed(&raw)),
            Err(err) => {
                lifecycle.advance(ExecutionPhase::InfraFault);
                return Ok(self.fault(lifecycle, &err, started));
            }
        };
        lifecycle.advance(ExecutionPhase::after_run(result.status));
        match result.status {
            ExecutionStatus::Ok => METRICS.inc_ok(),
            ExecutionStatus::Timeout => METRICS.inc_timed_out(),
            ExecutionStatus::Crashed => METRICS.inc_crashed(),
            ExecutionStatus::Violation | ExecutionStatus::InfraError => METRICS.inc_infra_errors(),
        }
        Ok(self.finish(lifecycle, result))
    }

    fn fault(
        &self,
        lifecycle: Lifecycle,
        err: &(dyn std::error::Error + 'static),
        started: Instant,
    ) -> ExecutionResult {
        METRICS.inc_infra_errors();
        obs::emit_infra_error(lifecycle.id, &err);
        let result = report::format(FormatInput::Fault {
            error: err,
            duration: started.elapsed(),
        });
        self.finish(lifecycle, result)
    }

    fn cancelled(&self, lifecycle: &Lifecycle) -> Cancelled {
        METRICS.inc_cancelled();
        obs::emit_execution_cancelled(lifecycle.id, lifecycle.phase.as_str());
        Cancelled
    }

    fn finish(&self, mut lifecycle: Lifecycle, result: ExecutionResult) -> ExecutionResult {
        lifecycle.advance(ExecutionPhase::Formatted);
        obs::emit_execution_finished(
            lifecycle.id,
            result.status.as_str(),
            result.duration_ms,
            result.truncated,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        use ExecutionPhase::*;
        assert!(Received.can_advance_to(Analyzing));
        assert!(Analyzing.can_advance_to(Rejected));
        assert!(Analyzing.can_advance_to(Running));
        assert!(Running.can_advance_to(TimedOut));
        assert!(Rejected.can_advance_to(Formatted));
        assert!(Crashed.can_advance_to(Formatted));

        assert!(!Received.can_advance_to(Running));
        assert!(!Rejected.can_advance_to(Running));
        assert!(!Formatted.can_advance_to(Received));
        assert!(!Completed.can_advance_to(Running));
    }

    #[test]
    fn test_after_run_phase() {
        assert_eq!(
            ExecutionPhase::after_run(ExecutionStatus::Ok),
            ExecutionPhase::Completed
        );
        assert_eq!(
            ExecutionPhase::after_run(ExecutionStatus::Timeout),
            ExecutionPhase::TimedOut
        );
        assert_eq!(
            ExecutionPhase::after_run(ExecutionStatus::Crashed),
            ExecutionPhase::Crashed
        );
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let config = EngineConfig {
            max_concurrent: 0,
            ..EngineConfig::default()
        };
        let err = Executor::from_config(&config).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)), "got {err:?}");
    }

    #[test]
    fn test_from_config_rejects_missing_rule_table() {
        let config = EngineConfig {
            rules_path: Some("/nonexistent/rules.toml".into()),
            ..EngineConfig::default()
        };
        let err = Executor::from_config(&config).unwrap_err();
        assert!(matches!(err, EngineError::Rules(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_from_config_uses_builtin_rules() {
        let executor = Executor::from_config(&EngineConfig::default()).unwrap();
        assert_eq!(executor.capacity(), 4);
        assert_eq!(executor.available_slots(), 4);
        assert!(executor.analyzer().rules().len() > 50);
    }
}
