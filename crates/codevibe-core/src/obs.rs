//! Structured observability hooks for the execution lifecycle.
//!
//! This module provides:
//! - Execution-scoped tracing spans via the `ExecutionSpan` guard
//! - Emission functions for lifecycle events: start, rejection, sandbox
//!   spawn/kill/release, finish, cancellation, infrastructure faults
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`). Program
//! text never appears in events, only its SHA-256 digest.

use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::metrics::METRICS;

/// Guard scoping one execution: owns the execution span and holds the
/// in-flight gauge up while alive.
///
/// An execution whose future is dropped before [`ExecutionSpan::finish`]
/// logs `execution.abandoned` on drop.
///
/// ```ignore
/// let guard = ExecutionSpan::new(request.id(), &digest);
/// let result = work().instrument(guard.span().clone()).await;
/// guard.finish();
/// ```
#[derive(Debug)]
pub struct ExecutionSpan {
    span: tracing::Span,
    execution_id: Uuid,
    finished: bool,
}

impl ExecutionSpan {
    pub fn new(execution_id: Uuid, digest: &str) -> Self {
        METRICS.enter_in_flight();
        let span = tracing::info_span!(
            "codevibe.execution",
            execution_id = %execution_id,
            digest = %digest,
        );
        Self {
            span,
            execution_id,
            finished: false,
        }
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for ExecutionSpan {
    fn drop(&mut self) {
        METRICS.leave_in_flight();
        if !self.finished {
            tracing::warn!(
                parent: &self.span,
                event = "execution.abandoned",
                execution_id = %self.execution_id,
            );
        }
    }
}

/// Emit event: execution received.
pub fn emit_execution_started(execution_id: Uuid, source_bytes: usize) {
    info!(
        event = "execution.started",
        execution_id = %execution_id,
        source_bytes = source_bytes,
    );
}

/// Emit event: lifecycle phase transition (debug level).
pub fn emit_phase(execution_id: Uuid, from: &str, to: &str) {
    tracing::debug!(event = "execution.phase", execution_id = %execution_id, from, to);
}

/// Emit event: program refused by the analyzer; it never reaches a sandbox.
pub fn emit_execution_rejected(execution_id: Uuid, violations: usize, first_rule: Option<&str>) {
    info!(
        event = "execution.rejected",
        execution_id = %execution_id,
        violations = violations,
        first_rule = first_rule.unwrap_or(""),
    );
}

/// Emit event: all sandbox slots are taken; the request waits.
pub fn emit_admission_waiting(execution_id: Uuid, capacity: usize) {
    tracing::debug!(event = "admission.waiting", execution_id = %execution_id, capacity);
}

pub fn emit_sandbox_spawned(pid: u32, dir: &Path) {
    info!(event = "sandbox.spawned", pid = pid, dir = %dir.display());
}

/// Emit event: watchdog killed a process group (`timed_out` / `cancelled`).
pub fn emit_sandbox_killed(pgid: i32, reason: &str) {
    info!(event = "sandbox.killed", pgid = pgid, reason = reason);
}

pub fn emit_sandbox_released(dir: &Path) {
    tracing::debug!(event = "sandbox.released", dir = %dir.display());
}

/// Emit event: execution finished with a result status.
pub fn emit_execution_finished(
    execution_id: Uuid,
    status: &str,
    duration_ms: u64,
    truncated: bool,
) {
    info!(
        event = "execution.finished",
        execution_id = %execution_id,
        status = status,
        duration_ms = duration_ms,
        truncated = truncated,
    );
}

pub fn emit_execution_cancelled(execution_id: Uuid, phase: &str) {
    info!(event = "execution.cancelled", execution_id = %execution_id, phase = phase);
}

/// Emit event: infrastructure failure (warning level).
pub fn emit_infra_error(execution_id: Uuid, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "execution.infra_error", execution_id = %execution_id, error = %error);
}
