//! Global atomic counters for execution-engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a serve loop shuts down).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters plus one in-flight gauge.
pub struct Metrics {
    executions_started: AtomicU64,
    executions_rejected: AtomicU64,
    executions_ok: AtomicU64,
    executions_crashed: AtomicU64,
    executions_timed_out: AtomicU64,
    executions_cancelled: AtomicU64,
    infra_errors: AtomicU64,
    sandboxes_spawned: AtomicU64,
    in_flight: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_rejected: AtomicU64::new(0),
            executions_ok: AtomicU64::new(0),
            executions_crashed: AtomicU64::new(0),
            executions_timed_out: AtomicU64::new(0),
            executions_cancelled: AtomicU64::new(0),
            infra_errors: AtomicU64::new(0),
            sandboxes_spawned: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
        }
    }

    pub fn inc_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_started", "counter incremented");
    }

    /// Programs refused by static analysis.
    pub fn inc_rejected(&self) {
        self.executions_rejected.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_rejected", "counter incremented");
    }

    pub fn inc_ok(&self) {
        self.executions_ok.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_ok", "counter incremented");
    }

    pub fn inc_crashed(&self) {
        self.executions_crashed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_crashed", "counter incremented");
    }

    pub fn inc_timed_out(&self) {
        self.executions_timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_timed_out", "counter incremented");
    }

    pub fn inc_cancelled(&self) {
        self.executions_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions_cancelled", "counter incremented");
    }

    pub fn inc_infra_errors(&self) {
        self.infra_errors.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "infra_errors", "counter incremented");
    }

    /// Interpreter processes actually spawned.
    pub fn inc_sandboxes_spawned(&self) {
        self.sandboxes_spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandboxes_spawned", "counter incremented");
    }

    pub fn enter_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leave_in_flight(&self) {
        // Saturating: reset() may race with a live execution in tests.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions_started = self.executions_started(),
            executions_rejected = self.executions_rejected(),
            executions_ok = self.executions_ok(),
            executions_crashed = self.executions_crashed(),
            executions_timed_out = self.executions_timed_out(),
            executions_cancelled = self.executions_cancelled(),
            infra_errors = self.infra_errors(),
            sandboxes_spawned = self.sandboxes_spawned(),
            in_flight = self.in_flight(),
        );
    }

    pub fn executions_started(&self) -> u64 {
        self.executions_started.load(Ordering::Relaxed)
    }

    pub fn executions_rejected(&self) -> u64 {
        self.executions_rejected.load(Ordering::Relaxed)
    }

    pub fn executions_ok(&self) -> u64 {
        self.executions_ok.load(Ordering::Relaxed)
    }

    pub fn executions_crashed(&self) -> u64 {
        self.executions_crashed.load(Ordering::Relaxed)
    }

    pub fn executions_timed_out(&self) -> u64 {
        self.executions_timed_out.load(Ordering::Relaxed)
    }

    pub fn executions_cancelled(&self) -> u64 {
        self.executions_cancelled.load(Ordering::Relaxed)
    }

    pub fn infra_errors(&self) -> u64 {
        self.infra_errors.load(Ordering::Relaxed)
    }

    pub fn sandboxes_spawned(&self) -> u64 {
        self.sandboxes_spawned.load(Ordering::Relaxed)
    }

    /// Executions admitted to the engine and not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.executions_started,
            &self.executions_rejected,
            &self.executions_ok,
            &self.executions_crashed,
            &self.executions_timed_out,
            &self.executions_cancelled,
            &self.infra_errors,
            &self.sandboxes_spawned,
            &self.in_flight,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.executions_started(), 0);
        m.inc_started();
        m.inc_started();
        assert_eq!(m.executions_started(), 2);

        m.inc_rejected();
        assert_eq!(m.executions_rejected(), 1);

        m.inc_sandboxes_spawned();
        m.inc_sandboxes_spawned();
        m.inc_sandboxes_spawned();
        assert_eq!(m.sandboxes_spawned(), 3);
    }

    #[test]
    fn in_flight_gauge_never_underflows() {
        let m = Metrics::new();
        m.enter_in_flight();
        m.enter_in_flight();
        assert_eq!(m.in_flight(), 2);
        m.leave_in_flight();
        m.leave_in_flight();
        m.leave_in_flight();
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_started();
        m.inc_ok();
        m.inc_crashed();
        m.inc_timed_out();
        m.inc_cancelled();
        m.inc_infra_errors();
        m.enter_in_flight();
        m.reset();
        assert_eq!(m.executions_started(), 0);
        assert_eq!(m.executions_ok(), 0);
        assert_eq!(m.executions_crashed(), 0);
        assert_eq!(m.executions_timed_out(), 0);
        assert_eq!(m.executions_cancelled(), 0);
        assert_eq!(m.infra_errors(), 0);
        assert_eq!(m.in_flight(), 0);
    }
}
