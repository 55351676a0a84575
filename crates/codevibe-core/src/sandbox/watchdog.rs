//! Completion claim and the timeout/cancellation watchdog.
//!
//! A run can end three ways: the process exits, the timeout fires, or the
//! caller cancels. All three race through one [`CompletionClaim`]; the
//! first to claim decides how the run is reported and later claims are
//! no-ops. The watchdog only kills the process group if it wins the claim.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::limits::kill_process_group;
use crate::obs;

const UNCLAIMED: u8 = 0;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Completion {
    Exited = 1,
    TimedOut = 2,
    Cancelled = 3,
}

impl Completion {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Completion::Exited),
            2 => Some(Completion::TimedOut),
            3 => Some(Completion::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Completion::Exited => "exited",
            Completion::TimedOut => "timed_out",
            Completion::Cancelled => "cancelled",
        }
    }
}

/// Once-settable record of how a run ended.
#[derive(Debug, Default)]
pub struct CompletionClaim(AtomicU8);

impl CompletionClaim {
    pub fn new() -> Self {
        Self(AtomicU8::new(UNCLAIMED))
    }

    /// Attempt to settle the run as `how`. Returns `true` for the single
    /// caller that wins.
    pub fn claim(&self, how: Completion) -> bool {
        self.0
            .compare_exchange(UNCLAIMED, how as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get(&self) -> Option<Completion> {
        Completion::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Background task that kills a process group on timeout or cancellation.
///
/// Runs independently of whoever waits on the child, so a process that
/// never exits on its own still gets killed.
#[derive(Debug)]
pub struct Watchdog {
    disarm: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn arm(
        pgid: i32,
        timeout: Duration,
        cancel: CancellationToken,
        claim: Arc<CompletionClaim>,
    ) -> Self {
        let (disarm, disarmed) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let reason = tokio::select! {
                _ = disarmed => return,
                _ = tokio::time::sleep(timeout) => Completion::TimedOut,
                _ = cancel.cancelled() => Completion::Cancelled,
            };
            if claim.claim(reason) {
                obs::emit_sandbox_killed(pgid, reason.as_str());
                kill_process_group(pgid);
            }
        });
        Self {
            disarm: Some(disarm),
            task,
        }
    }

    /// Stop the watchdog and wait for its task to finish.
    pub async fn disarm(mut self) {
        if let Some(tx) = self.disarm.take() {
            let _ = tx.send(());
        }
        if let Err(err) = (&mut self.task).await {
            tracing::warn!(event = "sandbox.watchdog_failed", error = %err);
        }
    }
}

impl Drop for Watchdog {
    // A dropped run must not leave a timer that could later signal a
    // recycled process group.
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_claim_wins() {
        let claim = CompletionClaim::new();
        assert_eq!(claim.get(), None);
        assert!(claim.claim(Completion::TimedOut));
        assert!(!claim.claim(Completion::Exited));
        assert!(!claim.claim(Completion::Cancelled));
        assert_eq!(claim.get(), Some(Completion::TimedOut));
    }

    #[test]
    fn test_claim_is_exclusive_across_threads() {
        let claim = Arc::new(CompletionClaim::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let claim = claim.clone();
                std::thread::spawn(move || {
                    let how = if i % 2 == 0 {
                        Completion::Exited
                    } else {
                        Completion::TimedOut
                    };
                    claim.claim(how)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    // pgid 0 would mean "our own group"; tests arm with a pid that cannot
    // exist so a winning kill is a harmless ESRCH.
    const NO_SUCH_GROUP: i32 = i32::MAX;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_claims_timeout() {
        let claim = Arc::new(CompletionClaim::new());
        let dog = Watchdog::arm(
            NO_SUCH_GROUP,
            Duration::from_secs(2),
            CancellationToken::new(),
            claim.clone(),
        );
        tokio::time::sleep(Duration::from_secs(3)).await;
        dog.disarm().await;
        assert_eq!(claim.get(), Some(Completion::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_claims_cancellation() {
        let claim = Arc::new(CompletionClaim::new());
        let cancel = CancellationToken::new();
        let dog = Watchdog::arm(
            NO_SUCH_GROUP,
            Duration::from_secs(60),
            cancel.clone(),
            claim.clone(),
        );
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        dog.disarm().await;
        assert_eq!(claim.get(), Some(Completion::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_watchdog_never_claims() {
        let claim = Arc::new(CompletionClaim::new());
        let dog = Watchdog::arm(
            NO_SUCH_GROUP,
            Duration::from_secs(1),
            CancellationToken::new(),
            claim.clone(),
        );
        assert!(claim.claim(Completion::Exited));
        dog.disarm().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(claim.get(), Some(Completion::Exited));
    }
}
