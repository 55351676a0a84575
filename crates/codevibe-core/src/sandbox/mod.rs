//! Sandbox: run one untrusted program in an isolated, resource-limited
//! interpreter process and report what happened.
//!
//! Each run gets a private temporary directory holding only the program
//! file, a scrubbed environment, its own process group and kernel
//! rlimits. A watchdog enforces the wall-clock limit and cancellation by
//! killing the whole group. The directory and every process are gone when
//! [`SandboxRunner::run`] returns, on every path.
//!
//! # Modules
//!
//! - [`runner`]: `SandboxRunner` trait, `ProcessRunner`, `RawExecutionOutcome`
//! - [`capture`]: capped stdout/stderr capture
//! - [`watchdog`]: `CompletionClaim` + timeout/cancel `Watchdog`
//! - [`error`]: `SandboxError` / `SandboxResult`

pub mod capture;
mod context;
pub mod error;
mod limits;
pub mod runner;
pub mod watchdog;

pub use capture::CapturedStream;
pub use context::PROGRAM_FILE;
pub use error::{SandboxError, SandboxResult};
pub use limits::process_group_alive;
pub use runner::{ProcessRunner, RawExecutionOutcome, SandboxRunner, Termination};
pub use watchdog::{Completion, CompletionClaim};
