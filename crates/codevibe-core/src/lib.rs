//! codevibe core library
//!
//! Static analysis and sandboxed execution of untrusted Python programs.
//! A program is parsed and checked against a denylist rule table; only if
//! it passes is it run in a throwaway, resource-limited interpreter
//! process. Every request ends in one structured [`ExecutionResult`].
//!
//! ```ignore
//! let executor = Executor::from_config(&EngineConfig::default())?;
//! let request = executor.request(SourceProgram::python("print(1+1)"), &LimitOverrides::default());
//! let result = executor.execute(&request).await;
//! assert_eq!(result.stdout, "2\n");
//! ```

pub mod analyzer;
pub mod config;
pub mod executor;
pub mod metrics;
pub mod obs;
pub mod program;
pub mod report;
pub mod rules;
pub mod sandbox;
pub mod telemetry;

pub use analyzer::{AnalysisVerdict, Analyzer, CodeStats, Location, ParseError, Violation};
pub use config::{ConfigError, EngineConfig, LimitPolicy, RunnerConfig};
pub use executor::{Cancelled, EngineError, ExecutionPhase, Executor};
pub use program::{
    ExecutionRequest, Language, LimitOverrides, ResourceLimits, SourceProgram, WireRequest,
};
pub use report::{ErrorEntry, ExecutionResult, ExecutionStatus, FormatInput, ViolationRecord};
pub use rules::{Category, RuleKind, RuleTable, RuleTableError, Severity, ViolationRule};
pub use sandbox::{
    CapturedStream, ProcessRunner, RawExecutionOutcome, SandboxError, SandboxRunner, Termination,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
