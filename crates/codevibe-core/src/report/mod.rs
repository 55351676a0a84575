//! Result formatting: every path through the engine ends in one
//! [`ExecutionResult`].
//!
//! [`format`] is a pure mapping from what happened (a rejected verdict, a
//! raw sandbox outcome, or an infrastructure fault) to the caller-facing
//! structure. It never fails.

pub mod traceback;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisVerdict, Violation, SYNTAX_ERROR};
use crate::rules::{Category, Severity};
use crate::sandbox::{RawExecutionOutcome, Termination, PROGRAM_FILE};

/// Outcome class of one execution. Exactly one per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Violation,
    Timeout,
    Crashed,
    InfraError,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Violation => "violation",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Crashed => "crashed",
            ExecutionStatus::InfraError => "infra_error",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected construct as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub rule: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub category: Category,
    pub severity: Severity,
}

impl From<&Violation> for ViolationRecord {
    fn from(v: &Violation) -> Self {
        Self {
            rule: v.rule.clone(),
            line: v.location.line,
            column: v.location.column,
            message: v.message.clone(),
            category: v.category,
            severity: v.severity,
        }
    }
}

/// A structured error: a Python exception, a signal, a timeout or an
/// infrastructure fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorEntry {
    fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            line: None,
            hint: None,
        }
    }

    fn with_line(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }

    fn with_hint(mut self, hint: Option<&str>) -> Self {
        self.hint = hint.map(str::to_string);
        self
    }
}

/// Terminal, caller-facing result of one execution.
///
/// `exit_code` is present only for `ok` and `crashed`; `ok` always means
/// exit code 0 and no violations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub exit_code: Option<i32>,
    pub violations: Vec<ViolationRecord>,
    pub errors: Vec<ErrorEntry>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn empty(status: ExecutionStatus, duration: Duration) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: String::new(),
            truncated: false,
            exit_code: None,
            violations: Vec::new(),
            errors: Vec::new(),
            duration_ms: millis(duration),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }
}

/// What the formatter is asked to describe.
#[derive(Debug, Clone, Copy)]
pub enum FormatInput<'a> {
    /// The analyzer refused the program; nothing ran.
    Rejected {
        verdict: &'a AnalysisVerdict,
        duration: Duration,
    },
    /// The sandbox ran the program to some termination.
    Executed(&'a RawExecutionOutcome),
    /// The engine itself failed.
    Fault {
        error: &'a dyn std::error::Error,
        duration: Duration,
    },
}

pub fn format(input: FormatInput<'_>) -> ExecutionResult {
    match input {
        FormatInput::Rejected { verdict, duration } => format_rejected(verdict, duration),
        FormatInput::Executed(outcome) => format_executed(outcome),
        FormatInput::Fault { error, duration } => {
            let mut result = ExecutionResult::empty(ExecutionStatus::InfraError, duration);
            result
                .errors
                .push(ErrorEntry::new("InfrastructureError", error.to_string()));
            result
        }
    }
}

fn format_rejected(verdict: &AnalysisVerdict, duration: Duration) -> ExecutionResult {
    let mut result = ExecutionResult::empty(ExecutionStatus::Violation, duration);
    result.violations = verdict.violations().iter().map(ViolationRecord::from).collect();
    for v in verdict.violations().iter().filter(|v| v.rule == SYNTAX_ERROR) {
        let message = v
            .message
            .strip_prefix("SyntaxError: ")
            .unwrap_or(&v.message);
        result.errors.push(
            ErrorEntry::new("SyntaxError", message)
                .with_line(Some(v.location.line))
                .with_hint(traceback::hint_for("SyntaxError")),
        );
    }
    result
}

fn format_executed(outcome: &RawExecutionOutcome) -> ExecutionResult {
    let stdout = outcome.stdout.text();
    let stderr = outcome.stderr.text();
    let mut errors = Vec::new();

    let (status, exit_code) = match outcome.termination {
        Termination::Exited { code: 0 } => (ExecutionStatus::Ok, Some(0)),
        Termination::Exited { code } => {
            match exception_entry(&stderr) {
                Some(entry) => errors.push(entry),
                None => errors.push(ErrorEntry::new(
                    "NonZeroExit",
                    format!("process exited with status {code}"),
                )),
            }
            (ExecutionStatus::Crashed, Some(code))
        }
        Termination::Signaled { signal } => {
            errors.extend(exception_entry(&stderr));
            let (name, hint) = traceback::describe_signal(signal);
            errors.push(
                ErrorEntry::new("Signal", format!("terminated by signal {signal} ({name})"))
                    .with_hint(hint),
            );
            (ExecutionStatus::Crashed, Some(-signal))
        }
        Termination::TimedOut => {
            errors.push(
                ErrorEntry::new(
                    "Timeout",
                    format!(
                        "execution exceeded the time limit of {} ms",
                        millis(outcome.limits.timeout)
                    ),
                )
                .with_hint(Some(traceback::TIMEOUT_HINT)),
            );
            (ExecutionStatus::Timeout, None)
        }
        Termination::Cancelled => {
            errors.push(ErrorEntry::new("Cancelled", "execution was cancelled"));
            (ExecutionStatus::InfraError, None)
        }
    };

    ExecutionResult {
        status,
        stdout,
        stderr,
        truncated: outcome.truncated(),
        exit_code,
        violations: Vec::new(),
        errors,
        duration_ms: millis(outcome.duration),
    }
}

fn exception_entry(stderr: &str) -> Option<ErrorEntry> {
    traceback::parse_traceback(stderr, PROGRAM_FILE).map(|parsed| {
        let hint = traceback::hint_for(&parsed.kind);
        ErrorEntry::new(parsed.kind, parsed.message)
            .with_line(parsed.line)
            .with_hint(hint)
    })
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
