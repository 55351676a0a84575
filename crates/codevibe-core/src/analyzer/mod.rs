//! Static analyzer: decides whether a program may run at all.
//!
//! `analyze` never executes anything. It parses the source with the
//! in-crate tokenizer and parser, walks the resulting tree and matches it
//! against the [`RuleTable`]. The verdict is exhaustive: every match in the
//! program is reported, sorted by location.
//!
//! # Modules
//!
//! - [`ast`]: closed syntax tree + `Visitor`
//! - `lexer`: tokenizer with INDENT/DEDENT tracking
//! - `parser`: recursive-descent parser with nesting limits
//! - `checker`: import alias resolution and rule matching

pub mod ast;
mod checker;
mod lexer;
mod parser;

use std::sync::Arc;

use serde::Serialize;

use crate::program::SourceProgram;
use crate::rules::{Category, RuleKind, RuleTable, Severity};

pub use ast::Location;
pub use parser::{MAX_CHAIN, MAX_NESTING};

/// Rule id reported for an empty or whitespace-only program.
pub const EMPTY_PROGRAM: &str = "empty-program";
/// Rule id reported when the source exceeds `max_source_bytes`.
pub const SOURCE_TOO_LARGE: &str = "source-too-large";
/// Rule id reported when the source does not parse.
pub const SYNTAX_ERROR: &str = "syntax-error";

/// A syntax error with the location the parser stopped at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at {location}")]
pub struct ParseError {
    pub message: String,
    pub location: Location,
}

impl ParseError {
    pub fn new(message: impl Into<String>, location: Location) -> Self {
        Self {
            message: message.into(),
            location,
        }
    }
}

/// One reason a program was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Rule id, or one of the analyzer's own ids ([`SYNTAX_ERROR`], …).
    pub rule: String,
    /// `None` for analyzer diagnostics that don't come from the table.
    pub kind: Option<RuleKind>,
    pub category: Category,
    pub severity: Severity,
    pub location: Location,
    pub message: String,
}

impl Violation {
    fn input(rule: &str, severity: Severity, location: Location, message: String) -> Self {
        Self {
            rule: rule.to_string(),
            kind: None,
            category: Category::Input,
            severity,
            location,
            message,
        }
    }
}

/// Summary statistics of a program that parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeStats {
    pub lines: usize,
    pub characters: usize,
    pub functions: usize,
    pub classes: usize,
    /// Sorted, de-duplicated module names from `import` statements.
    pub imported_modules: Vec<String>,
}

/// Allow/deny decision for one program.
///
/// `allowed()` is true exactly when `violations()` is empty; the fields are
/// private so the two can't drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisVerdict {
    allowed: bool,
    violations: Vec<Violation>,
    rule_table_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<CodeStats>,
}

impl AnalysisVerdict {
    fn new(mut violations: Vec<Violation>, rule_table_version: u32, stats: Option<CodeStats>) -> Self {
        violations.sort_by(|a, b| {
            (a.location, &a.rule, &a.message).cmp(&(b.location, &b.rule, &b.message))
        });
        violations.dedup_by(|a, b| a.rule == b.rule && a.location == b.location);
        Self {
            allowed: violations.is_empty(),
            violations,
            rule_table_version,
            stats,
        }
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    /// Violations ordered by (line, column, rule id).
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn rule_table_version(&self) -> u32 {
        self.rule_table_version
    }

    pub fn stats(&self) -> Option<&CodeStats> {
        self.stats.as_ref()
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

/// Stateless analyzer bound to one rule table. Cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Analyzer {
    rules: Arc<RuleTable>,
    max_source_bytes: usize,
}

impl Analyzer {
    pub fn new(rules: Arc<RuleTable>, max_source_bytes: usize) -> Self {
        Self {
            rules,
            max_source_bytes,
        }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    pub fn analyze(&self, program: &SourceProgram) -> AnalysisVerdict {
        let version = self.rules.version();
        let text = program.text();
        let start = Location::new(1, 1);

        if text.trim().is_empty() {
            let violation = Violation::input(
                EMPTY_PROGRAM,
                Severity::Low,
                start,
                "no code to execute".to_string(),
            );
            return AnalysisVerdict::new(vec![violation], version, None);
        }

        if text.len() > self.max_source_bytes {
            let violation = Violation::input(
                SOURCE_TOO_LARGE,
                Severity::Medium,
                start,
                format!(
                    "program is {} bytes; the limit is {} bytes",
                    text.len(),
                    self.max_source_bytes
                ),
            );
            return AnalysisVerdict::new(vec![violation], version, None);
        }

        let module = match parser::parse_module(text) {
            Ok(module) => module,
            Err(err) => {
                let violation = Violation::input(
                    SYNTAX_ERROR,
                    Severity::High,
                    err.location,
                    format!("SyntaxError: {}", err.message),
                );
                return AnalysisVerdict::new(vec![violation], version, None);
            }
        };

        let (violations, stats) = checker::check(&module, &self.rules, text);
        AnalysisVerdict::new(violations, version, Some(stats))
    }
}
