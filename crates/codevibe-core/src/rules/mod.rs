//! Violation rule table: the versioned denylist consumed by the analyzer.
//!
//! Rules are data, not code. The built-in table lives in
//! `rules/default.toml` and is embedded into the binary; operators may point
//! the engine at a replacement file. Either way the table is parsed and
//! validated once at startup. A table that fails validation is a fatal
//! configuration error ([`RuleTableError`]), never a per-request failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Embedded default denylist.
pub const DEFAULT_RULES_TOML: &str = include_str!("../../rules/default.toml");

/// Which syntax-tree construct a rule is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// A module named by `import` / `from … import` (dotted-prefix match).
    Import,
    /// The resolved qualified name of a call target (exact match).
    Call,
    /// An attribute name, e.g. `__subclasses__` (exact match).
    Attribute,
    /// Any reference to a dynamic-evaluation builtin, called or not.
    DynamicEval,
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleKind::Import => write!(f, "import"),
            RuleKind::Call => write!(f, "call"),
            RuleKind::Attribute => write!(f, "attribute"),
            RuleKind::DynamicEval => write!(f, "dynamic_eval"),
        }
    }
}

/// Denylist category a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ProcessControl,
    Network,
    DynamicEvaluation,
    Filesystem,
    Reflection,
    Interactive,
    /// Reserved for analyzer-generated diagnostics (syntax errors, oversized
    /// or empty input). Not valid in a rule table.
    Input,
}

/// How serious a matched construct is. Every match blocks execution; the
/// severity only ranks diagnostics for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A single disallowed construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViolationRule {
    /// Stable identifier reported in diagnostics (e.g. `call.os.system`).
    pub id: String,
    pub kind: RuleKind,
    /// Dotted name for `import`/`call`, bare identifier otherwise.
    pub pattern: String,
    pub category: Category,
    pub severity: Severity,
    /// Human-readable explanation shown to the caller.
    pub message: String,
}

/// Errors raised while loading a rule table. All of them are startup-fatal.
#[derive(Debug, thiserror::Error)]
pub enum RuleTableError {
    #[error("failed to read rule table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed rule table: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unsupported rule table version {0} (must be >= 1)")]
    UnsupportedVersion(u32),

    #[error("rule table contains no rules")]
    Empty,

    #[error("rule has an empty id")]
    EmptyId,

    #[error("duplicate rule id: {0}")]
    DuplicateId(String),

    #[error("duplicate {kind} rule for pattern {pattern:?}")]
    DuplicatePattern { kind: RuleKind, pattern: String },

    #[error("rule {id}: invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        id: String,
        pattern: String,
        reason: &'static str,
    },

    #[error("rule {0}: message must not be empty")]
    MissingMessage(String),

    #[error("rule {0}: category `input` is reserved for analyzer diagnostics")]
    ReservedCategory(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleTableDocument {
    version: u32,
    #[serde(default, rename = "rule")]
    rules: Vec<ViolationRule>,
}

/// A validated, indexed, read-only rule table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    version: u32,
    rules: Vec<ViolationRule>,
    index: HashMap<(RuleKind, String), usize>,
}

impl RuleTable {
    /// Parse and validate the embedded default table.
    pub fn builtin() -> Result<Self, RuleTableError> {
        Self::from_toml_str(DEFAULT_RULES_TOML)
    }

    /// Read, parse and validate a table from disk.
    pub fn load(path: &Path) -> Result<Self, RuleTableError> {
        let text = std::fs::read_to_string(path).map_err(|source| RuleTableError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a table from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, RuleTableError> {
        let doc: RuleTableDocument = toml::from_str(text)?;
        Self::new(doc.version, doc.rules)
    }

    /// Validate and index an in-memory rule list.
    pub fn new(version: u32, rules: Vec<ViolationRule>) -> Result<Self, RuleTableError> {
        if version == 0 {
            return Err(RuleTableError::UnsupportedVersion(version));
        }
        if rules.is_empty() {
            return Err(RuleTableError::Empty);
        }

        let mut ids = std::collections::HashSet::new();
        let mut index = HashMap::with_capacity(rules.len());

        for (pos, rule) in rules.iter().enumerate() {
            if rule.id.trim().is_empty() {
                return Err(RuleTableError::EmptyId);
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(RuleTableError::DuplicateId(rule.id.clone()));
            }
            if rule.message.trim().is_empty() {
                return Err(RuleTableError::MissingMessage(rule.id.clone()));
            }
            if rule.category == Category::Input {
                return Err(RuleTableError::ReservedCategory(rule.id.clone()));
            }
            validate_pattern(rule)?;

            if index
                .insert((rule.kind, rule.pattern.clone()), pos)
                .is_some()
            {
                return Err(RuleTableError::DuplicatePattern {
                    kind: rule.kind,
                    pattern: rule.pattern.clone(),
                });
            }
        }

        Ok(Self {
            version,
            rules,
            index,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn rules(&self) -> &[ViolationRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules of one kind, in table order.
    pub fn rules_of_kind(&self, kind: RuleKind) -> impl Iterator<Item = &ViolationRule> {
        self.rules.iter().filter(move |r| r.kind == kind)
    }

    /// Find the import rule covering `module` or any of its parent packages.
    ///
    /// `os.path` is covered by a rule for `os`; the shortest matching prefix
    /// wins so diagnostics name the top-level package.
    pub fn match_import(&self, module: &str) -> Option<&ViolationRule> {
        let mut end = 0;
        loop {
            let next = module[end..].find('.').map(|i| end + i);
            let prefix = &module[..next.unwrap_or(module.len())];
            if let Some(rule) = self.lookup(RuleKind::Import, prefix) {
                return Some(rule);
            }
            match next {
                Some(dot) => end = dot + 1,
                None => return None,
            }
        }
    }

    /// Exact lookup for call targets.
    pub fn match_call(&self, qualified_name: &str) -> Option<&ViolationRule> {
        self.lookup(RuleKind::Call, qualified_name)
    }

    /// Exact lookup for attribute names.
    pub fn match_attribute(&self, name: &str) -> Option<&ViolationRule> {
        self.lookup(RuleKind::Attribute, name)
    }

    /// Exact lookup for dynamic-evaluation constructs.
    pub fn match_dynamic_eval(&self, name: &str) -> Option<&ViolationRule> {
        self.lookup(RuleKind::DynamicEval, name)
    }

    fn lookup(&self, kind: RuleKind, pattern: &str) -> Option<&ViolationRule> {
        self.index
            .get(&(kind, pattern.to_string()))
            .map(|&pos| &self.rules[pos])
    }
}

fn validate_pattern(rule: &ViolationRule) -> Result<(), RuleTableError> {
    let invalid = |reason| RuleTableError::InvalidPattern {
        id: rule.id.clone(),
        pattern: rule.pattern.clone(),
        reason,
    };

    match rule.kind {
        RuleKind::Import | RuleKind::Call => {
            if rule.pattern.is_empty() || !rule.pattern.split('.').all(is_identifier) {
                return Err(invalid("expected a dotted name"));
            }
        }
        RuleKind::Attribute | RuleKind::DynamicEval => {
            if !is_identifier(&rule.pattern) {
                return Err(invalid("expected a single identifier"));
            }
        }
    }
    Ok(())
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_alphanumeric())
}
