//! Programs, resource limits and execution requests.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::LimitPolicy;

/// Source language of a program. Only Python is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
        }
    }
}

/// Untrusted program text. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProgram {
    text: String,
    language: Language,
}

impl SourceProgram {
    pub fn new(text: impl Into<String>, language: Language) -> Self {
        Self {
            text: text.into(),
            language,
        }
    }

    pub fn python(text: impl Into<String>) -> Self {
        Self::new(text, Language::Python)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Hex SHA-256 of the program text. Logs carry this instead of the
    /// source itself.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.text.as_bytes()))
    }
}

/// Resolved per-run ceilings. Produced by [`LimitPolicy::resolve`], so the
/// values are always within the configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    /// Per stream; bytes beyond this are drained and discarded.
    pub max_output_bytes: usize,
    /// Address-space ceiling for the interpreter process.
    pub max_memory_bytes: u64,
}

/// Caller-requested limits before clamping. `None` means "use the default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub timeout_ms: Option<u64>,
    pub max_output_bytes: Option<u64>,
    pub max_memory_bytes: Option<u64>,
}

/// One execution request. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: Uuid,
    program: SourceProgram,
    limits: ResourceLimits,
}

impl ExecutionRequest {
    pub fn new(program: SourceProgram, overrides: &LimitOverrides, policy: &LimitPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            program,
            limits: policy.resolve(overrides),
        }
    }

    /// Request with the policy's default limits.
    pub fn with_defaults(program: SourceProgram, policy: &LimitPolicy) -> Self {
        Self::new(program, &LimitOverrides::default(), policy)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn program(&self) -> &SourceProgram {
        &self.program
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }
}

/// JSON request as accepted on the wire (`codevibe serve`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireRequest {
    /// Opaque caller id, echoed back with the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: String,
    #[serde(default)]
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
}

impl WireRequest {
    pub fn overrides(&self) -> LimitOverrides {
        LimitOverrides {
            timeout_ms: self.timeout_ms,
            max_output_bytes: self.max_output_bytes,
            max_memory_bytes: self.max_memory_bytes,
        }
    }

    pub fn into_request(self, policy: &LimitPolicy) -> ExecutionRequest {
        let overrides = self.overrides();
        ExecutionRequest::new(SourceProgram::new(self.source, self.language), &overrides, policy)
    }
}
