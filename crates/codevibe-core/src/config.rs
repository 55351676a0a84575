//! Engine configuration.
//!
//! Everything tunable lives in [`EngineConfig`]. It deserializes from TOML
//! with every field optional (missing fields take their `Default`), and is
//! checked once by [`EngineConfig::validate`] before an executor is built.
//! A bad config is a startup error, never a per-request one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::program::{LimitOverrides, ResourceLimits};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

// ---------------------------------------------------------------------------
// Limit policy
// ---------------------------------------------------------------------------

/// Defaults and ceilings applied to per-request resource limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitPolicy {
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    /// Platform maximum; larger requested timeouts are clamped to it.
    pub max_timeout_ms: u64,
    pub default_output_bytes: u64,
    pub max_output_bytes: u64,
    pub default_memory_bytes: u64,
    pub min_memory_bytes: u64,
    pub max_memory_bytes: u64,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            min_timeout_ms: 100,
            max_timeout_ms: 120_000,
            default_output_bytes: MIB,
            max_output_bytes: 16 * MIB,
            default_memory_bytes: 512 * MIB,
            min_memory_bytes: 64 * MIB,
            max_memory_bytes: 2048 * MIB,
        }
    }
}

impl LimitPolicy {
    /// Fill in missing values and clamp everything into range.
    pub fn resolve(&self, overrides: &LimitOverrides) -> ResourceLimits {
        let timeout_ms = overrides
            .timeout_ms
            .unwrap_or(self.default_timeout_ms)
            .max(self.min_timeout_ms)
            .min(self.max_timeout_ms);
        let output = overrides
            .max_output_bytes
            .unwrap_or(self.default_output_bytes)
            .min(self.max_output_bytes);
        let memory = overrides
            .max_memory_bytes
            .unwrap_or(self.default_memory_bytes)
            .max(self.min_memory_bytes)
            .min(self.max_memory_bytes);

        ResourceLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: usize::try_from(output).unwrap_or(usize::MAX),
            max_memory_bytes: memory,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_timeout_ms == 0 {
            return Err(invalid("limits.min_timeout_ms must be at least 1"));
        }
        if !(self.min_timeout_ms <= self.default_timeout_ms
            && self.default_timeout_ms <= self.max_timeout_ms)
        {
            return Err(invalid(
                "limits: expected min_timeout_ms <= default_timeout_ms <= max_timeout_ms",
            ));
        }
        if self.default_output_bytes > self.max_output_bytes {
            return Err(invalid(
                "limits: default_output_bytes exceeds max_output_bytes",
            ));
        }
        if !(self.min_memory_bytes <= self.default_memory_bytes
            && self.default_memory_bytes <= self.max_memory_bytes)
        {
            return Err(invalid(
                "limits: expected min_memory_bytes <= default_memory_bytes <= max_memory_bytes",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// How sandboxes are spawned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Interpreter binary, resolved through `path_env` when relative.
    pub interpreter: PathBuf,
    /// Arguments placed before the program file name.
    pub interpreter_args: Vec<String>,
    /// Parent directory for per-run sandbox directories. System temp dir
    /// when unset.
    pub workspace_root: Option<PathBuf>,
    /// `PATH` handed to the child; nothing else is inherited.
    pub path_env: String,
    /// Try to enter fresh user + network namespaces before exec.
    pub isolate_namespaces: bool,
    /// `RLIMIT_FSIZE` for files the program writes.
    pub max_file_bytes: u64,
    /// `RLIMIT_NOFILE`.
    pub max_open_files: u64,
    /// How long to wait for output pipes to close after the child exits.
    pub drain_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            interpreter_args: vec!["-I".to_string(), "-B".to_string()],
            workspace_root: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            isolate_namespaces: true,
            max_file_bytes: 16 * MIB,
            max_open_files: 64,
            drain_grace_ms: 500,
        }
    }
}

impl RunnerConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interpreter.as_os_str().is_empty() {
            return Err(invalid("runner.interpreter must not be empty"));
        }
        if self.max_open_files < 8 {
            return Err(invalid("runner.max_open_files must be at least 8"));
        }
        if self.drain_grace_ms == 0 {
            return Err(invalid("runner.drain_grace_ms must be at least 1"));
        }
        if let Some(root) = &self.workspace_root {
            if !root.is_absolute() {
                return Err(invalid(format!(
                    "runner.workspace_root must be absolute, got {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Admission-control capacity: sandboxes running at once.
    pub max_concurrent: usize,
    /// Programs larger than this are rejected by the analyzer.
    pub max_source_bytes: usize,
    /// Replacement rule table; the built-in table when unset.
    pub rules_path: Option<PathBuf>,
    pub limits: LimitPolicy,
    pub runner: RunnerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_source_bytes: 64 * KIB as usize,
            rules_path: None,
            limits: LimitPolicy::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent must be at least 1"));
        }
        if self.max_concurrent > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(invalid("max_concurrent is too large"));
        }
        if self.max_source_bytes == 0 {
            return Err(invalid("max_source_bytes must be at least 1"));
        }
        self.limits.validate()?;
        self.runner.validate()
    }
}
