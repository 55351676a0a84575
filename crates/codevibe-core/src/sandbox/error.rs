//! Error types for the sandbox module.

use std::path::PathBuf;

/// Infrastructure failures of the sandbox layer. Anything the *program* does
/// (crash, timeout, huge output) is an outcome, not one of these.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to create sandbox directory: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed to write program file {path}: {source}")]
    WriteProgram {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn interpreter {interpreter}: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("sandboxed process exited before its pid could be read")]
    MissingPid,

    #[error("sandboxed process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("failed to wait for sandboxed process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
