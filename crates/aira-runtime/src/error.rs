use thiserror::Error;

/// Errors from the container runtime and the git workspace built on it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid {kind} limit {value:?}: {reason}")]
    InvalidLimit {
        kind: &'static str,
        value: String,
        reason: String,
    },

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Waiting on container {id} failed: {reason}")]
    Wait { id: String, reason: String },

    #[error("git {command} exited with code {code}: {output}")]
    GitCommandFailed {
        command: String,
        code: i64,
        output: String,
    },

    #[error("Container I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
