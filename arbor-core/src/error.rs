use thiserror::Error;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    User(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContainerError {
    /// Whether the error carries a cancellation signal rather than a
    /// failure. Cancellation is the only kind a computation does not
    /// recover from.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ContainerError::Cancelled(_))
    }
}

impl From<arbor_model::ModelError> for ContainerError {
    fn from(err: arbor_model::ModelError) -> Self {
        ContainerError::User(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;
