use std::collections::BTreeMap;
use thiserror::Error;

/// The error taxonomy shared by every port and plug-in contract. `media-core`
/// re-exports this as its own error type rather than duplicating it, so a
/// repository implementation and the orchestration logic that calls it
/// agree on exactly one set of variants.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("already active: {0}")]
    AlreadyActive(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Attach diagnostic context without changing the error's kind. Kept
    /// separate from the variant payload so callers can add context at each
    /// layer without restructuring the message.
    pub fn with_context(self, context: BTreeMap<String, String>) -> CoreErrorWithContext {
        CoreErrorWithContext {
            error: self,
            context,
        }
    }
}

#[derive(Debug, Error)]
#[error("{error}")]
pub struct CoreErrorWithContext {
    #[source]
    pub error: CoreError,
    pub context: BTreeMap<String, String>,
}

impl From<media_model::ModelError> for CoreError {
    fn from(err: media_model::ModelError) -> Self {
        CoreError::InvalidArgument(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CoreError::NotFound(err.to_string()),
            _ => CoreError::Internal(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
