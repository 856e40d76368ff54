use thiserror::Error;

/// Errors raised while constructing or validating model types.
///
/// This is distinct from the richer `CoreError` taxonomy in `media-core`,
/// which covers orchestration failures. `ModelError` only covers invariant
/// violations caught at the data-type boundary (bad paths, empty ids, zero
/// durations and the like).
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid media: {0}")]
    InvalidMedia(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
