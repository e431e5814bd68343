//! Library error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MockError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Produce(#[from] crate::producer::ProduceError),

    #[error("{0:?} not found in PATH")]
    CommandNotFound(String),

    #[error("assertion checks failed")]
    ChecksFailed,
}
