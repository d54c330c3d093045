use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Source error in '{source_name}': {message}")]
    SourceError {
        source_name: String,
        message: String,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Cache error: {0}")]
    CacheError(String),

    /// A failure observed by several callers at once, e.g. every request
    /// that joined the same in-flight execution.
    #[error(transparent)]
    Shared(Arc<QueryError>),
}

impl QueryError {
    /// Create a source error for the named backing source
    pub fn source_error(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        QueryError::SourceError {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Wrap a shared failure, flattening nested sharing
    pub fn shared(error: Arc<QueryError>) -> Self {
        match error.as_ref() {
            QueryError::Shared(inner) => QueryError::Shared(Arc::clone(inner)),
            _ => QueryError::Shared(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
