//! Cache-layer errors
//!
//! None of these reach the caller of [`QueryCache::execute`](crate::QueryCache::execute)
//! except [`CacheError::Materialization`], which carries the backing source's
//! own failure.

use query_core::QueryError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Command is not cacheable: {0}")]
    NotCacheable(String),

    #[error("Cannot derive a cache key: {0}")]
    KeyDerivation(String),

    #[error("Timed out after {0:?} waiting for an in-flight execution")]
    WaitTimeout(Duration),

    #[error("Materialization failed: {0}")]
    Materialization(Arc<QueryError>),

    #[error("Entry of {required} bytes exceeds the {budget} byte budget")]
    CapacityExceeded { required: usize, budget: usize },

    #[error("An entry is already being filled for this key")]
    AlreadyFilling,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Entry was invalidated while filling")]
    Invalidated,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Arrow error: {0}")]
    Arrow(Arc<arrow::error::ArrowError>),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<arrow::error::ArrowError> for CacheError {
    fn from(err: arrow::error::ArrowError) -> Self {
        CacheError::Arrow(Arc::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

impl From<CacheError> for QueryError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Materialization(source) => QueryError::shared(source),
            other => QueryError::CacheError(other.to_string()),
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
