//! Cache invalidation support
//!
//! Provides traits and events for invalidating cached query results when
//! underlying data changes or a scope ends.

use crate::key::{CacheKey, ScopeNamespace};
use query_core::VdbId;

/// Trait for components that can trigger cache invalidation
pub trait CacheInvalidator: Send + Sync {
    /// Report a modification of a table; returns how many entries reacted
    fn invalidate_table(&self, table_name: &str) -> usize;

    /// Invalidate all cache entries
    fn invalidate_all(&self) -> usize;

    /// Check if the invalidator is enabled
    fn is_enabled(&self) -> bool;
}

/// Events that can trigger cache invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// A request, session, user or VDB lifetime ended
    ScopeEnded(ScopeNamespace),
    /// A table's data was modified (insert, update, delete)
    TableModified { table_name: String },
    /// One specific entry
    Key(CacheKey),
    /// Force invalidation of everything
    InvalidateAll,
}

impl InvalidationEvent {
    /// Create a table modification event
    pub fn table_modified(table_name: impl Into<String>) -> Self {
        Self::TableModified {
            table_name: table_name.into(),
        }
    }

    /// A session closed
    pub fn session_closed(vdb: VdbId, session_id: impl Into<String>) -> Self {
        Self::ScopeEnded(ScopeNamespace::session(vdb, session_id))
    }

    /// A request completed
    pub fn request_completed(
        vdb: VdbId,
        session_id: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self::ScopeEnded(ScopeNamespace::request(vdb, session_id, request_id))
    }

    /// A VDB was undeployed or redeployed
    pub fn vdb_undeployed(vdb: VdbId) -> Self {
        Self::ScopeEnded(ScopeNamespace::vdb(vdb))
    }
}

/// A simple no-op invalidator that does nothing
#[derive(Debug, Default, Clone)]
pub struct NoOpInvalidator;

impl CacheInvalidator for NoOpInvalidator {
    fn invalidate_table(&self, _table_name: &str) -> usize {
        0
    }

    fn invalidate_all(&self) -> usize {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }
}
