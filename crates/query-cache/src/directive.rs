//! Cache directives: the per-command caching policy

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Visibility and lifetime boundary of a cached result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible only within one request
    Request,
    /// Visible to every request of one session
    Session,
    /// Shared by all sessions of one user within a VDB
    User,
    /// Shared process-wide for one deployed VDB
    Vdb,
    /// Shared by everything
    Global,
}

impl Scope {
    fn breadth(self) -> u8 {
        match self {
            Scope::Request => 0,
            Scope::Session => 1,
            Scope::User => 2,
            Scope::Vdb => 3,
            Scope::Global => 4,
        }
    }

    /// Whichever of the two scopes shares entries with fewer callers
    pub fn narrowest(self, other: Scope) -> Scope {
        if other.breadth() < self.breadth() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Request => "request",
            Scope::Session => "session",
            Scope::User => "user",
            Scope::Vdb => "vdb",
            Scope::Global => "global",
        };
        f.write_str(name)
    }
}

/// How an entry reacts to modifications of the tables it reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Invalidation {
    /// Ignore modifications; only TTL and capacity remove the entry
    None,
    /// Mark the entry invalid and reclaim it on the next lookup or sweep
    Lazy,
    /// Remove the entry as soon as a modification is reported
    Immediate,
}

/// Immutable caching decision for one command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDirective {
    pub scope: Scope,
    /// `None` or zero keeps the entry until capacity pressure evicts it
    pub ttl: Option<Duration>,
    pub prefer_memory: bool,
    /// Drain the source completely before serving anything
    pub read_all: bool,
    /// Allow in-place replacement of the sealed rows
    pub updatable: bool,
    pub invalidation: Invalidation,
}

impl Default for CacheDirective {
    fn default() -> Self {
        Self {
            scope: Scope::Vdb,
            ttl: None,
            prefer_memory: false,
            read_all: true,
            updatable: false,
            invalidation: Invalidation::Immediate,
        }
    }
}

impl CacheDirective {
    /// Create a directive with the given scope and defaults elsewhere
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the time-to-live; zero means no expiry
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { None } else { Some(ttl) };
        self
    }

    pub fn with_ttl_millis(self, ttl_millis: u64) -> Self {
        self.with_ttl(Duration::from_millis(ttl_millis))
    }

    pub fn with_prefer_memory(mut self, prefer_memory: bool) -> Self {
        self.prefer_memory = prefer_memory;
        self
    }

    pub fn with_read_all(mut self, read_all: bool) -> Self {
        self.read_all = read_all;
        self
    }

    pub fn with_updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    pub fn with_invalidation(mut self, invalidation: Invalidation) -> Self {
        self.invalidation = invalidation;
        self
    }

    /// Instant after which an entry created at `created_at` is stale
    pub fn expires_at(&self, created_at: Instant) -> Option<Instant> {
        self.ttl
            .filter(|ttl| !ttl.is_zero())
            .and_then(|ttl| created_at.checked_add(ttl))
    }
}
