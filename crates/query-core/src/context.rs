//! Execution context identifiers supplied by the connection layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a deployed virtual database
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VdbId {
    pub name: String,
    pub version: String,
}

impl VdbId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for VdbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// Per-request context: which VDB, user, session and request a command runs under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub vdb: VdbId,
    pub user: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
}

impl ExecutionContext {
    /// Create a context bound to a VDB only
    pub fn new(vdb: VdbId) -> Self {
        Self {
            vdb,
            user: None,
            session_id: None,
            request_id: None,
        }
    }

    /// Set the authenticated user
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the session id
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the request id
    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}
