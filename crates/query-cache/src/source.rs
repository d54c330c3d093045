//! Backing-source interface consumed by the cache

use crate::directive::CacheDirective;
use query_core::{Command, ExecutionContext, Result, RowStream};

/// What a backing source declares about caching of its results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCapabilities {
    /// Source name, used for per-source configuration overrides
    pub name: String,
    /// Whether the source permits its results to be cached at all
    pub caching_allowed: bool,
    /// Directive supplied by the source itself, overriding configured defaults
    pub directive: Option<CacheDirective>,
}

impl Default for SourceCapabilities {
    fn default() -> Self {
        Self {
            name: String::new(),
            caching_allowed: true,
            directive: None,
        }
    }
}

impl SourceCapabilities {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Forbid caching of this source's results
    pub fn uncacheable(mut self) -> Self {
        self.caching_allowed = false;
        self
    }

    /// Supply the directive for every command run against this source
    pub fn with_directive(mut self, directive: CacheDirective) -> Self {
        self.directive = Some(directive);
        self
    }
}

/// A backing source able to execute commands
pub trait SourceExecutor: Send + Sync {
    /// Execute the command and return a pull iterator over its rows
    fn execute(&self, command: &Command, ctx: &ExecutionContext) -> Result<RowStream>;

    /// Caching capabilities of this source
    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::default()
    }
}
