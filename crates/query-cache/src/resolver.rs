//! Directive resolution: decides whether and how a command is cached

use crate::config::CacheConfig;
use crate::directive::{CacheDirective, Scope};
use crate::source::SourceCapabilities;
use query_core::{Command, CommandKind, ExecutionContext};
use std::collections::HashMap;
use std::fmt;

/// Why a command bypasses the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotCacheable {
    /// Caching is switched off
    Disabled,
    /// Only read-only commands are cached
    DataModifying(CommandKind),
    /// Configuration excludes the source
    SourceOverride(String),
    /// The source forbids caching of its results
    SourceForbids(String),
    /// The execution context lacks an identifier the scope needs
    MissingContext(Scope),
}

impl fmt::Display for NotCacheable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotCacheable::Disabled => write!(f, "cache disabled"),
            NotCacheable::DataModifying(kind) => write!(f, "{} command modifies data", kind.tag()),
            NotCacheable::SourceOverride(source) => {
                write!(f, "source '{}' excluded by configuration", source)
            }
            NotCacheable::SourceForbids(source) => {
                write!(f, "source '{}' does not allow caching", source)
            }
            NotCacheable::MissingContext(scope) => {
                write!(f, "{} scope needs identifiers missing from the context", scope)
            }
        }
    }
}

/// Outcome of resolving a command's caching policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Cache(CacheDirective),
    NotCacheable(NotCacheable),
}

/// Policy deciding the directive for each command.
///
/// Implementations must be free of side effects: they are consulted once per
/// command before anything touches the store or the execution gate.
pub trait DirectiveResolver: Send + Sync {
    fn resolve(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        capabilities: &SourceCapabilities,
    ) -> Resolution;
}

/// Resolver driven by [`CacheConfig`] and source capabilities
#[derive(Debug, Clone)]
pub struct ConfiguredResolver {
    enabled: bool,
    defaults: CacheDirective,
    source_overrides: HashMap<String, bool>,
}

impl ConfiguredResolver {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            defaults: config.default_directive(),
            source_overrides: config.source_overrides.clone(),
        }
    }

    fn scope_satisfied(scope: Scope, ctx: &ExecutionContext) -> bool {
        match scope {
            Scope::Global | Scope::Vdb => true,
            Scope::User => ctx.user.is_some(),
            Scope::Session => ctx.session_id.is_some(),
            Scope::Request => ctx.session_id.is_some() && ctx.request_id.is_some(),
        }
    }
}

impl DirectiveResolver for ConfiguredResolver {
    fn resolve(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        capabilities: &SourceCapabilities,
    ) -> Resolution {
        if !self.enabled {
            return Resolution::NotCacheable(NotCacheable::Disabled);
        }
        if !command.is_read_only() {
            return Resolution::NotCacheable(NotCacheable::DataModifying(command.kind));
        }

        let source = if capabilities.name.is_empty() {
            command.source.as_str()
        } else {
            capabilities.name.as_str()
        };
        match self.source_overrides.get(source) {
            Some(false) => {
                return Resolution::NotCacheable(NotCacheable::SourceOverride(source.to_string()))
            }
            Some(true) => {}
            None if !capabilities.caching_allowed => {
                return Resolution::NotCacheable(NotCacheable::SourceForbids(source.to_string()))
            }
            None => {}
        }

        let directive = capabilities
            .directive
            .clone()
            .unwrap_or_else(|| self.defaults.clone());
        if !Self::scope_satisfied(directive.scope, ctx) {
            return Resolution::NotCacheable(NotCacheable::MissingContext(directive.scope));
        }

        Resolution::Cache(directive)
    }
}
