//! Cache key derivation
//!
//! A key is the scope namespace plus two SHA-256 digests: one over the
//! canonical command (kind, source, canonical text) and one over the literal
//! parameter bindings.

use crate::directive::Scope;
use crate::error::{CacheError, CacheResult};
use crate::normalize::canonicalize;
use query_core::{Command, ExecutionContext, VdbId};
use sha2::{Digest, Sha256};
use std::fmt;

/// Concrete namespace a scope resolves to for one execution context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeNamespace {
    Global,
    Vdb {
        vdb: VdbId,
    },
    User {
        vdb: VdbId,
        user: String,
    },
    Session {
        vdb: VdbId,
        session: String,
    },
    Request {
        vdb: VdbId,
        session: String,
        request: String,
    },
}

impl ScopeNamespace {
    /// Resolve the namespace of `scope` within `ctx`
    pub fn resolve(scope: Scope, ctx: &ExecutionContext) -> CacheResult<Self> {
        let missing =
            |what: &str| CacheError::KeyDerivation(format!("{} scope requires a {}", scope, what));
        let vdb = ctx.vdb.clone();

        let namespace = match scope {
            Scope::Global => ScopeNamespace::Global,
            Scope::Vdb => ScopeNamespace::Vdb { vdb },
            Scope::User => ScopeNamespace::User {
                vdb,
                user: ctx.user.clone().ok_or_else(|| missing("user"))?,
            },
            Scope::Session => ScopeNamespace::Session {
                vdb,
                session: ctx.session_id.clone().ok_or_else(|| missing("session id"))?,
            },
            Scope::Request => ScopeNamespace::Request {
                vdb,
                session: ctx.session_id.clone().ok_or_else(|| missing("session id"))?,
                request: ctx.request_id.clone().ok_or_else(|| missing("request id"))?,
            },
        };
        Ok(namespace)
    }

    /// Namespace torn down when a VDB is undeployed
    pub fn vdb(vdb: VdbId) -> Self {
        ScopeNamespace::Vdb { vdb }
    }

    /// Namespace torn down when a session ends
    pub fn session(vdb: VdbId, session: impl Into<String>) -> Self {
        ScopeNamespace::Session {
            vdb,
            session: session.into(),
        }
    }

    /// Namespace torn down when a request completes
    pub fn request(vdb: VdbId, session: impl Into<String>, request: impl Into<String>) -> Self {
        ScopeNamespace::Request {
            vdb,
            session: session.into(),
            request: request.into(),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            ScopeNamespace::Global => Scope::Global,
            ScopeNamespace::Vdb { .. } => Scope::Vdb,
            ScopeNamespace::User { .. } => Scope::User,
            ScopeNamespace::Session { .. } => Scope::Session,
            ScopeNamespace::Request { .. } => Scope::Request,
        }
    }

    /// The VDB this namespace belongs to, if any
    pub fn vdb_id(&self) -> Option<&VdbId> {
        match self {
            ScopeNamespace::Global => None,
            ScopeNamespace::Vdb { vdb }
            | ScopeNamespace::User { vdb, .. }
            | ScopeNamespace::Session { vdb, .. }
            | ScopeNamespace::Request { vdb, .. } => Some(vdb),
        }
    }

    /// Whether tearing down `self` must also tear down `other`
    pub fn covers(&self, other: &ScopeNamespace) -> bool {
        match (self, other) {
            (ScopeNamespace::Vdb { vdb }, other) => other.vdb_id() == Some(vdb),
            (
                ScopeNamespace::Session { vdb, session },
                ScopeNamespace::Request {
                    vdb: other_vdb,
                    session: other_session,
                    ..
                },
            ) => vdb == other_vdb && session == other_session,
            _ => self == other,
        }
    }

    fn write_canonical(&self, out: &mut Vec<u8>) {
        let parts: Vec<&str> = match self {
            ScopeNamespace::Global => vec![],
            ScopeNamespace::Vdb { vdb } => vec![vdb.name.as_str(), vdb.version.as_str()],
            ScopeNamespace::User { vdb, user } => {
                vec![vdb.name.as_str(), vdb.version.as_str(), user.as_str()]
            }
            ScopeNamespace::Session { vdb, session } => {
                vec![vdb.name.as_str(), vdb.version.as_str(), session.as_str()]
            }
            ScopeNamespace::Request {
                vdb,
                session,
                request,
            } => vec![
                vdb.name.as_str(),
                vdb.version.as_str(),
                session.as_str(),
                request.as_str(),
            ],
        };
        out.extend_from_slice(self.scope().to_string().as_bytes());
        for part in parts {
            out.extend_from_slice(&(part.len() as u64).to_be_bytes());
            out.extend_from_slice(part.as_bytes());
        }
    }
}

impl fmt::Display for ScopeNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeNamespace::Global => write!(f, "global"),
            ScopeNamespace::Vdb { vdb } => write!(f, "vdb:{}", vdb),
            ScopeNamespace::User { vdb, user } => write!(f, "user:{}:{}", vdb, user),
            ScopeNamespace::Session { vdb, session } => write!(f, "session:{}:{}", vdb, session),
            ScopeNamespace::Request {
                vdb,
                session,
                request,
            } => write!(f, "request:{}:{}:{}", vdb, session, request),
        }
    }
}

/// Key for cache lookups
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: ScopeNamespace,
    command_digest: [u8; 32],
    parameters_digest: [u8; 32],
}

impl CacheKey {
    /// Create a cache key from pre-computed digests
    pub fn from_digests(
        namespace: ScopeNamespace,
        command_digest: [u8; 32],
        parameters_digest: [u8; 32],
    ) -> Self {
        Self {
            namespace,
            command_digest,
            parameters_digest,
        }
    }

    pub fn namespace(&self) -> &ScopeNamespace {
        &self.namespace
    }

    pub fn command_digest(&self) -> &[u8; 32] {
        &self.command_digest
    }

    pub fn parameters_digest(&self) -> &[u8; 32] {
        &self.parameters_digest
    }

    /// Hex digest of the whole key, stable across processes
    pub fn fingerprint(&self) -> String {
        let mut bytes = Vec::with_capacity(128);
        self.namespace.write_canonical(&mut bytes);
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.update(self.command_digest);
        hasher.update(self.parameters_digest);
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.namespace,
            &hex::encode(self.command_digest)[..12]
        )
    }
}

/// Derives cache keys from commands
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyDeriver;

impl KeyDeriver {
    /// Derive the key of `command` under `scope` in `ctx`.
    ///
    /// Fails with [`CacheError::KeyDerivation`] when the command is
    /// non-deterministic or the scope's identifiers are missing from `ctx`.
    pub fn derive(command: &Command, scope: Scope, ctx: &ExecutionContext) -> CacheResult<CacheKey> {
        let canonical = canonicalize(&command.sql)?;
        let scope = canonical
            .required_scope
            .map_or(scope, |required| scope.narrowest(required));
        let namespace = ScopeNamespace::resolve(scope, ctx)?;

        let mut hasher = Sha256::new();
        hasher.update(command.kind.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(command.source.to_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.text.as_bytes());
        let command_digest: [u8; 32] = hasher.finalize().into();

        let mut bindings = Vec::with_capacity(16 * command.parameters.len() + 8);
        bindings.extend_from_slice(&(command.parameters.len() as u64).to_be_bytes());
        for parameter in &command.parameters {
            parameter.write_canonical(&mut bindings);
        }
        let parameters_digest: [u8; 32] = Sha256::digest(&bindings).into();

        Ok(CacheKey::from_digests(namespace, command_digest, parameters_digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(VdbId::new("ResultsCachingH2VDB", "1"))
            .with_user("alice")
            .with_session("s-1")
            .with_request("r-1")
    }

    #[test]
    fn test_equivalent_commands_share_key() {
        let a = Command::query("SELECT * FROM accounts WHERE id = ?").with_parameters([7i64]);
        let b = Command::query("select *  from ACCOUNTS where ID = ?").with_parameters([7i64]);

        let ka = KeyDeriver::derive(&a, Scope::Vdb, &ctx()).unwrap();
        let kb = KeyDeriver::derive(&b, Scope::Vdb, &ctx()).unwrap();
        assert_eq!(ka, kb);
        assert_eq!(ka.fingerprint(), kb.fingerprint());
    }

    #[test]
    fn test_parameters_are_part_of_key() {
        let template = "SELECT * FROM accounts WHERE id = ?";
        let a = Command::query(template).with_parameters([7i64]);
        let b = Command::query(template).with_parameters([8i64]);
        let c = Command::query(template).with_parameters(["7"]);

        let ka = KeyDeriver::derive(&a, Scope::Vdb, &ctx()).unwrap();
        let kb = KeyDeriver::derive(&b, Scope::Vdb, &ctx()).unwrap();
        let kc = KeyDeriver::derive(&c, Scope::Vdb, &ctx()).unwrap();

        assert_eq!(ka.command_digest(), kb.command_digest());
        assert_ne!(ka, kb);
        assert_ne!(ka, kc);
    }

    #[test]
    fn test_source_and_kind_distinguish_keys() {
        let a = Command::query("SELECT 1").with_source("h2");
        let b = Command::query("SELECT 1").with_source("postgres");
        let ka = KeyDeriver::derive(&a, Scope::Global, &ctx()).unwrap();
        let kb = KeyDeriver::derive(&b, Scope::Global, &ctx()).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn test_scope_namespaces_separate_keys() {
        let command = Command::query("SELECT * FROM accounts");
        let other_session = ctx().with_session("s-2");

        let vdb_a = KeyDeriver::derive(&command, Scope::Vdb, &ctx()).unwrap();
        let vdb_b = KeyDeriver::derive(&command, Scope::Vdb, &other_session).unwrap();
        assert_eq!(vdb_a, vdb_b);

        let session_a = KeyDeriver::derive(&command, Scope::Session, &ctx()).unwrap();
        let session_b = KeyDeriver::derive(&command, Scope::Session, &other_session).unwrap();
        assert_ne!(session_a, session_b);
        assert_ne!(vdb_a, session_a);
    }

    #[test]
    fn test_missing_scope_context() {
        let command = Command::query("SELECT * FROM accounts");
        let bare = ExecutionContext::new(VdbId::new("vdb", "1"));
        let err = KeyDeriver::derive(&command, Scope::Session, &bare).unwrap_err();
        assert!(matches!(err, CacheError::KeyDerivation(_)));
        assert!(KeyDeriver::derive(&command, Scope::Vdb, &bare).is_ok());
    }

    #[test]
    fn test_caller_dependent_command_narrows_scope() {
        let command = Command::query("SELECT * FROM accounts WHERE owner = CURRENT_USER");
        let bob = ctx().with_user("bob");

        let alice_key = KeyDeriver::derive(&command, Scope::Vdb, &ctx()).unwrap();
        let bob_key = KeyDeriver::derive(&command, Scope::Vdb, &bob).unwrap();
        assert_ne!(alice_key, bob_key);
        assert_eq!(alice_key.namespace().scope(), Scope::User);

        // already narrower than the command demands
        let session_key = KeyDeriver::derive(&command, Scope::Session, &ctx()).unwrap();
        assert_eq!(session_key.namespace().scope(), Scope::Session);

        let anonymous = ExecutionContext::new(VdbId::new("vdb", "1"));
        assert!(matches!(
            KeyDeriver::derive(&command, Scope::Global, &anonymous),
            Err(CacheError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_non_deterministic_command() {
        let command = Command::query("SELECT * FROM orders WHERE placed > NOW()");
        assert!(matches!(
            KeyDeriver::derive(&command, Scope::Vdb, &ctx()),
            Err(CacheError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_namespace_coverage() {
        let vdb = VdbId::new("v", "1");
        let other = VdbId::new("w", "1");
        let vdb_ns = ScopeNamespace::vdb(vdb.clone());
        let session_ns = ScopeNamespace::session(vdb.clone(), "s");
        let request_ns = ScopeNamespace::request(vdb.clone(), "s", "r");
        let foreign_request = ScopeNamespace::request(vdb.clone(), "t", "r");

        assert!(vdb_ns.covers(&session_ns));
        assert!(vdb_ns.covers(&request_ns));
        assert!(!vdb_ns.covers(&ScopeNamespace::vdb(other)));
        assert!(!vdb_ns.covers(&ScopeNamespace::Global));
        assert!(session_ns.covers(&request_ns));
        assert!(!session_ns.covers(&foreign_request));
        assert!(!session_ns.covers(&vdb_ns));
        assert!(ScopeNamespace::Global.covers(&ScopeNamespace::Global));
    }
}
