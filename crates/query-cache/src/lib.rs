//! Result caching for federated query execution
//!
//! This crate sits between the engine and its backing sources and reuses the
//! rows of commands that were already executed.
//!
//! # Features
//!
//! - **Scoped keys**: Results are shared per request, session, user, VDB or globally
//! - **Directives**: Sources declare TTL, tier preference, read-ahead and updatability
//! - **Single-flight**: Concurrent identical commands execute the source once
//! - **Tiered storage**: LRU memory tier spilling to Arrow IPC files on disk
//! - **Streaming fills**: Readers can consume rows before the fill completes
//! - **Invalidation**: By key, scope teardown, or table modification
//! - **Statistics**: Hits, misses, evictions, demotions and wait timeouts
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{CacheConfig, QueryCache};
//!
//! let cache = QueryCache::new(CacheConfig::default())?;
//!
//! // The first call executes the source, later calls replay the cached rows
//! let results = cache.execute(&command, &ctx, &source)?;
//! for batch in results {
//!     let batch = batch?;
//!     // ...
//! }
//! ```

pub mod cache;
pub mod config;
pub mod directive;
pub mod error;
pub mod gate;
pub mod invalidation;
pub mod key;
pub mod materializer;
pub mod normalize;
pub mod resolver;
pub mod source;
pub mod stats;
pub mod store;
pub mod sweeper;

pub use cache::{CachedResults, QueryCache, ResultOrigin};
pub use config::CacheConfig;
pub use directive::{CacheDirective, Invalidation, Scope};
pub use error::{CacheError, CacheResult};
pub use gate::{Admission, ExecutionGate, FlightOutcome, FollowerTicket, LeaderGuard};
pub use invalidation::{CacheInvalidator, InvalidationEvent, NoOpInvalidator};
pub use key::{CacheKey, KeyDeriver, ScopeNamespace};
pub use materializer::{BufferReader, MaterializedRows, Materializer, RowBuffer};
pub use resolver::{ConfiguredResolver, DirectiveResolver, NotCacheable, Resolution};
pub use source::{SourceCapabilities, SourceExecutor};
pub use stats::{CacheStats, CacheStatsSnapshot};
pub use store::{EntryInfo, EntryState, EntryStore, FillHandle, Lookup, TierKind};
pub use sweeper::ExpirationSweeper;
