//! Result cache façade
//!
//! [`QueryCache::execute`] sits between the engine and a backing source. It
//! resolves the command's directive, derives its key, serves hits from the
//! entry store, and otherwise lets exactly one caller per key execute while
//! the others wait for and share its result.

use crate::config::CacheConfig;
use crate::directive::CacheDirective;
use crate::error::{CacheError, CacheResult};
use crate::gate::{Admission, ExecutionGate, FlightOutcome, LeaderGuard};
use crate::invalidation::{CacheInvalidator, InvalidationEvent};
use crate::key::{CacheKey, KeyDeriver, ScopeNamespace};
use crate::materializer::{BufferReader, MaterializedRows, Materializer, RowBuffer};
use crate::resolver::{ConfiguredResolver, DirectiveResolver, Resolution};
use crate::source::SourceExecutor;
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::store::{EntryInfo, EntryStore, FillHandle, Lookup};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use query_core::{Command, ExecutionContext, QueryError, Result, RowStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Admission attempts before a request gives up on sharing and executes directly
const MAX_ADMISSIONS: usize = 3;

/// How a [`CachedResults`] was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOrigin {
    /// Served from a sealed entry
    Hit,
    /// This request executed the source and filled the entry
    Miss,
    /// Joined another request's execution of the same key
    Shared,
    /// Executed without the cache
    Bypass,
}

enum ResultRows {
    Replay {
        rows: MaterializedRows,
        position: usize,
    },
    Live(BufferReader),
    Direct(RowStream),
}

/// Row iterator handed back to the engine
pub struct CachedResults {
    origin: ResultOrigin,
    rows: ResultRows,
}

impl CachedResults {
    fn replay(origin: ResultOrigin, rows: MaterializedRows) -> Self {
        Self {
            origin,
            rows: ResultRows::Replay { rows, position: 0 },
        }
    }

    fn live(origin: ResultOrigin, buffer: &Arc<RowBuffer>) -> Self {
        Self {
            origin,
            rows: ResultRows::Live(buffer.reader()),
        }
    }

    fn direct(stream: RowStream) -> Self {
        Self {
            origin: ResultOrigin::Bypass,
            rows: ResultRows::Direct(stream),
        }
    }

    pub fn origin(&self) -> ResultOrigin {
        self.origin
    }

    /// Drain the remaining batches, stopping at the first error
    pub fn collect_batches(self) -> Result<Vec<RecordBatch>> {
        self.collect()
    }
}

impl Iterator for CachedResults {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.rows {
            ResultRows::Replay { rows, position } => {
                let batch = rows.batches().get(*position)?.clone();
                *position += 1;
                Some(Ok(batch))
            }
            ResultRows::Live(reader) => reader.next(),
            ResultRows::Direct(stream) => stream.next(),
        }
    }
}

impl std::fmt::Debug for CachedResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = match &self.rows {
            ResultRows::Replay { .. } => "replay",
            ResultRows::Live(_) => "live",
            ResultRows::Direct(_) => "direct",
        };
        f.debug_struct("CachedResults")
            .field("origin", &self.origin)
            .field("rows", &rows)
            .finish()
    }
}

/// A fill owned by its leader: drains the source, seals, releases followers
struct FillJob {
    store: Arc<EntryStore>,
    stats: Arc<CacheStats>,
    materializer: Materializer,
    handle: FillHandle,
    guard: LeaderGuard,
    stream: RowStream,
}

impl FillJob {
    fn run(self) -> CacheResult<MaterializedRows> {
        // bound first so it drops last: followers must not wake to a FILLING record
        let FillJob {
            guard,
            store,
            stats,
            materializer,
            handle,
            stream,
        } = self;
        let key = handle.key().clone();
        let buffer = Arc::clone(handle.buffer());

        match materializer.materialize(stream, &buffer) {
            Ok(rows) => {
                match store.seal(handle, rows.clone()) {
                    Ok(()) => stats.record_fill(),
                    Err(err) => debug!("Not caching {}: {}", key, err),
                }
                guard.complete(rows.clone());
                Ok(rows)
            }
            Err(err) => {
                warn!("Fill of {} failed: {}", key, err);
                store.abort(handle);
                stats.record_fill_failure();
                if let CacheError::Materialization(source) = &err {
                    guard.fail(Arc::clone(source));
                }
                Err(err)
            }
        }
    }
}

/// Thread-safe result cache in front of backing sources
pub struct QueryCache {
    store: Arc<EntryStore>,
    gate: ExecutionGate,
    resolver: Box<dyn DirectiveResolver>,
    stats: Arc<CacheStats>,
    config: CacheConfig,
}

impl QueryCache {
    /// Create a new query cache with the given configuration
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let stats = Arc::new(CacheStats::new());
        let store = EntryStore::from_config(&config, Arc::clone(&stats))?;
        if let Some(dir) = &config.durable_dir {
            info!("Result cache durable tier at {}", dir.display());
        }

        Ok(Self {
            store: Arc::new(store),
            gate: ExecutionGate::new(),
            resolver: Box::new(ConfiguredResolver::new(&config)),
            stats,
            config,
        })
    }

    /// Create a memory-only cache with default configuration
    pub fn with_defaults() -> Self {
        let config = CacheConfig::default();
        let stats = Arc::new(CacheStats::new());
        let memory = Box::new(crate::store::MemoryTier::new(
            config.max_entries,
            config.max_memory_bytes,
        ));
        Self {
            store: Arc::new(EntryStore::new(memory, None, Arc::clone(&stats))),
            gate: ExecutionGate::new(),
            resolver: Box::new(ConfiguredResolver::new(&config)),
            stats,
            config,
        }
    }

    /// Replace the directive resolver
    pub fn with_resolver(mut self, resolver: impl DirectiveResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Check if caching is enabled
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Get the cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Execute `command` through the cache.
    ///
    /// Only failures of the backing source reach the caller; anything going
    /// wrong inside the cache degrades to executing the source directly.
    pub fn execute(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        source: &dyn SourceExecutor,
    ) -> Result<CachedResults> {
        let capabilities = source.capabilities();
        let directive = match self.resolver.resolve(command, ctx, &capabilities) {
            Resolution::Cache(directive) => directive,
            Resolution::NotCacheable(reason) => {
                debug!("Bypassing cache: {}", reason);
                let results = self.bypass(command, ctx, source)?;
                if !command.is_read_only() {
                    for table in &command.tables {
                        self.store.invalidate_table(table);
                    }
                }
                return Ok(results);
            }
        };

        let key = match KeyDeriver::derive(command, directive.scope, ctx) {
            Ok(key) => key,
            Err(err) => {
                debug!("Bypassing cache: {}", err);
                return self.bypass(command, ctx, source);
            }
        };

        for attempt in 1..=MAX_ADMISSIONS {
            match self.store.lookup(&key) {
                Lookup::Hit(rows) => {
                    self.stats.record_hit();
                    debug!("Cache hit for {}", key);
                    return Ok(CachedResults::replay(ResultOrigin::Hit, rows));
                }
                Lookup::Partial(buffer) => {
                    self.stats.record_hit();
                    debug!("Attached to streaming fill of {}", key);
                    return Ok(CachedResults::live(ResultOrigin::Shared, &buffer));
                }
                Lookup::Filling | Lookup::Miss => {}
            }

            let ticket = match self.gate.admit(&key) {
                Admission::Leader(guard) => {
                    return self.lead(guard, &key, directive, command, ctx, source, false)
                }
                Admission::Follower(ticket) => ticket,
            };

            match ticket.wait(self.config.wait_timeout) {
                Ok(FlightOutcome::Ready(rows)) => {
                    self.stats.record_hit();
                    return Ok(CachedResults::replay(ResultOrigin::Shared, rows));
                }
                Ok(FlightOutcome::Streaming(buffer)) => {
                    self.stats.record_hit();
                    return Ok(CachedResults::live(ResultOrigin::Shared, &buffer));
                }
                Err(CacheError::WaitTimeout(waited)) => {
                    self.stats.record_wait_timeout();
                    warn!(
                        "Timed out after {:?} waiting for {}, executing directly",
                        waited, key
                    );
                    return self.bypass(command, ctx, source);
                }
                Err(CacheError::Materialization(error)) => {
                    return Err(QueryError::shared(error));
                }
                Err(err) => {
                    debug!("Execution of {} was abandoned ({}), attempt {}", key, err, attempt);
                }
            }
        }

        self.bypass(command, ctx, source)
    }

    /// Re-execute `command` and swap its rows in atomically.
    ///
    /// Readers keep seeing the previous rows until the new set is complete.
    /// Entries that are not updatable are invalidated and filled afresh.
    pub fn refresh(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        source: &dyn SourceExecutor,
    ) -> Result<CachedResults> {
        let directive = match self.resolver.resolve(command, ctx, &source.capabilities()) {
            Resolution::Cache(directive) => directive,
            Resolution::NotCacheable(_) => return self.bypass(command, ctx, source),
        };
        let key = match KeyDeriver::derive(command, directive.scope, ctx) {
            Ok(key) => key,
            Err(_) => return self.bypass(command, ctx, source),
        };

        if !directive.updatable {
            self.store.invalidate_key(&key);
            return self.execute(command, ctx, source);
        }

        match self.gate.admit(&key) {
            Admission::Leader(guard) => self.lead(guard, &key, directive, command, ctx, source, true),
            // whoever is executing right now produces rows at least as fresh
            Admission::Follower(ticket) => match ticket.wait(self.config.wait_timeout) {
                Ok(FlightOutcome::Ready(rows)) => Ok(CachedResults::replay(ResultOrigin::Shared, rows)),
                Ok(FlightOutcome::Streaming(buffer)) => {
                    Ok(CachedResults::live(ResultOrigin::Shared, &buffer))
                }
                Err(CacheError::Materialization(error)) => Err(QueryError::shared(error)),
                Err(_) => self.bypass(command, ctx, source),
            },
        }
    }

    /// Swap in `batches` as the rows of an updatable entry
    pub fn replace_rows(&self, key: &CacheKey, batches: Vec<RecordBatch>) -> CacheResult<()> {
        let info = self
            .store
            .entry_info(key)
            .ok_or_else(|| CacheError::NotCacheable(format!("no entry for {}", key)))?;
        if !info.directive.updatable {
            return Err(CacheError::NotCacheable(format!("{} is not updatable", key)));
        }

        let guard = match self.gate.admit(key) {
            Admission::Leader(guard) => guard,
            Admission::Follower(_) => return Err(CacheError::AlreadyFilling),
        };
        let handle = self.store.begin_fill(key, info.directive, &info.tables)?;
        let rows = MaterializedRows::new(batches);
        self.store.seal(handle, rows.clone())?;
        guard.complete(rows);
        debug!("Replaced rows of {}", key);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lead(
        &self,
        guard: LeaderGuard,
        key: &CacheKey,
        directive: CacheDirective,
        command: &Command,
        ctx: &ExecutionContext,
        source: &dyn SourceExecutor,
        refresh: bool,
    ) -> Result<CachedResults> {
        if !refresh {
            // another leader may have sealed between our lookup and admission
            if let Lookup::Hit(rows) = self.store.lookup(key) {
                self.stats.record_hit();
                guard.complete(rows.clone());
                return Ok(CachedResults::replay(ResultOrigin::Hit, rows));
            }
        }
        self.stats.record_miss();

        let materializer = Materializer::new(&directive);
        let handle = match self.store.begin_fill(key, directive, &command.tables) {
            Ok(handle) => handle,
            Err(err) => {
                debug!("Cannot fill {}: {}", key, err);
                drop(guard);
                return self.bypass(command, ctx, source);
            }
        };

        let stream = match source.execute(command, ctx) {
            Ok(stream) => stream,
            Err(err) => {
                let error = Arc::new(err);
                warn!("Source failed for {}: {}", key, error);
                self.store.abort(handle);
                self.stats.record_fill_failure();
                guard.fail(Arc::clone(&error));
                return Err(QueryError::shared(error));
            }
        };

        let job = FillJob {
            store: Arc::clone(&self.store),
            stats: Arc::clone(&self.stats),
            materializer,
            handle,
            guard,
            stream,
        };

        if !materializer.streams() || refresh {
            let rows = job.run()?;
            return Ok(CachedResults::replay(ResultOrigin::Miss, rows));
        }

        let buffer = Arc::clone(job.handle.buffer());
        job.guard.publish(Arc::clone(&buffer));
        self.spawn_fill(job, key);
        Ok(CachedResults::live(ResultOrigin::Miss, &buffer))
    }

    /// Drain a streaming fill on its own thread
    fn spawn_fill(&self, job: FillJob, key: &CacheKey) {
        let slot = Arc::new(Mutex::new(Some(job)));
        let spawned = {
            let slot = Arc::clone(&slot);
            thread::Builder::new()
                .name("query-cache-fill".to_string())
                .spawn(move || {
                    if let Some(job) = slot.lock().take() {
                        let _ = job.run();
                    }
                })
        };

        if let Err(err) = spawned {
            warn!("Failed to spawn fill thread for {}: {}, filling inline", key, err);
            if let Some(job) = slot.lock().take() {
                let _ = job.run();
            }
        }
    }

    fn bypass(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        source: &dyn SourceExecutor,
    ) -> Result<CachedResults> {
        self.stats.record_bypass();
        let stream = source.execute(command, ctx)?;
        Ok(CachedResults::direct(stream))
    }

    /// Key `command` would be cached under, if it is cacheable
    pub fn key_for(
        &self,
        command: &Command,
        ctx: &ExecutionContext,
        source: &dyn SourceExecutor,
    ) -> Option<CacheKey> {
        match self.resolver.resolve(command, ctx, &source.capabilities()) {
            Resolution::Cache(directive) => KeyDeriver::derive(command, directive.scope, ctx).ok(),
            Resolution::NotCacheable(_) => None,
        }
    }

    /// Invalidate everything a namespace covers
    pub fn invalidate_scope(&self, namespace: &ScopeNamespace) -> usize {
        let count = self.store.invalidate_scope(namespace);
        if count > 0 {
            info!("Invalidated {} cached results for {}", count, namespace);
        }
        count
    }

    /// Remove an entry from the cache
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        self.store.invalidate_key(key)
    }

    /// React to a modification of `table`
    pub fn invalidate_table(&self, table: &str) -> usize {
        self.store.invalidate_table(table)
    }

    /// Clear all entries from the cache
    pub fn clear(&self) -> usize {
        self.store.clear()
    }

    /// Apply an invalidation event; returns how many entries it affected
    pub fn apply(&self, event: &InvalidationEvent) -> usize {
        match event {
            InvalidationEvent::ScopeEnded(namespace) => self.invalidate_scope(namespace),
            InvalidationEvent::TableModified { table_name } => self.invalidate_table(table_name),
            InvalidationEvent::Key(key) => usize::from(self.invalidate_key(key)),
            InvalidationEvent::InvalidateAll => self.clear(),
        }
    }

    /// Expire entries that have exceeded their TTL
    pub fn evict_expired(&self) -> usize {
        self.store.evict_expired()
    }

    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.store.entry_info(key).map(|mut info| {
            info.waiters = self.gate.waiters(key);
            info
        })
    }

    /// Get a snapshot of cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Get the live statistics counters
    pub fn stats_handle(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    /// Get current number of entries
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Get current memory usage in bytes
    pub fn memory_used(&self) -> usize {
        self.store.memory_bytes()
    }
}

impl CacheInvalidator for QueryCache {
    fn invalidate_table(&self, table_name: &str) -> usize {
        QueryCache::invalidate_table(self, table_name)
    }

    fn invalidate_all(&self) -> usize {
        self.clear()
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.config.enabled)
            .field("max_entries", &self.config.max_entries)
            .field("max_memory_bytes", &self.config.max_memory_bytes)
            .field("current_entries", &self.len())
            .field("memory_used", &self.memory_used())
            .field("durable_tier", &self.store.has_durable_tier())
            .field("in_flight", &self.gate.in_flight())
            .finish()
    }
}
