//! Entry store
//!
//! Entry records live in a sharded concurrent map; their payloads live in a
//! memory tier and, when configured, a durable tier. Each fill writes its
//! payload under its own generation, and the record points at the generation
//! it currently serves.
//!
//! Lock order: a map guard may be held while taking a tier lock, never the
//! reverse. File I/O runs with no map guard held.

mod durable;
mod memory;
mod tier;

pub use durable::DurableTier;
pub use memory::MemoryTier;
pub use tier::{Displaced, SlotKey, StorageTier, TierKind};

use crate::config::CacheConfig;
use crate::directive::{CacheDirective, Invalidation};
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, ScopeNamespace};
use crate::materializer::{MaterializedRows, RowBuffer};
use crate::stats::CacheStats;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Filling,
    Ready,
    Invalid,
}

/// Result of a store lookup
#[derive(Debug)]
pub enum Lookup {
    /// Sealed rows are available
    Hit(MaterializedRows),
    /// A streaming fill is running; readers may attach to its buffer
    Partial(Arc<RowBuffer>),
    /// A fill is running and nothing is servable yet
    Filling,
    Miss,
}

/// Read-only view of one entry
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub state: EntryState,
    pub directive: CacheDirective,
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub expires_at: Option<Instant>,
    /// Stored payload plus whatever a fill in progress has buffered
    pub size_bytes: usize,
    pub tier: Option<TierKind>,
    pub tables: Vec<String>,
    /// Followers blocked on the in-flight fill
    pub waiters: usize,
}

impl EntryInfo {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state == EntryState::Filling && self.tier.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Payload {
    generation: u64,
    tier: TierKind,
}

#[derive(Debug)]
struct ActiveFill {
    generation: u64,
    buffer: Arc<RowBuffer>,
    directive: CacheDirective,
    tables: Vec<String>,
}

#[derive(Debug)]
struct EntryRecord {
    directive: CacheDirective,
    tables: Vec<String>,
    state: EntryState,
    created_at: Instant,
    last_accessed: Instant,
    expires_at: Option<Instant>,
    size_bytes: usize,
    payload: Option<Payload>,
    fill: Option<ActiveFill>,
}

impl EntryRecord {
    fn filling(fill: ActiveFill, now: Instant) -> Self {
        Self {
            directive: fill.directive.clone(),
            tables: fill.tables.clone(),
            state: EntryState::Filling,
            created_at: now,
            last_accessed: now,
            expires_at: None,
            size_bytes: 0,
            payload: None,
            fill: Some(fill),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Reclaimable without waiting for a fill
    fn is_stale(&self, now: Instant) -> bool {
        match self.state {
            EntryState::Invalid => true,
            EntryState::Ready => self.is_expired(now),
            EntryState::Filling => false,
        }
    }

    fn fill_generation(&self) -> Option<u64> {
        self.fill.as_ref().map(|fill| fill.generation)
    }

    fn reads_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }
}

/// Exclusive right to fill one key.
///
/// Dropping the handle without sealing aborts the fill.
#[derive(Debug)]
pub struct FillHandle {
    store: Arc<EntryStore>,
    key: CacheKey,
    generation: u64,
    buffer: Arc<RowBuffer>,
    directive: CacheDirective,
    refresh: bool,
    finished: bool,
}

impl FillHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn buffer(&self) -> &Arc<RowBuffer> {
        &self.buffer
    }

    pub fn directive(&self) -> &CacheDirective {
        &self.directive
    }

    /// Whether older rows stay servable while this fill runs
    pub fn is_refresh(&self) -> bool {
        self.refresh
    }
}

impl Drop for FillHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.buffer.cancel();
            self.store.abort_fill(&self.key, self.generation);
        }
    }
}

/// Owner of all cache entries and their payloads
pub struct EntryStore {
    entries: DashMap<CacheKey, EntryRecord, ahash::RandomState>,
    memory: Box<dyn StorageTier>,
    durable: Option<Box<dyn StorageTier>>,
    next_generation: AtomicU64,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("entries", &self.entries.len())
            .field("memory_bytes", &self.memory.used_bytes())
            .field("durable", &self.durable.is_some())
            .finish()
    }
}

impl EntryStore {
    /// Create a store with the given tiers
    pub fn new(
        memory: Box<dyn StorageTier>,
        durable: Option<Box<dyn StorageTier>>,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            entries: DashMap::with_hasher(ahash::RandomState::new()),
            memory,
            durable,
            next_generation: AtomicU64::new(1),
            stats,
        }
    }

    /// Create a store from configuration, opening the durable tier if one is set
    pub fn from_config(config: &CacheConfig, stats: Arc<CacheStats>) -> CacheResult<Self> {
        let memory = Box::new(MemoryTier::new(config.max_entries, config.max_memory_bytes));
        let durable = match &config.durable_dir {
            Some(dir) => Some(Box::new(DurableTier::open(dir, config.max_durable_bytes)?)
                as Box<dyn StorageTier>),
            None => None,
        };
        Ok(Self::new(memory, durable, stats))
    }

    /// Largest payload any tier could accept
    fn payload_budget(&self) -> usize {
        let durable = self.durable.as_ref().map_or(0, |tier| tier.budget_bytes());
        self.memory.budget_bytes().max(durable)
    }

    fn tier(&self, kind: TierKind) -> Option<&dyn StorageTier> {
        match kind {
            TierKind::Memory => Some(self.memory.as_ref()),
            TierKind::Durable => self.durable.as_deref(),
        }
    }

    /// Look up `key`, reclaiming it first if it has expired or been invalidated
    pub fn lookup(&self, key: &CacheKey) -> Lookup {
        let now = Instant::now();
        if let Some((_, record)) = self.entries.remove_if(key, |_, record| record.is_stale(now)) {
            if record.state == EntryState::Invalid {
                debug!("Reclaimed invalidated entry {}", key);
            } else {
                debug!("Expired entry {}", key);
                self.stats.record_expiration();
            }
            self.discard(key, record);
            self.refresh_gauges();
            return Lookup::Miss;
        }

        // a concurrent seal may retire the payload between reading the record
        // and reading the tier, so look once more before reporting a miss
        for _ in 0..2 {
            let (payload, prefer_memory, expires_at) = {
                let Some(mut record) = self.entries.get_mut(key) else {
                    return Lookup::Miss;
                };
                record.last_accessed = now;

                let servable = record.payload.filter(|_| !record.is_expired(now));
                match (record.state, servable) {
                    (EntryState::Ready, Some(payload)) | (EntryState::Filling, Some(payload)) => {
                        (payload, record.directive.prefer_memory, record.expires_at)
                    }
                    (EntryState::Filling, None) => {
                        return match &record.fill {
                            Some(fill) if !fill.directive.read_all => {
                                Lookup::Partial(Arc::clone(&fill.buffer))
                            }
                            _ => Lookup::Filling,
                        };
                    }
                    _ => return Lookup::Miss,
                }
            };

            let slot = SlotKey::new(key.clone(), payload.generation);
            let Some(tier) = self.tier(payload.tier) else {
                return Lookup::Miss;
            };
            match tier.get(&slot) {
                Ok(Some(rows)) => {
                    if payload.tier == TierKind::Durable && prefer_memory {
                        self.promote(&slot, &rows, expires_at);
                    }
                    return Lookup::Hit(rows);
                }
                Ok(None) => {
                    let moved = self
                        .entries
                        .get(key)
                        .is_some_and(|record| record.payload != Some(payload));
                    if !moved {
                        return Lookup::Miss;
                    }
                }
                Err(err) => {
                    warn!("Failed to read {} from the {} tier: {}", key, payload.tier, err);
                    self.drop_payload(&slot, payload.tier);
                    return Lookup::Miss;
                }
            }
        }
        Lookup::Miss
    }

    /// Claim the right to fill `key`.
    ///
    /// A live updatable entry keeps serving its rows until the new fill seals.
    /// Anything else already stored under the key is replaced.
    pub fn begin_fill(
        self: &Arc<Self>,
        key: &CacheKey,
        directive: CacheDirective,
        tables: &[String],
    ) -> CacheResult<FillHandle> {
        let now = Instant::now();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let buffer = Arc::new(RowBuffer::with_limit(self.payload_budget()));
        let tables: Vec<String> = tables.iter().map(|table| table.to_lowercase()).collect();
        let fill = ActiveFill {
            generation,
            buffer: Arc::clone(&buffer),
            directive: directive.clone(),
            tables,
        };

        let mut refresh = false;
        let mut replaced = None;
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.state == EntryState::Filling {
                    return Err(CacheError::AlreadyFilling);
                }
                let live = record.state == EntryState::Ready
                    && !record.is_expired(now)
                    && record.payload.is_some();
                if live && record.directive.updatable && directive.updatable {
                    record.state = EntryState::Filling;
                    record.fill = Some(fill);
                    refresh = true;
                } else {
                    let previous = occupied.insert(EntryRecord::filling(fill, now));
                    replaced = Some(previous);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(EntryRecord::filling(fill, now));
            }
        }

        if let Some(previous) = replaced {
            self.discard(key, previous);
        }
        debug!(
            "Began {} of {} (generation {})",
            if refresh { "refresh" } else { "fill" },
            key,
            generation
        );
        self.refresh_gauges();

        Ok(FillHandle {
            store: Arc::clone(self),
            key: key.clone(),
            generation,
            buffer,
            directive,
            refresh,
            finished: false,
        })
    }

    /// Store the fill's rows and make them servable.
    ///
    /// Fails with [`CacheError::Invalidated`] when the entry was invalidated
    /// or replaced while filling; the rows are then discarded.
    pub fn seal(&self, mut handle: FillHandle, rows: MaterializedRows) -> CacheResult<()> {
        handle.finished = true;
        let key = handle.key.clone();
        let generation = handle.generation;

        let current = self.entries.get(&key).is_some_and(|record| {
            record.state == EntryState::Filling && record.fill_generation() == Some(generation)
        });
        if !current {
            self.abort_fill(&key, generation);
            return Err(CacheError::Invalidated);
        }

        if handle.buffer.exceeds_limit() || rows.size_bytes() > handle.buffer.limit() {
            let required = rows.size_bytes().max(handle.buffer.size_bytes());
            self.abort_fill(&key, generation);
            return Err(CacheError::CapacityExceeded {
                required,
                budget: handle.buffer.limit(),
            });
        }

        let now = Instant::now();
        let expires_at = handle.directive.expires_at(now);
        let slot = SlotKey::new(key.clone(), generation);
        let (tier, displaced) =
            match self.place(&slot, &rows, expires_at, handle.directive.prefer_memory) {
                Ok(placed) => placed,
                Err(err) => {
                    self.abort_fill(&key, generation);
                    return Err(err);
                }
            };

        let mut committed = false;
        let mut previous = None;
        if let Some(mut record) = self.entries.get_mut(&key) {
            if record.state == EntryState::Filling && record.fill_generation() == Some(generation) {
                if let Some(fill) = record.fill.take() {
                    record.directive = fill.directive;
                    record.tables = fill.tables;
                }
                previous = record.payload.replace(Payload { generation, tier });
                record.state = EntryState::Ready;
                record.created_at = now;
                record.last_accessed = now;
                record.expires_at = expires_at;
                record.size_bytes = rows.size_bytes();
                committed = true;
            }
        }

        if !committed {
            self.evict_slot(&slot, tier);
            self.handle_displaced(displaced);
            self.abort_fill(&key, generation);
            return Err(CacheError::Invalidated);
        }

        if let Some(previous) = previous {
            self.evict_slot(&SlotKey::new(key.clone(), previous.generation), previous.tier);
        }
        debug!(
            "Sealed {} in the {} tier ({} rows, {} bytes)",
            key,
            tier,
            rows.num_rows(),
            rows.size_bytes()
        );
        self.handle_displaced(displaced);
        self.refresh_gauges();
        Ok(())
    }

    /// Abandon a fill; a refresh falls back to the rows it was replacing
    pub fn abort(&self, mut handle: FillHandle) {
        handle.finished = true;
        handle.buffer.cancel();
        self.abort_fill(&handle.key, handle.generation);
    }

    fn abort_fill(&self, key: &CacheKey, generation: u64) {
        let removed = self.entries.remove_if(key, |_, record| {
            record.fill_generation() == Some(generation)
                && (record.payload.is_none() || record.state == EntryState::Invalid)
        });

        match removed {
            Some((_, record)) => self.discard(key, record),
            None => {
                if let Some(mut record) = self.entries.get_mut(key) {
                    if record.fill_generation() == Some(generation) {
                        record.fill = None;
                        if record.state == EntryState::Filling {
                            record.state = EntryState::Ready;
                        }
                    }
                }
            }
        }
        debug!("Aborted fill of {} (generation {})", key, generation);
        self.refresh_gauges();
    }

    fn place(
        &self,
        slot: &SlotKey,
        rows: &MaterializedRows,
        expires_at: Option<Instant>,
        prefer_memory: bool,
    ) -> CacheResult<(TierKind, Vec<Displaced>)> {
        let order = if prefer_memory {
            [TierKind::Memory, TierKind::Durable]
        } else {
            [TierKind::Durable, TierKind::Memory]
        };

        let mut last_error = None;
        for kind in order {
            let Some(tier) = self.tier(kind) else {
                continue;
            };
            match tier.put(slot, rows, expires_at) {
                Ok(displaced) => return Ok((kind, displaced)),
                Err(err) => {
                    debug!("The {} tier rejected {}: {}", kind, slot, err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(CacheError::CapacityExceeded {
            required: rows.size_bytes(),
            budget: 0,
        }))
    }

    /// Move a durable payload back into memory
    fn promote(&self, slot: &SlotKey, rows: &MaterializedRows, expires_at: Option<Instant>) {
        let displaced = {
            let Some(mut record) = self.entries.get_mut(&slot.key) else {
                return;
            };
            let durable = Payload {
                generation: slot.generation,
                tier: TierKind::Durable,
            };
            if record.payload != Some(durable) {
                return;
            }
            match self.memory.put(slot, rows, expires_at) {
                Ok(displaced) => {
                    record.payload = Some(Payload {
                        generation: slot.generation,
                        tier: TierKind::Memory,
                    });
                    displaced
                }
                Err(err) => {
                    debug!("Could not promote {}: {}", slot, err);
                    return;
                }
            }
        };

        self.evict_slot(slot, TierKind::Durable);
        self.stats.record_promotion();
        debug!("Promoted {} to memory", slot);
        self.handle_displaced(displaced);
        self.refresh_gauges();
    }

    /// Demote or drop payloads pushed out of a tier
    fn handle_displaced(&self, displaced: Vec<Displaced>) {
        let mut pending = displaced;
        let now = Instant::now();

        while let Some(victim) = pending.pop() {
            let live = victim.expires_at.map_or(true, |expires_at| now <= expires_at);
            if let (TierKind::Memory, Some(rows), Some(durable), true) =
                (victim.from, &victim.rows, &self.durable, live)
            {
                match durable.put(&victim.slot, rows, victim.expires_at) {
                    Ok(more) => {
                        if self.retarget(&victim.slot, TierKind::Memory, TierKind::Durable) {
                            self.stats.record_demotion();
                            debug!("Demoted {} to the durable tier", victim.slot);
                        } else {
                            self.evict_slot(&victim.slot, TierKind::Durable);
                        }
                        pending.extend(more);
                        continue;
                    }
                    Err(err) => debug!("Could not demote {}: {}", victim.slot, err),
                }
            }

            if self.drop_record_payload(&victim.slot, victim.from) {
                self.stats.record_eviction();
                debug!("Evicted {} from the {} tier", victim.slot, victim.from);
            }
        }
    }

    /// Point a record at `to` if it still serves `slot` from `from`
    fn retarget(&self, slot: &SlotKey, from: TierKind, to: TierKind) -> bool {
        match self.entries.get_mut(&slot.key) {
            Some(mut record)
                if record.payload
                    == Some(Payload {
                        generation: slot.generation,
                        tier: from,
                    }) =>
            {
                record.payload = Some(Payload {
                    generation: slot.generation,
                    tier: to,
                });
                true
            }
            _ => false,
        }
    }

    /// Forget a payload that is no longer stored; returns whether a record used it
    fn drop_record_payload(&self, slot: &SlotKey, tier: TierKind) -> bool {
        let payload = Some(Payload {
            generation: slot.generation,
            tier,
        });
        if self
            .entries
            .remove_if(&slot.key, |_, record| {
                record.payload == payload && record.state != EntryState::Filling
            })
            .is_some()
        {
            return true;
        }
        match self.entries.get_mut(&slot.key) {
            Some(mut record) if record.payload == payload => {
                record.payload = None;
                true
            }
            _ => false,
        }
    }

    /// Drop a payload whose tier failed, along with whatever record serves it
    fn drop_payload(&self, slot: &SlotKey, tier: TierKind) {
        self.evict_slot(slot, tier);
        self.drop_record_payload(slot, tier);
        self.refresh_gauges();
    }

    fn evict_slot(&self, slot: &SlotKey, kind: TierKind) {
        if let Some(tier) = self.tier(kind) {
            if let Err(err) = tier.evict(slot) {
                warn!("Failed to evict {} from the {} tier: {}", slot, kind, err);
            }
        }
    }

    /// Release the payload of a record that has left the map
    fn discard(&self, key: &CacheKey, record: EntryRecord) {
        if let Some(payload) = record.payload {
            self.evict_slot(&SlotKey::new(key.clone(), payload.generation), payload.tier);
        }
    }

    /// Remove every expired or invalidated entry; returns how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_stale(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in stale {
            if let Some((_, record)) = self.entries.remove_if(&key, |_, record| record.is_stale(now)) {
                if record.state != EntryState::Invalid {
                    self.stats.record_expiration();
                }
                self.discard(&key, record);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Swept {} stale cache entries", removed);
            self.refresh_gauges();
        }
        removed
    }

    /// Invalidate one key. A fill in progress keeps running but its rows are
    /// discarded at seal time.
    pub fn invalidate_key(&self, key: &CacheKey) -> bool {
        let invalidated = self.invalidate_record(key);
        if invalidated {
            self.refresh_gauges();
        }
        invalidated
    }

    fn invalidate_record(&self, key: &CacheKey) -> bool {
        if let Some((_, record)) = self
            .entries
            .remove_if(key, |_, record| record.state != EntryState::Filling)
        {
            self.discard(key, record);
            self.stats.record_invalidation();
            return true;
        }
        match self.entries.get_mut(key) {
            Some(mut record) => {
                record.state = EntryState::Invalid;
                self.stats.record_invalidation();
                true
            }
            None => false,
        }
    }

    /// Invalidate every entry whose namespace is covered by `namespace`
    pub fn invalidate_scope(&self, namespace: &ScopeNamespace) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|entry| namespace.covers(entry.key().namespace()))
            .map(|entry| entry.key().clone())
            .collect();

        let count = keys.iter().filter(|key| self.invalidate_record(key)).count();
        if count > 0 {
            debug!("Invalidated {} entries in {}", count, namespace);
            self.refresh_gauges();
        }
        count
    }

    /// React to a modification of `table` according to each entry's directive
    pub fn invalidate_table(&self, table: &str) -> usize {
        let table = table.to_lowercase();
        let affected: Vec<(CacheKey, Invalidation)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().reads_table(&table))
            .map(|entry| (entry.key().clone(), entry.value().directive.invalidation))
            .collect();

        let mut count = 0;
        for (key, invalidation) in affected {
            let invalidated = match invalidation {
                Invalidation::None => false,
                Invalidation::Lazy => match self.entries.get_mut(&key) {
                    Some(mut record) if record.state != EntryState::Invalid => {
                        record.state = EntryState::Invalid;
                        self.stats.record_invalidation();
                        true
                    }
                    _ => false,
                },
                Invalidation::Immediate => self.invalidate_record(&key),
            };
            if invalidated {
                count += 1;
            }
        }

        if count > 0 {
            debug!("Invalidated {} entries reading {}", count, table);
            self.refresh_gauges();
        }
        count
    }

    /// Invalidate everything
    pub fn clear(&self) -> usize {
        let keys: Vec<CacheKey> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        let count = keys.iter().filter(|key| self.invalidate_record(key)).count();
        self.refresh_gauges();
        count
    }

    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        self.entries.get(key).map(|record| EntryInfo {
            key: key.clone(),
            state: record.state,
            directive: record.directive.clone(),
            created_at: record.created_at,
            last_accessed: record.last_accessed,
            expires_at: record.expires_at,
            size_bytes: record.size_bytes
                + record.fill.as_ref().map_or(0, |fill| fill.buffer.size_bytes()),
            tier: record.payload.map(|payload| payload.tier),
            tables: record.tables.clone(),
            waiters: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory.used_bytes()
    }

    pub fn durable_bytes(&self) -> usize {
        self.durable.as_ref().map_or(0, |tier| tier.used_bytes())
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    fn refresh_gauges(&self) {
        self.stats.set_entry_count(self.entries.len() as u64);
        self.stats.set_memory_bytes(self.memory_bytes() as u64);
        self.stats.set_durable_bytes(self.durable_bytes() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Scope;
    use crate::key::KeyDeriver;
    use crate::materializer::tests::create_test_batch;
    use query_core::{Command, ExecutionContext, VdbId};
    use std::thread;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(VdbId::new("vdb", "1"))
            .with_session("s-1")
            .with_request("r-1")
    }

    fn key(sql: &str) -> CacheKey {
        key_in(sql, Scope::Vdb)
    }

    fn key_in(sql: &str, scope: Scope) -> CacheKey {
        KeyDeriver::derive(&Command::query(sql), scope, &ctx()).unwrap()
    }

    fn rows(values: Vec<i64>) -> MaterializedRows {
        MaterializedRows::new(vec![create_test_batch(values)])
    }

    fn memory_store(max_entries: usize, max_bytes: usize) -> Arc<EntryStore> {
        Arc::new(EntryStore::new(
            Box::new(MemoryTier::new(max_entries, max_bytes)),
            None,
            Arc::new(CacheStats::new()),
        ))
    }

    fn fill(store: &Arc<EntryStore>, key: &CacheKey, directive: CacheDirective, values: Vec<i64>) {
        let handle = store.begin_fill(key, directive, &[]).unwrap();
        store.seal(handle, rows(values)).unwrap();
    }

    fn hit_rows(lookup: Lookup) -> MaterializedRows {
        match lookup {
            Lookup::Hit(rows) => rows,
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn test_fill_then_hit() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT * FROM accounts");

        assert!(matches!(store.lookup(&k), Lookup::Miss));
        fill(&store, &k, CacheDirective::default(), vec![1, 2, 3]);

        let hit = hit_rows(store.lookup(&k));
        assert_eq!(hit.num_rows(), 3);

        let info = store.entry_info(&k).unwrap();
        assert_eq!(info.state, EntryState::Ready);
        assert_eq!(info.tier, Some(TierKind::Memory));
        assert_eq!(info.size_bytes, hit.size_bytes());
        assert!(info.age() < Duration::from_secs(5));
        assert!(!info.is_refreshing());
        assert_eq!(store.memory_bytes(), hit.size_bytes());
    }

    #[test]
    fn test_filling_visible_and_exclusive() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT 1");

        let handle = store.begin_fill(&k, CacheDirective::default(), &[]).unwrap();
        assert!(matches!(store.lookup(&k), Lookup::Filling));
        assert!(matches!(
            store.begin_fill(&k, CacheDirective::default(), &[]),
            Err(CacheError::AlreadyFilling)
        ));

        store.abort(handle);
        assert!(matches!(store.lookup(&k), Lookup::Miss));
        assert!(store.is_empty());
    }

    #[test]
    fn test_streaming_fill_is_partial() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT 1");
        let directive = CacheDirective::default().with_read_all(false);

        let handle = store.begin_fill(&k, directive, &[]).unwrap();
        handle.buffer().push(create_test_batch(vec![1]));

        match store.lookup(&k) {
            Lookup::Partial(buffer) => assert_eq!(buffer.len(), 1),
            other => panic!("expected partial, got {:?}", other),
        }
        drop(handle);
        assert!(store.is_empty());
    }

    #[test]
    fn test_filling_entry_reports_buffered_bytes() {
        let store = memory_store(10, 1024);
        let k = key("SELECT * FROM events");
        let directive = CacheDirective::default().with_read_all(false);

        let handle = store.begin_fill(&k, directive, &[]).unwrap();
        let reader = handle.buffer().reader();
        for i in 0..50 {
            assert!(handle.buffer().push(create_test_batch(vec![i; 8])));
        }

        let buffered = handle.buffer().size_bytes();
        assert!(buffered > 1024);
        assert_eq!(store.entry_info(&k).unwrap().size_bytes, buffered);
        assert!(handle.buffer().exceeds_limit());

        // readers still get every batch, but nothing is stored
        let rows = handle.buffer().complete();
        assert!(matches!(
            store.seal(handle, rows),
            Err(CacheError::CapacityExceeded { budget: 1024, .. })
        ));
        assert_eq!(reader.count(), 50);
        assert!(store.is_empty());
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn test_dropped_handle_aborts() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT 1");
        {
            let _handle = store.begin_fill(&k, CacheDirective::default(), &[]).unwrap();
        }
        assert!(store.entry_info(&k).is_none());
        assert!(store.begin_fill(&k, CacheDirective::default(), &[]).is_ok());
    }

    #[test]
    fn test_ttl_expiration() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT 1");
        fill(&store, &k, CacheDirective::default().with_ttl_millis(20), vec![1]);

        assert!(matches!(store.lookup(&k), Lookup::Hit(_)));
        thread::sleep(Duration::from_millis(21));
        assert!(matches!(store.lookup(&k), Lookup::Miss));
        assert!(store.is_empty());
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn test_evict_expired() {
        let stats = Arc::new(CacheStats::new());
        let store = Arc::new(EntryStore::new(
            Box::new(MemoryTier::new(10, 1024 * 1024)),
            None,
            Arc::clone(&stats),
        ));
        fill(&store, &key("SELECT 1"), CacheDirective::default().with_ttl_millis(10), vec![1]);
        fill(&store, &key("SELECT 2"), CacheDirective::default(), vec![2]);

        thread::sleep(Duration::from_millis(15));
        assert_eq!(store.evict_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(stats.expirations(), 1);
    }

    #[test]
    fn test_lru_eviction_spares_recent() {
        let store = memory_store(2, 1024 * 1024);
        let (a, b, c) = (key("SELECT 1"), key("SELECT 2"), key("SELECT 3"));

        fill(&store, &a, CacheDirective::default(), vec![1]);
        thread::sleep(Duration::from_millis(2));
        fill(&store, &b, CacheDirective::default(), vec![2]);
        thread::sleep(Duration::from_millis(2));
        assert!(matches!(store.lookup(&a), Lookup::Hit(_)));

        fill(&store, &c, CacheDirective::default(), vec![3]);

        assert!(matches!(store.lookup(&a), Lookup::Hit(_)));
        assert!(matches!(store.lookup(&b), Lookup::Miss));
        assert!(matches!(store.lookup(&c), Lookup::Hit(_)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_updatable_refresh_serves_old_rows() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT * FROM accounts");
        let directive = CacheDirective::default().with_updatable(true);
        fill(&store, &k, directive.clone(), vec![1, 2]);

        let handle = store.begin_fill(&k, directive, &[]).unwrap();
        assert!(handle.is_refresh());
        assert!(store.entry_info(&k).unwrap().is_refreshing());
        assert_eq!(hit_rows(store.lookup(&k)).num_rows(), 2);

        store.seal(handle, rows(vec![1, 2, 3])).unwrap();
        assert_eq!(hit_rows(store.lookup(&k)).num_rows(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_refresh_keeps_old_rows() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT * FROM accounts");
        let directive = CacheDirective::default().with_updatable(true);
        fill(&store, &k, directive.clone(), vec![1, 2]);

        let handle = store.begin_fill(&k, directive, &[]).unwrap();
        store.abort(handle);

        assert_eq!(hit_rows(store.lookup(&k)).num_rows(), 2);
        assert_eq!(store.entry_info(&k).unwrap().state, EntryState::Ready);
    }

    #[test]
    fn test_refresh_snapshots_are_atomic() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT * FROM accounts");
        let directive = CacheDirective::default().with_updatable(true);
        fill(&store, &k, directive.clone(), vec![0; 4]);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let k = k.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Lookup::Hit(rows) = store.lookup(&k) {
                            let n = rows.num_rows();
                            assert!(n == 4 || n == 8, "saw a mixed row set of {}", n);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            let handle = store.begin_fill(&k, directive.clone(), &[]).unwrap();
            store.seal(handle, rows(vec![1; 8])).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_invalidate_during_fill_discards_seal() {
        let store = memory_store(10, 1024 * 1024);
        let k = key("SELECT 1");

        let handle = store.begin_fill(&k, CacheDirective::default(), &[]).unwrap();
        assert!(store.invalidate_key(&k));
        assert_eq!(store.entry_info(&k).unwrap().state, EntryState::Invalid);

        let err = store.seal(handle, rows(vec![1])).unwrap_err();
        assert!(matches!(err, CacheError::Invalidated));
        assert!(matches!(store.lookup(&k), Lookup::Miss));
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn test_invalidate_scope() {
        let store = memory_store(10, 1024 * 1024);
        let vdb_key = key_in("SELECT 1", Scope::Vdb);
        let session_key = key_in("SELECT 1", Scope::Session);
        let request_key = key_in("SELECT 1", Scope::Request);
        for k in [&vdb_key, &session_key, &request_key] {
            fill(&store, k, CacheDirective::default(), vec![1]);
        }

        let session = ScopeNamespace::session(VdbId::new("vdb", "1"), "s-1");
        assert_eq!(store.invalidate_scope(&session), 2);
        assert!(matches!(store.lookup(&vdb_key), Lookup::Hit(_)));
        assert!(matches!(store.lookup(&session_key), Lookup::Miss));
        assert!(matches!(store.lookup(&request_key), Lookup::Miss));

        assert_eq!(store.invalidate_scope(&ScopeNamespace::vdb(VdbId::new("vdb", "1"))), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalidate_table_modes() {
        let store = memory_store(10, 1024 * 1024);
        let tables = vec!["Accounts".to_string()];
        let mut keys = Vec::new();
        for (sql, mode) in [
            ("SELECT 1", Invalidation::None),
            ("SELECT 2", Invalidation::Lazy),
            ("SELECT 3", Invalidation::Immediate),
        ] {
            let k = key(sql);
            let handle = store
                .begin_fill(&k, CacheDirective::default().with_invalidation(mode), &tables)
                .unwrap();
            store.seal(handle, rows(vec![1])).unwrap();
            keys.push(k);
        }

        assert_eq!(store.invalidate_table("ACCOUNTS"), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.entry_info(&keys[1]).unwrap().state, EntryState::Invalid);
        assert!(store.entry_info(&keys[2]).is_none());

        assert!(matches!(store.lookup(&keys[0]), Lookup::Hit(_)));
        assert!(matches!(store.lookup(&keys[1]), Lookup::Miss));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear() {
        let store = memory_store(10, 1024 * 1024);
        fill(&store, &key("SELECT 1"), CacheDirective::default(), vec![1]);
        fill(&store, &key("SELECT 2"), CacheDirective::default(), vec![2]);

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert_eq!(store.memory_bytes(), 0);
    }

    #[test]
    fn test_demotion_to_durable() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(CacheStats::new());
        let store = Arc::new(EntryStore::new(
            Box::new(MemoryTier::new(1, 1024 * 1024)),
            Some(Box::new(DurableTier::open(dir.path(), 1024 * 1024).unwrap())),
            Arc::clone(&stats),
        ));
        let memory_first = CacheDirective::default().with_prefer_memory(true);
        let (a, b) = (key("SELECT 1"), key("SELECT 2"));

        assert!(store.has_durable_tier());
        fill(&store, &a, memory_first.clone(), vec![1, 2]);
        fill(&store, &b, memory_first, vec![3]);

        assert_eq!(stats.demotions(), 1);
        assert_eq!(store.entry_info(&a).unwrap().tier, Some(TierKind::Durable));
        assert_eq!(store.entry_info(&b).unwrap().tier, Some(TierKind::Memory));
        assert!(store.durable_bytes() > 0);

        // a prefers memory, so the hit promotes it and demotes b
        assert_eq!(hit_rows(store.lookup(&a)).num_rows(), 2);
        assert_eq!(stats.promotions(), 1);
        assert_eq!(store.entry_info(&a).unwrap().tier, Some(TierKind::Memory));
        assert_eq!(store.entry_info(&b).unwrap().tier, Some(TierKind::Durable));
        assert_eq!(hit_rows(store.lookup(&b)).num_rows(), 1);
    }

    #[test]
    fn test_durable_placement_without_memory_preference() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_durable_dir(dir.path());
        let store = Arc::new(EntryStore::from_config(&config, Arc::new(CacheStats::new())).unwrap());
        let k = key("SELECT * FROM accounts");

        fill(&store, &k, CacheDirective::default(), vec![1, 2, 3]);

        assert_eq!(store.entry_info(&k).unwrap().tier, Some(TierKind::Durable));
        assert_eq!(store.memory_bytes(), 0);
        assert_eq!(hit_rows(store.lookup(&k)).num_rows(), 3);
        assert_eq!(store.entry_info(&k).unwrap().tier, Some(TierKind::Durable));
    }

    #[test]
    fn test_eviction_without_durable_tier() {
        let stats = Arc::new(CacheStats::new());
        let store = Arc::new(EntryStore::new(
            Box::new(MemoryTier::new(1, 1024 * 1024)),
            None,
            Arc::clone(&stats),
        ));

        fill(&store, &key("SELECT 1"), CacheDirective::default(), vec![1]);
        fill(&store, &key("SELECT 2"), CacheDirective::default(), vec![2]);

        assert!(!store.has_durable_tier());
        assert_eq!(stats.evictions(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.entry_info(&key("SELECT 1")).is_none());
    }
}
