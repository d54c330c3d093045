//! Bounded in-memory tier

use super::tier::{Displaced, SlotKey, StorageTier, TierKind};
use crate::error::{CacheError, CacheResult};
use crate::materializer::MaterializedRows;
use lru::LruCache;
use parking_lot::Mutex;
use std::time::Instant;

struct MemorySlot {
    rows: MaterializedRows,
    expires_at: Option<Instant>,
    last_access: Instant,
}

struct MemoryState {
    slots: LruCache<SlotKey, MemorySlot, ahash::RandomState>,
    used_bytes: usize,
}

/// LRU tier bounded by a byte budget and an entry count
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    max_entries: usize,
    max_bytes: usize,
}

impl MemoryTier {
    /// Create a new memory tier
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                slots: LruCache::unbounded_with_hasher(ahash::RandomState::new()),
                used_bytes: 0,
            }),
            max_entries: max_entries.max(1),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Least recently used slot; among slots last touched at the same instant,
    /// the one expiring soonest
    fn victim(slots: &LruCache<SlotKey, MemorySlot, ahash::RandomState>) -> Option<SlotKey> {
        let mut candidates = slots.iter().rev();
        let (first_key, first) = candidates.next()?;
        let oldest = first.last_access;

        let mut victim = (first_key, first.expires_at);
        for (key, slot) in candidates.take_while(|(_, slot)| slot.last_access == oldest) {
            let sooner = match (slot.expires_at, victim.1) {
                (Some(candidate), Some(current)) => candidate < current,
                (Some(_), None) => true,
                _ => false,
            };
            if sooner {
                victim = (key, slot.expires_at);
            }
        }
        Some(victim.0.clone())
    }
}

impl StorageTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    fn put(
        &self,
        slot: &SlotKey,
        rows: &MaterializedRows,
        expires_at: Option<Instant>,
    ) -> CacheResult<Vec<Displaced>> {
        let size = rows.size_bytes();
        if size > self.max_bytes {
            return Err(CacheError::CapacityExceeded {
                required: size,
                budget: self.max_bytes,
            });
        }

        let mut state = self.state.lock();
        if let Some(previous) = state.slots.pop(slot) {
            state.used_bytes = state.used_bytes.saturating_sub(previous.rows.size_bytes());
        }

        let mut displaced = Vec::new();
        while !state.slots.is_empty()
            && (state.used_bytes + size > self.max_bytes || state.slots.len() >= self.max_entries)
        {
            let Some(victim) = Self::victim(&state.slots) else {
                break;
            };
            if let Some(evicted) = state.slots.pop(&victim) {
                state.used_bytes = state.used_bytes.saturating_sub(evicted.rows.size_bytes());
                displaced.push(Displaced {
                    slot: victim,
                    from: TierKind::Memory,
                    rows: Some(evicted.rows),
                    expires_at: evicted.expires_at,
                });
            }
        }

        state.used_bytes += size;
        state.slots.put(
            slot.clone(),
            MemorySlot {
                rows: rows.clone(),
                expires_at,
                last_access: Instant::now(),
            },
        );

        Ok(displaced)
    }

    fn get(&self, slot: &SlotKey) -> CacheResult<Option<MaterializedRows>> {
        let mut state = self.state.lock();
        Ok(state.slots.get_mut(slot).map(|entry| {
            entry.last_access = Instant::now();
            entry.rows.clone()
        }))
    }

    fn evict(&self, slot: &SlotKey) -> CacheResult<bool> {
        let mut state = self.state.lock();
        match state.slots.pop(slot) {
            Some(evicted) => {
                state.used_bytes = state.used_bytes.saturating_sub(evicted.rows.size_bytes());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn size_of(&self, slot: &SlotKey) -> Option<usize> {
        self.state
            .lock()
            .slots
            .peek(slot)
            .map(|entry| entry.rows.size_bytes())
    }

    fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    fn budget_bytes(&self) -> usize {
        self.max_bytes
    }

    fn len(&self) -> usize {
        self.state.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Scope;
    use crate::key::{CacheKey, KeyDeriver};
    use crate::materializer::tests::create_test_batch;
    use query_core::{Command, ExecutionContext, VdbId};
    use std::time::Duration;

    fn slot(sql: &str) -> SlotKey {
        let ctx = ExecutionContext::new(VdbId::new("vdb", "1"));
        let key: CacheKey = KeyDeriver::derive(&Command::query(sql), Scope::Vdb, &ctx).unwrap();
        SlotKey::new(key, 1)
    }

    fn rows(values: Vec<i64>) -> MaterializedRows {
        MaterializedRows::new(vec![create_test_batch(values)])
    }

    #[test]
    fn test_put_and_get() {
        let tier = MemoryTier::new(10, 1024 * 1024);
        let a = slot("SELECT 1");
        let stored = rows(vec![1, 2, 3]);

        assert!(tier.put(&a, &stored, None).unwrap().is_empty());
        let fetched = tier.get(&a).unwrap().unwrap();
        assert!(fetched.ptr_eq(&stored));
        assert_eq!(tier.size_of(&a), Some(stored.size_bytes()));
        assert_eq!(tier.used_bytes(), stored.size_bytes());
    }

    #[test]
    fn test_entry_limit_evicts_lru() {
        let tier = MemoryTier::new(2, 1024 * 1024);
        let (a, b, c) = (slot("SELECT 1"), slot("SELECT 2"), slot("SELECT 3"));

        tier.put(&a, &rows(vec![1]), None).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        tier.put(&b, &rows(vec![2]), None).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        // touch a so b becomes the least recently used
        tier.get(&a).unwrap();
        let displaced = tier.put(&c, &rows(vec![3]), None).unwrap();

        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].slot, b);
        assert!(displaced[0].rows.is_some());
        assert!(tier.get(&a).unwrap().is_some());
        assert!(tier.get(&b).unwrap().is_none());
    }

    #[test]
    fn test_byte_budget() {
        let one = rows(vec![1; 1000]);
        let tier = MemoryTier::new(100, one.size_bytes() * 2);

        tier.put(&slot("SELECT 1"), &one, None).unwrap();
        tier.put(&slot("SELECT 2"), &rows(vec![2; 1000]), None).unwrap();
        let displaced = tier.put(&slot("SELECT 3"), &rows(vec![3; 1000]), None).unwrap();

        assert_eq!(displaced.len(), 1);
        assert!(tier.used_bytes() <= tier.max_bytes());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_oversized_rejected() {
        let tier = MemoryTier::new(10, 16);
        let err = tier.put(&slot("SELECT 1"), &rows(vec![1; 1000]), None).unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { budget: 16, .. }));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_replace_same_slot() {
        let tier = MemoryTier::new(1, 1024 * 1024);
        let a = slot("SELECT 1");
        tier.put(&a, &rows(vec![1]), None).unwrap();
        let displaced = tier.put(&a, &rows(vec![1, 2]), None).unwrap();

        assert!(displaced.is_empty());
        assert_eq!(tier.get(&a).unwrap().unwrap().num_rows(), 2);
    }

    #[test]
    fn test_evict() {
        let tier = MemoryTier::new(10, 1024 * 1024);
        let a = slot("SELECT 1");
        tier.put(&a, &rows(vec![1]), None).unwrap();

        assert!(tier.evict(&a).unwrap());
        assert!(!tier.evict(&a).unwrap());
        assert_eq!(tier.used_bytes(), 0);
    }
}
