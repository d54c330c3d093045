//! Storage tier capability

use crate::error::CacheResult;
use crate::key::CacheKey;
use crate::materializer::MaterializedRows;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Where a sealed payload lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    Memory,
    Durable,
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Memory => f.write_str("memory"),
            TierKind::Durable => f.write_str("durable"),
        }
    }
}

/// Identifies one fill's payload for a key.
///
/// A refresh writes its rows under a new generation, so the old and the new
/// payload can coexist until the swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub key: CacheKey,
    pub generation: u64,
}

impl SlotKey {
    pub fn new(key: CacheKey, generation: u64) -> Self {
        Self { key, generation }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.key, self.generation)
    }
}

/// A payload pushed out of a tier to make room for another
#[derive(Debug)]
pub struct Displaced {
    pub slot: SlotKey,
    pub from: TierKind,
    /// Rows of the victim, when the tier still holds them in memory
    pub rows: Option<MaterializedRows>,
    pub expires_at: Option<Instant>,
}

/// A bounded place to keep sealed payloads
pub trait StorageTier: Send + Sync {
    fn kind(&self) -> TierKind;

    /// Store `rows` under `slot`, returning whatever had to be displaced
    fn put(
        &self,
        slot: &SlotKey,
        rows: &MaterializedRows,
        expires_at: Option<Instant>,
    ) -> CacheResult<Vec<Displaced>>;

    fn get(&self, slot: &SlotKey) -> CacheResult<Option<MaterializedRows>>;

    /// Remove a payload; returns whether it was present
    fn evict(&self, slot: &SlotKey) -> CacheResult<bool>;

    /// Bytes charged against the tier budget for `slot`
    fn size_of(&self, slot: &SlotKey) -> Option<usize>;

    fn used_bytes(&self) -> usize;

    /// Largest number of bytes the tier will hold
    fn budget_bytes(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
