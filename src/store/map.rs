//! Map Contract
//!
//! The uniform `put`/`get`/`remove` contract implemented by the transient
//! tier, the persistent tier and the tiered store itself, so that a tiered
//! store is a drop-in replacement for either tier.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::entry::{Entry, StorageId};
use crate::error::{Error, Result};

/// Map contract shared by every store tier
pub trait StoreMap: Send + Sync {
    /// Insert an entry: 1 if stored, 0 if the unique id was already present
    fn put(&self, entry: &Entry) -> Result<u32>;

    /// Look up an entry by unique id
    fn get(&self, unique_id: i64) -> Option<Entry>;

    /// All entries ordered by unique id
    fn get_all(&self) -> Vec<Entry>;

    /// True if the unique id is stored
    fn contains(&self, unique_id: i64) -> bool {
        self.get(unique_id).is_some()
    }

    /// Remove an entry: 1 if it was stored, else 0
    fn remove(&self, entry: &Entry) -> u32;

    /// Remove every non-durable entry, returning how many were dropped
    fn remove_transient(&self) -> Result<u32>;

    fn num_entries(&self) -> u64;
    fn num_bytes(&self) -> u64;
    fn num_durable_entries(&self) -> u64;
    fn num_durable_bytes(&self) -> u64;
    fn max_entries(&self) -> u64;
    fn max_bytes(&self) -> u64;

    /// Remove everything, returning the number of entries dropped
    fn clear(&self) -> u64;

    /// Stop accepting entries
    fn shutdown(&self, force: bool);

    /// Drop all content and backing resources
    fn destroy(&self) -> Result<()>;
}

// =============================================================================
// Capacity
// =============================================================================

/// Entry and byte limits of a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub max_entries: u64,
    pub max_bytes: u64,
}

impl Capacity {
    /// Create a capacity
    pub fn new(max_entries: u64, max_bytes: u64) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }

    /// No limits
    pub fn unbounded() -> Self {
        Self::new(u64::MAX, u64::MAX)
    }

    /// True if one more entry of `size` bytes fits on top of the current usage.
    ///
    /// Exact: filling the remaining bytes completely is admitted.
    #[inline]
    pub fn admits(&self, entries: u64, bytes: u64, size: u64) -> bool {
        entries.saturating_add(1) <= self.max_entries
            && bytes.saturating_add(size) <= self.max_bytes
    }

    /// Overflow error describing the rejected usage
    pub fn overflow(&self, storage_id: &StorageId, tier: &'static str, entries: u64, bytes: u64) -> Error {
        Error::ResourceOverflow {
            storage_id: storage_id.to_string(),
            tier,
            entries,
            max_entries: self.max_entries,
            bytes,
            max_bytes: self.max_bytes,
        }
    }
}

// =============================================================================
// Usage Counters
// =============================================================================

/// Point-in-time usage of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierUsage {
    pub entries: u64,
    pub bytes: u64,
    pub durable_entries: u64,
    pub durable_bytes: u64,
}

impl TierUsage {
    /// Sum the usage of a set of entries
    pub fn of<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        entries.into_iter().fold(Self::default(), |mut usage, entry| {
            usage.entries += 1;
            usage.bytes += entry.size_bytes();
            if entry.is_durable() {
                usage.durable_entries += 1;
                usage.durable_bytes += entry.size_bytes();
            }
            usage
        })
    }
}

/// O(1) tier counters, updated on every mutation and readable without locks
#[derive(Debug, Default)]
pub struct TierCounters {
    entries: AtomicU64,
    bytes: AtomicU64,
    durable_entries: AtomicU64,
    durable_bytes: AtomicU64,
}

impl TierCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a stored entry
    pub fn record_added(&self, entry: &Entry) {
        let size = entry.size_bytes();
        self.entries.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        if entry.is_durable() {
            self.durable_entries.fetch_add(1, Ordering::Relaxed);
            self.durable_bytes.fetch_add(size, Ordering::Relaxed);
        }
    }

    /// Account for a removed entry
    pub fn record_removed(&self, entry: &Entry) {
        self.subtract(TierUsage::of([entry]));
    }

    /// Account for a batch of removed entries
    pub fn subtract(&self, usage: TierUsage) {
        self.entries.fetch_sub(usage.entries, Ordering::Relaxed);
        self.bytes.fetch_sub(usage.bytes, Ordering::Relaxed);
        self.durable_entries
            .fetch_sub(usage.durable_entries, Ordering::Relaxed);
        self.durable_bytes
            .fetch_sub(usage.durable_bytes, Ordering::Relaxed);
    }

    /// Replace the counters (tier reload)
    pub fn seed(&self, usage: TierUsage) {
        self.entries.store(usage.entries, Ordering::Relaxed);
        self.bytes.store(usage.bytes, Ordering::Relaxed);
        self.durable_entries
            .store(usage.durable_entries, Ordering::Relaxed);
        self.durable_bytes.store(usage.durable_bytes, Ordering::Relaxed);
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.seed(TierUsage::default());
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn durable_entries(&self) -> u64 {
        self.durable_entries.load(Ordering::Relaxed)
    }

    pub fn durable_bytes(&self) -> u64 {
        self.durable_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of all four counters
    pub fn usage(&self) -> TierUsage {
        TierUsage {
            entries: self.entries(),
            bytes: self.bytes(),
            durable_entries: self.durable_entries(),
            durable_bytes: self.durable_bytes(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
