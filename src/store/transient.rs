//! Transient Tier - RAM-based Cache Portion
//!
//! Bounded in-memory map keyed by unique id. Never evicts on its own: a put
//! that does not fit is rejected and the tiered store decides whether to swap
//! the entry out to the persistent tier.
//!
//! # Design
//!
//! - `BTreeMap` under a `parking_lot::RwLock` so `get_all` comes out ordered
//! - Atomic usage counters, readable without taking the map lock
//! - Soft admission (`admit`) for swap-in promotion against a caller ceiling

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::entry::{Entry, StorageId};
use super::map::{Capacity, StoreMap, TierCounters, TierUsage};
use crate::error::{Error, Result};

const TIER: &str = "transient tier";

/// Transient tier - RAM-based cache portion of a store
pub struct TransientTier {
    storage_id: StorageId,
    entries: RwLock<BTreeMap<i64, Entry>>,
    capacity: RwLock<Capacity>,
    counters: TierCounters,
    hits: AtomicU64,
    misses: AtomicU64,
    shut_down: AtomicBool,
}

impl TransientTier {
    /// Create an empty tier
    pub fn new(storage_id: StorageId, capacity: Capacity) -> Self {
        Self {
            storage_id,
            entries: RwLock::new(BTreeMap::new()),
            capacity: RwLock::new(capacity),
            counters: TierCounters::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Storage id this tier belongs to
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Current limits
    pub fn capacity(&self) -> Capacity {
        *self.capacity.read()
    }

    /// Replace the limits; existing entries are kept even if they no longer fit
    pub fn set_capacity(&self, capacity: Capacity) {
        *self.capacity.write() = capacity;
    }

    /// True if `entry` fits within the tier's own limits
    pub fn has_space_for(&self, entry: &Entry) -> bool {
        self.capacity().admits(
            self.counters.entries(),
            self.counters.bytes(),
            entry.size_bytes(),
        )
    }

    /// Insert a promoted entry if it fits under `ceiling`, ignoring the tier's own limits.
    ///
    /// Returns false (and stores nothing) if the ceiling would be exceeded or the
    /// id is already cached.
    pub fn admit(&self, entry: &Entry, ceiling: Capacity) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&entry.unique_id()) {
            return false;
        }
        if !ceiling.admits(
            self.counters.entries(),
            self.counters.bytes(),
            entry.size_bytes(),
        ) {
            return false;
        }
        entries.insert(entry.unique_id(), entry.clone());
        self.counters.record_added(entry);
        true
    }

    /// Look up an entry without touching the hit counters
    pub fn peek(&self, unique_id: i64) -> Option<Entry> {
        self.entries.read().get(&unique_id).cloned()
    }

    /// Entry with the lowest unique id
    pub fn oldest(&self) -> Option<Entry> {
        self.entries.read().values().next().cloned()
    }

    /// Remove and return every non-durable entry
    pub fn drain_transient(&self) -> Vec<Entry> {
        let mut entries = self.entries.write();
        let ids: Vec<i64> = entries
            .values()
            .filter(|entry| !entry.is_durable())
            .map(Entry::unique_id)
            .collect();

        let drained: Vec<Entry> = ids
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect();
        self.counters.subtract(TierUsage::of(&drained));
        drained
    }

    /// Usage snapshot
    pub fn usage(&self) -> TierUsage {
        self.counters.usage()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// True once `shutdown` was called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl StoreMap for TransientTier {
    fn put(&self, entry: &Entry) -> Result<u32> {
        if self.is_shut_down() {
            return Err(Error::Internal(format!(
                "{} of '{}' is shut down",
                TIER, self.storage_id
            )));
        }

        let mut entries = self.entries.write();
        if entries.contains_key(&entry.unique_id()) {
            debug!(storage = %self.storage_id, entry = entry.unique_id(), "duplicate put ignored");
            return Ok(0);
        }

        let capacity = self.capacity();
        let (count, bytes) = (self.counters.entries(), self.counters.bytes());
        if !capacity.admits(count, bytes, entry.size_bytes()) {
            return Err(capacity.overflow(&self.storage_id, TIER, count, bytes));
        }

        entries.insert(entry.unique_id(), entry.clone());
        self.counters.record_added(entry);
        Ok(1)
    }

    fn get(&self, unique_id: i64) -> Option<Entry> {
        let entry = self.entries.read().get(&unique_id).cloned();
        match entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    fn get_all(&self) -> Vec<Entry> {
        self.entries.read().values().cloned().collect()
    }

    fn contains(&self, unique_id: i64) -> bool {
        self.entries.read().contains_key(&unique_id)
    }

    fn remove(&self, entry: &Entry) -> u32 {
        match self.entries.write().remove(&entry.unique_id()) {
            Some(removed) => {
                self.counters.record_removed(&removed);
                1
            }
            None => 0,
        }
    }

    fn remove_transient(&self) -> Result<u32> {
        Ok(self.drain_transient().len() as u32)
    }

    fn num_entries(&self) -> u64 {
        self.counters.entries()
    }

    fn num_bytes(&self) -> u64 {
        self.counters.bytes()
    }

    fn num_durable_entries(&self) -> u64 {
        self.counters.durable_entries()
    }

    fn num_durable_bytes(&self) -> u64 {
        self.counters.durable_bytes()
    }

    fn max_entries(&self) -> u64 {
        self.capacity().max_entries
    }

    fn max_bytes(&self) -> u64 {
        self.capacity().max_bytes
    }

    fn clear(&self) -> u64 {
        let mut entries = self.entries.write();
        let cleared = entries.len() as u64;
        entries.clear();
        self.counters.reset();
        cleared
    }

    fn shutdown(&self, force: bool) {
        self.shut_down.store(true, Ordering::Release);
        let remaining = self
            .counters
            .entries()
            .saturating_sub(self.counters.durable_entries());
        if remaining > 0 && !force {
            warn!(
                storage = %self.storage_id,
                remaining,
                "shutting down transient tier with non-durable entries"
            );
        } else {
            info!(storage = %self.storage_id, "transient tier shut down");
        }
    }

    fn destroy(&self) -> Result<()> {
        self.clear();
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
