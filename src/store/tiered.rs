//! Tiered Cache Store - Transient Cache over a Persistent Tier
//!
//! One generic store used for every broker role. It holds a bounded transient
//! tier in front of an optional persistent tier and decides, per entry, which
//! tier(s) hold it:
//!
//! - durable entries are written through to the persistent tier and also
//!   cached while the transient tier has room
//! - when the transient tier is full its oldest entries (lowest unique id)
//!   are swapped out to the persistent tier to make room
//! - `get` falls back to the persistent tier and promotes what it finds
//!
//! Mutations (`put`, `remove`, the promotion path of `get` and connection
//! transitions) are serialized by one mutation lock per store. Counter reads
//! are lock-free and may be momentarily stale.
//!
//! # Accounting
//!
//! While connected a durable cached entry exists in both tiers, so the
//! combined count is
//!
//! ```text
//! persistent + transient non-durable + durable entries not yet persisted
//! ```
//!
//! Durable entries that only made it into the transient tier (put while
//! disconnected, or the persistent write failed) are tracked as "unbacked".
//! While disconnected the persistent tier is treated as absent and the store
//! reports the transient tier alone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::backend::PersistenceBackend;
use super::body::BodyLookup;
use super::config::StoreConfig;
use super::entry::{Entry, StorageId};
use super::listener::{ConnectionListener, ConnectionState};
use super::map::{Capacity, StoreMap, TierUsage};
use super::metrics::{MetricsSnapshot, StoreMetrics};
use super::persistent::PersistentTier;
use super::transient::TransientTier;
use crate::error::{Error, Result};

/// State guarded by the mutation lock
#[derive(Debug, Default)]
struct MutationState {
    /// Durable entries held only by the transient tier (unique id -> size)
    unbacked: HashMap<i64, u64>,
    /// Persisted entries removed while disconnected, deleted on reconnect
    pending_removals: HashSet<i64>,
}

/// Builder for [`TieredCacheStore`]
pub struct TieredStoreBuilder {
    storage_id: StorageId,
    config: StoreConfig,
    backend: Option<Arc<dyn PersistenceBackend>>,
    lookup: Option<Arc<dyn BodyLookup>>,
}

impl TieredStoreBuilder {
    /// Limits and policies (default: [`StoreConfig::default`])
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Backend of the persistent tier; without one the store is transient-only
    pub fn backend(mut self, backend: Arc<dyn PersistenceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Topic registry used to re-resolve reference entries
    pub fn lookup(mut self, lookup: Arc<dyn BodyLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Build the store and open its persistent tier.
    ///
    /// A persistent tier that cannot be opened is logged and the store runs
    /// transient-only until it is rebuilt.
    pub fn open(self) -> Result<Arc<TieredCacheStore>> {
        self.config.validate()?;
        let config = self.config.normalized(&self.storage_id);

        let transient = TransientTier::new(self.storage_id.clone(), config.cache_capacity());
        let persistent = match self.backend {
            Some(backend) => {
                match PersistentTier::open(self.storage_id.clone(), config.store_capacity(), backend) {
                    Ok(tier) => Some(tier),
                    Err(err) => {
                        error!(
                            storage = %self.storage_id,
                            error = %err,
                            "cannot open persistent tier, running transient-only"
                        );
                        None
                    }
                }
            }
            None => None,
        };
        let connected = persistent
            .as_ref()
            .map(PersistentTier::is_connected)
            .unwrap_or(false);

        let store = Arc::new(TieredCacheStore {
            storage_id: self.storage_id,
            config: RwLock::new(config),
            transient,
            persistent,
            connected: AtomicBool::new(connected),
            state: Mutex::new(MutationState::default()),
            unbacked_entries: AtomicU64::new(0),
            unbacked_bytes: AtomicU64::new(0),
            lookup: self.lookup,
            metrics: StoreMetrics::new(),
            shut_down: AtomicBool::new(false),
        });

        if let Some(persistent) = &store.persistent {
            let listener: Arc<dyn ConnectionListener> = store.clone();
            persistent.add_connection_listener(Arc::downgrade(&listener));
        }

        info!(
            storage = %store.storage_id,
            state = %store.connection_state(),
            persistent = store.persistent.is_some(),
            "store opened"
        );
        Ok(store)
    }
}

/// Two-tier store for one storage id
pub struct TieredCacheStore {
    storage_id: StorageId,
    config: RwLock<StoreConfig>,
    transient: TransientTier,
    persistent: Option<PersistentTier>,
    connected: AtomicBool,
    /// The mutation lock
    state: Mutex<MutationState>,
    unbacked_entries: AtomicU64,
    unbacked_bytes: AtomicU64,
    lookup: Option<Arc<dyn BodyLookup>>,
    metrics: StoreMetrics,
    shut_down: AtomicBool,
}

impl TieredCacheStore {
    /// Start building a store for `storage_id`
    pub fn builder(storage_id: StorageId) -> TieredStoreBuilder {
        TieredStoreBuilder {
            storage_id,
            config: StoreConfig::default(),
            backend: None,
            lookup: None,
        }
    }

    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// Current limits and policies
    pub fn config(&self) -> StoreConfig {
        self.config.read().clone()
    }

    /// Transient tier
    pub fn transient(&self) -> &TransientTier {
        &self.transient
    }

    /// Persistent tier, if one was opened
    pub fn persistent(&self) -> Option<&PersistentTier> {
        self.persistent.as_ref()
    }

    /// True while the persistent tier is present and reachable
    pub fn is_connected(&self) -> bool {
        self.persistent.is_some() && self.connected.load(Ordering::Acquire)
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_connected(self.is_connected())
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn lookup(&self) -> Option<&dyn BodyLookup> {
        self.lookup.as_deref()
    }

    /// Persistent tier, unless absent or disconnected
    fn usable_persistent(&self) -> Option<&PersistentTier> {
        if self.connected.load(Ordering::Acquire) {
            self.persistent.as_ref()
        } else {
            None
        }
    }

    /// Non-durable entries currently sit in the persistent tier
    fn has_swapped(&self, persistent: &PersistentTier) -> bool {
        persistent.num_entries() > persistent.num_durable_entries()
    }

    fn track_unbacked(&self, state: &mut MutationState, entry: &Entry) {
        if state.unbacked.insert(entry.unique_id(), entry.size_bytes()).is_none() {
            self.unbacked_entries.fetch_add(1, Ordering::Relaxed);
            self.unbacked_bytes
                .fetch_add(entry.size_bytes(), Ordering::Relaxed);
        }
    }

    fn untrack_unbacked(&self, state: &mut MutationState, unique_id: i64) {
        if let Some(size) = state.unbacked.remove(&unique_id) {
            self.unbacked_entries.fetch_sub(1, Ordering::Relaxed);
            self.unbacked_bytes.fetch_sub(size, Ordering::Relaxed);
        }
    }

    /// Remember a persisted entry dropped from the cache while disconnected
    fn defer_persistent_removal(&self, state: &mut MutationState, entry: &Entry) {
        let disconnected = self.persistent.is_some() && self.usable_persistent().is_none();
        if disconnected && entry.is_durable() && !state.unbacked.contains_key(&entry.unique_id()) {
            state.pending_removals.insert(entry.unique_id());
        }
    }

    fn clear_unbacked(&self, state: &mut MutationState) {
        state.unbacked.clear();
        self.unbacked_entries.store(0, Ordering::Relaxed);
        self.unbacked_bytes.store(0, Ordering::Relaxed);
    }

    /// Error unless the persistent tier is absent or reachable
    fn require_connected(&self) -> Result<()> {
        if self.persistent.is_some() && !self.connected.load(Ordering::Acquire) {
            return Err(Error::PersistenceUnavailable {
                storage_id: self.storage_id.to_string(),
            });
        }
        Ok(())
    }

    fn overflow(&self, tier: &'static str, capacity: Capacity, entries: u64, bytes: u64) -> Error {
        self.metrics.record_overflow();
        debug!(storage = %self.storage_id, tier, entries, bytes, "put rejected, store is full");
        capacity.overflow(&self.storage_id, tier, entries, bytes)
    }

    // =========================================================================
    // Put
    // =========================================================================

    fn put_locked(&self, state: &mut MutationState, entry: &Entry) -> Result<u32> {
        let id = entry.unique_id();
        if self.transient.contains(id) {
            return Ok(0);
        }

        let persistent = self.usable_persistent();
        if let Some(persistent) = persistent {
            if !entry.is_durable() && self.has_swapped(persistent) {
                if let Ok(Some(_)) = persistent.try_get(id) {
                    return Ok(0);
                }
            }
        }

        // 1. Total space against the effective limits
        let (capacity, tier) = match persistent {
            Some(_) => (self.config.read().store_capacity(), "store"),
            None => (self.transient.capacity(), "transient tier"),
        };
        let (entries, bytes) = (self.num_entries(), self.num_bytes());
        if !capacity.admits(entries, bytes, entry.size_bytes()) {
            return Err(self.overflow(tier, capacity, entries, bytes));
        }

        // 2. Write-through of durable entries
        let mut persisted = false;
        if let (true, Some(persistent)) = (entry.is_durable(), persistent) {
            match persistent.try_put(entry) {
                Ok(0) => return Ok(0),
                Ok(_) => persisted = true,
                Err(err) => {
                    self.metrics.record_persistence_failure();
                    warn!(
                        storage = %self.storage_id,
                        entry = id,
                        error = %err,
                        "durable write failed, keeping entry transient-only"
                    );
                }
            }
        }

        // 3. Cache, swapping the oldest cached entries out to make room
        if let Some(persistent) = persistent {
            self.make_room(state, persistent, entry);
        }
        let mut cached = false;
        if self.transient.has_space_for(entry) {
            match self.transient.put(entry) {
                Ok(stored) => cached = stored > 0,
                Err(err) => {
                    debug!(storage = %self.storage_id, entry = id, error = %err, "transient put refused");
                }
            }
        }

        // 4. Cache still full: swap the entry itself out
        // Without a usable persistent tier step 1 already checked the transient limits
        if !cached && !persisted {
            let Some(persistent) = persistent else {
                let capacity = self.transient.capacity();
                let usage = self.transient.usage();
                return Err(self.overflow("transient tier", capacity, usage.entries, usage.bytes));
            };
            if !persistent.has_space_for(entry) {
                let usage = persistent.usage();
                return Err(self.overflow("persistent tier", persistent.capacity(), usage.entries, usage.bytes));
            }
            if persistent.try_put(entry)? == 0 {
                return Ok(0);
            }
            persisted = true;
            if !entry.is_durable() {
                self.metrics.record_swap_out();
                debug!(storage = %self.storage_id, entry = id, "swapped out to persistent tier");
            }
        }

        if entry.is_durable() && cached && !persisted {
            self.track_unbacked(state, entry);
        }

        entry.added(self.lookup());
        Ok(1)
    }

    /// Swap the oldest cached entries out until `entry` fits the transient tier.
    ///
    /// Durable entries already persisted are simply dropped from the cache.
    /// Stops early if the persistent tier refuses a write.
    fn make_room(&self, state: &mut MutationState, persistent: &PersistentTier, entry: &Entry) {
        let cache = self.transient.capacity();
        if entry.size_bytes() > cache.max_bytes {
            return;
        }

        while !self.transient.has_space_for(entry) {
            let Some(oldest) = self.transient.oldest() else {
                return;
            };
            let backed = oldest.is_durable() && !state.unbacked.contains_key(&oldest.unique_id());
            if !backed {
                if !persistent.has_space_for(&oldest) {
                    return;
                }
                if let Err(err) = persistent.try_put(&oldest) {
                    warn!(
                        storage = %self.storage_id,
                        entry = oldest.unique_id(),
                        error = %err,
                        "cannot swap out cached entry"
                    );
                    return;
                }
                self.untrack_unbacked(state, oldest.unique_id());
                if !oldest.is_durable() {
                    self.metrics.record_swap_out();
                    debug!(storage = %self.storage_id, entry = oldest.unique_id(), "swapped out to persistent tier");
                }
            }
            self.transient.remove(&oldest);
        }
    }

    // =========================================================================
    // Get
    // =========================================================================

    /// Promote an entry found in the persistent tier.
    ///
    /// The transient tier may grow past its own limits up to the store limits;
    /// nothing is evicted to make room. Without room the entry stays
    /// persistent-only.
    fn swap_in(&self, entry: Entry) -> Entry {
        let _state = self.state.lock();
        let id = entry.unique_id();
        if self.transient.contains(id) {
            return entry;
        }
        let Some(persistent) = self.usable_persistent() else {
            return entry;
        };

        let ceiling = self.config.read().store_capacity();
        let usage = self.transient.usage();
        if !ceiling.admits(usage.entries, usage.bytes, entry.size_bytes()) {
            debug!(storage = %self.storage_id, entry = id, "no room to promote, serving from persistent tier");
            return entry;
        }

        if entry.is_durable() {
            // Removed since the unlocked lookup
            if !matches!(persistent.try_get(id), Ok(Some(_))) {
                return entry;
            }
        } else {
            match persistent.try_remove(&entry) {
                Ok(1) => {}
                Ok(_) => return entry,
                Err(err) => {
                    warn!(storage = %self.storage_id, entry = id, error = %err, "cannot release swapped entry");
                    return entry;
                }
            }
        }

        if self.transient.admit(&entry, ceiling) {
            self.metrics.record_swap_in();
            debug!(storage = %self.storage_id, entry = id, "swapped in to transient tier");
        } else if !entry.is_durable() {
            // Put it back where it was
            if let Err(err) = persistent.try_put(&entry) {
                warn!(storage = %self.storage_id, entry = id, error = %err, "swapped entry lost on promotion");
            }
        }
        entry
    }

    // =========================================================================
    // Remove
    // =========================================================================

    fn remove_locked(&self, state: &mut MutationState, entry: &Entry) -> u32 {
        let from_transient = self.transient.remove(entry);
        if from_transient > 0 {
            self.defer_persistent_removal(state, entry);
        }

        let mut from_persistent = 0;
        if let Some(persistent) = self.usable_persistent() {
            if entry.is_durable() || (from_transient == 0 && self.has_swapped(persistent)) {
                from_persistent = persistent.try_remove(entry).unwrap_or_else(|err| {
                    warn!(
                        storage = %self.storage_id,
                        entry = entry.unique_id(),
                        error = %err,
                        "persistent remove failed"
                    );
                    0
                });
            }
        }
        self.untrack_unbacked(state, entry.unique_id());

        let removed = from_transient.max(from_persistent);
        if removed > 0 {
            entry.removed(self.lookup());
        }
        removed
    }

    // =========================================================================
    // Extras
    // =========================================================================

    /// Replace the stored entry of the same unique id with `entry`.
    ///
    /// Returns the previous entry. If the new version is rejected the previous
    /// one is put back and the error returned. Fails with
    /// [`Error::PersistenceUnavailable`] while the persistent tier is
    /// disconnected, as the stored version may not be visible.
    pub fn change(&self, entry: &Entry) -> Result<Option<Entry>> {
        let mut state = self.state.lock();
        let id = entry.unique_id();
        self.require_connected()?;

        let previous = match self.transient.get(id) {
            Some(cached) => Some(cached),
            None => match self.usable_persistent() {
                Some(persistent) => persistent.try_get(id)?,
                None => None,
            },
        };
        if let Some(previous) = &previous {
            self.remove_locked(&mut state, previous);
        }

        match self.put_locked(&mut state, entry) {
            Ok(_) => Ok(previous),
            Err(err) => {
                if let Some(previous) = &previous {
                    if let Err(restore) = self.put_locked(&mut state, previous) {
                        warn!(
                            storage = %self.storage_id,
                            entry = id,
                            error = %restore,
                            "cannot restore entry after failed change"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Apply new limits and policies at runtime.
    ///
    /// Stored entries are kept even if they exceed the new limits.
    pub fn set_properties(&self, config: StoreConfig) -> Result<()> {
        config.validate()?;
        let config = config.normalized(&self.storage_id);

        let _state = self.state.lock();
        self.transient.set_capacity(config.cache_capacity());
        if let Some(persistent) = &self.persistent {
            persistent.set_capacity(config.store_capacity());
        }

        let (entries, bytes) = (self.num_entries(), self.num_bytes());
        if entries > config.max_entries || bytes > config.max_bytes {
            warn!(
                storage = %self.storage_id,
                entries,
                bytes,
                max_entries = config.max_entries,
                max_bytes = config.max_bytes,
                "store holds more than the new limits allow"
            );
        }
        info!(
            storage = %self.storage_id,
            max_entries = config.max_entries,
            max_entries_cache = config.max_entries_cache,
            "store reconfigured"
        );
        *self.config.write() = config;
        Ok(())
    }

    /// Point-in-time usage of both tiers
    pub fn usage(&self) -> StoreUsage {
        let config = self.config.read().clone();
        StoreUsage {
            storage_id: self.storage_id.clone(),
            state: self.connection_state(),
            entries: self.num_entries(),
            bytes: self.num_bytes(),
            durable_entries: self.num_durable_entries(),
            durable_bytes: self.num_durable_bytes(),
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            transient: self.transient.usage(),
            persistent: self.persistent.as_ref().map(PersistentTier::usage),
            unbacked_entries: self.unbacked_entries.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Connection State Machine
// =============================================================================

impl ConnectionListener for TieredCacheStore {
    fn on_disconnected(&self) {
        let _state = self.state.lock();
        if self.connected.swap(false, Ordering::AcqRel) {
            self.metrics.record_disconnect();
            info!(storage = %self.storage_id, "persistent tier disconnected, running transient-only");
        }
    }

    fn on_reconnected(&self) {
        let mut state = self.state.lock();
        let Some(persistent) = &self.persistent else {
            return;
        };
        if self.connected.swap(true, Ordering::AcqRel) {
            return;
        }

        // Removals the persistent tier missed
        let pending: Vec<i64> = state.pending_removals.drain().collect();
        for id in pending {
            if let Err(err) = persistent.try_remove_id(id) {
                warn!(storage = %self.storage_id, entry = id, error = %err, "cannot apply deferred removal");
            }
        }

        // Swapped entries were invisible while disconnected; drop them
        let purged = match persistent.drain_transient() {
            Ok(purged) => purged,
            Err(err) => {
                warn!(storage = %self.storage_id, error = %err, "cannot purge swapped entries");
                Vec::new()
            }
        };
        for entry in &purged {
            entry.removed(self.lookup());
        }
        if !purged.is_empty() {
            warn!(
                storage = %self.storage_id,
                purged = purged.len(),
                "dropped swapped non-durable entries on reconnect"
            );
        }
        // Durable entries re-put while disconnected that were persisted all along
        let unbacked: Vec<i64> = state.unbacked.keys().copied().collect();
        for id in unbacked {
            let Ok(Some(persisted)) = persistent.try_get(id) else {
                continue;
            };
            if let Some(cached) = self.transient.peek(id) {
                if cached != persisted {
                    if let Err(err) = persistent.try_remove_id(id) {
                        warn!(storage = %self.storage_id, entry = id, error = %err, "cannot replace stale persisted entry");
                        continue;
                    }
                    persisted.removed(self.lookup());
                    match persistent.try_put(&cached) {
                        Ok(_) => self.untrack_unbacked(&mut state, id),
                        Err(err) => {
                            warn!(storage = %self.storage_id, entry = id, error = %err, "cannot persist newer entry version");
                        }
                    }
                    continue;
                }
            }
            self.untrack_unbacked(&mut state, id);
            persisted.removed(self.lookup());
        }
        if !state.unbacked.is_empty() {
            warn!(
                storage = %self.storage_id,
                unbacked = state.unbacked.len(),
                "durable entries admitted while disconnected are not persisted"
            );
        }

        self.metrics.record_reconnect(purged.len() as u64);
        info!(storage = %self.storage_id, "persistent tier reconnected");
    }
}

// =============================================================================
// Map Contract
// =============================================================================

impl StoreMap for TieredCacheStore {
    fn put(&self, entry: &Entry) -> Result<u32> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Internal("store is shut down".to_string()));
        }
        let mut state = self.state.lock();
        self.put_locked(&mut state, entry)
    }

    fn get(&self, unique_id: i64) -> Option<Entry> {
        if let Some(entry) = self.transient.get(unique_id) {
            self.metrics.record_transient_hit();
            return Some(entry);
        }

        let found = self.usable_persistent().and_then(|persistent| {
            persistent.try_get(unique_id).unwrap_or_else(|err| {
                warn!(storage = %self.storage_id, entry = unique_id, error = %err, "persistent lookup failed");
                None
            })
        });
        match found {
            Some(entry) => {
                self.metrics.record_persistent_hit();
                Some(self.swap_in(entry))
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    fn get_all(&self) -> Vec<Entry> {
        let mut all: BTreeMap<i64, Entry> = BTreeMap::new();
        if let Some(persistent) = self.usable_persistent() {
            match persistent.try_get_all() {
                Ok(entries) => all.extend(entries.into_iter().map(|e| (e.unique_id(), e))),
                Err(err) => warn!(storage = %self.storage_id, error = %err, "persistent scan failed"),
            }
        }
        all.extend(
            self.transient
                .get_all()
                .into_iter()
                .map(|e| (e.unique_id(), e)),
        );
        all.into_values().collect()
    }

    fn contains(&self, unique_id: i64) -> bool {
        self.transient.contains(unique_id)
            || self
                .usable_persistent()
                .map(|persistent| matches!(persistent.try_get(unique_id), Ok(Some(_))))
                .unwrap_or(false)
    }

    fn remove(&self, entry: &Entry) -> u32 {
        let mut state = self.state.lock();
        self.remove_locked(&mut state, entry)
    }

    fn remove_transient(&self) -> Result<u32> {
        let _state = self.state.lock();
        let mut removed: BTreeMap<i64, Entry> = self
            .transient
            .drain_transient()
            .into_iter()
            .map(|e| (e.unique_id(), e))
            .collect();
        if let Some(persistent) = self.usable_persistent() {
            removed.extend(
                persistent
                    .drain_transient()?
                    .into_iter()
                    .map(|e| (e.unique_id(), e)),
            );
        }

        for entry in removed.values() {
            entry.removed(self.lookup());
        }
        Ok(removed.len() as u32)
    }

    fn num_entries(&self) -> u64 {
        match self.usable_persistent() {
            Some(persistent) => {
                persistent.num_entries()
                    + self
                        .transient
                        .num_entries()
                        .saturating_sub(self.transient.num_durable_entries())
                    + self.unbacked_entries.load(Ordering::Relaxed)
            }
            None => self.transient.num_entries(),
        }
    }

    fn num_bytes(&self) -> u64 {
        match self.usable_persistent() {
            Some(persistent) => {
                persistent.num_bytes()
                    + self
                        .transient
                        .num_bytes()
                        .saturating_sub(self.transient.num_durable_bytes())
                    + self.unbacked_bytes.load(Ordering::Relaxed)
            }
            None => self.transient.num_bytes(),
        }
    }

    fn num_durable_entries(&self) -> u64 {
        match self.usable_persistent() {
            Some(persistent) => {
                persistent.num_durable_entries() + self.unbacked_entries.load(Ordering::Relaxed)
            }
            None => self.transient.num_durable_entries(),
        }
    }

    fn num_durable_bytes(&self) -> u64 {
        match self.usable_persistent() {
            Some(persistent) => {
                persistent.num_durable_bytes() + self.unbacked_bytes.load(Ordering::Relaxed)
            }
            None => self.transient.num_durable_bytes(),
        }
    }

    fn max_entries(&self) -> u64 {
        match self.usable_persistent() {
            Some(_) => self.config.read().max_entries,
            None => self.transient.max_entries(),
        }
    }

    fn max_bytes(&self) -> u64 {
        match self.usable_persistent() {
            Some(_) => self.config.read().max_bytes,
            None => self.transient.max_bytes(),
        }
    }

    fn clear(&self) -> u64 {
        let mut state = self.state.lock();
        let entries = self.get_all();

        for entry in self.transient.get_all() {
            self.defer_persistent_removal(&mut state, &entry);
        }
        self.transient.clear();
        if let Some(persistent) = self.usable_persistent() {
            persistent.clear();
        }
        self.clear_unbacked(&mut state);

        for entry in &entries {
            entry.removed(self.lookup());
        }
        debug!(storage = %self.storage_id, cleared = entries.len(), "store cleared");
        entries.len() as u64
    }

    fn shutdown(&self, force: bool) {
        let _state = self.state.lock();
        self.shut_down.store(true, Ordering::Release);
        self.transient.shutdown(force);
        if let Some(persistent) = &self.persistent {
            persistent.shutdown(force);
        }
        info!(storage = %self.storage_id, force, "store shut down");
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.require_connected()?;
        let entries = self.get_all();

        if let Some(persistent) = &self.persistent {
            persistent.destroy()?;
        }
        self.shut_down.store(true, Ordering::Release);
        self.transient.destroy()?;
        self.clear_unbacked(&mut state);
        state.pending_removals.clear();
        for entry in &entries {
            entry.removed(self.lookup());
        }

        info!(storage = %self.storage_id, "store destroyed");
        Ok(())
    }
}

// =============================================================================
// Usage Report
// =============================================================================

/// Usage snapshot of a tiered store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreUsage {
    pub storage_id: StorageId,
    pub state: ConnectionState,
    pub entries: u64,
    pub bytes: u64,
    pub durable_entries: u64,
    pub durable_bytes: u64,
    pub max_entries: u64,
    pub max_bytes: u64,
    pub transient: TierUsage,
    pub persistent: Option<TierUsage>,
    /// Durable entries held only by the transient tier
    pub unbacked_entries: u64,
}

impl StoreUsage {
    /// Per-tier usage labelled by tier name
    pub fn tiers(&self) -> Vec<(&'static str, TierUsage)> {
        let mut tiers = vec![("transient", self.transient)];
        if let Some(persistent) = self.persistent {
            tiers.push(("persistent", persistent));
        }
        tiers
    }
}

impl fmt::Display for StoreUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}/{} entries, {}/{} bytes, {} durable; transient {}",
            self.storage_id,
            self.state,
            self.entries,
            self.max_entries,
            self.bytes,
            self.max_bytes,
            self.durable_entries,
            self.transient.entries,
        )?;
        if let Some(persistent) = &self.persistent {
            write!(f, ", persistent {}", persistent.entries)?;
        }
        if self.unbacked_entries > 0 {
            write!(f, ", unbacked {}", self.unbacked_entries)?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
