//! Persistent Tier - Backend-backed Store Portion
//!
//! Wraps a [`PersistenceBackend`] table with the same map contract as the
//! transient tier. Usage counters are kept locally so reads stay O(1); they
//! are seeded from the backend when the tier is opened.
//!
//! The `try_*` operations surface backend failures to the tiered store. The
//! [`StoreMap`] implementation logs them and degrades to "not found".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::backend::{BackendError, PersistenceBackend};
use super::entry::{Entry, StorageId};
use super::listener::ConnectionListener;
use super::map::{Capacity, StoreMap, TierCounters, TierUsage};
use crate::error::{Error, Result};

const TIER: &str = "persistent tier";

/// Persistent tier of one store
pub struct PersistentTier {
    storage_id: StorageId,
    table: String,
    backend: Arc<dyn PersistenceBackend>,
    capacity: RwLock<Capacity>,
    counters: TierCounters,
    /// Serialises mutations so counters match the table
    write_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PersistentTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTier")
            .field("storage_id", &self.storage_id)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl PersistentTier {
    /// Open the table for `storage_id`, picking up whatever it already holds
    pub fn open(
        storage_id: StorageId,
        capacity: Capacity,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Result<Self> {
        let table = storage_id.stripped();
        let usage = backend.open(&table).map_err(|err| match err {
            BackendError::Disconnected => Error::PersistenceUnavailable {
                storage_id: storage_id.to_string(),
            },
            BackendError::Io(reason) => Error::Persistence {
                storage_id: storage_id.to_string(),
                reason,
            },
        })?;

        let counters = TierCounters::new();
        counters.seed(usage);
        if usage.entries > 0 {
            info!(
                storage = %storage_id,
                backend = backend.name(),
                entries = usage.entries,
                bytes = usage.bytes,
                "reloaded persistent entries"
            );
        }

        Ok(Self {
            storage_id,
            table,
            backend,
            capacity: RwLock::new(capacity),
            counters,
            write_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Physical table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Storage id this tier belongs to
    pub fn storage_id(&self) -> &StorageId {
        &self.storage_id
    }

    /// True while the backend connection is up
    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Register for the backend's connection notifications
    pub fn add_connection_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.backend.add_connection_listener(listener);
    }

    /// Current limits
    pub fn capacity(&self) -> Capacity {
        *self.capacity.read()
    }

    /// Replace the limits
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

    fn map_err(&self, err: BackendError) -> Error {
        match err {
            BackendError::Disconnected => Error::PersistenceUnavailable {
                storage_id: self.storage_id.to_string(),
            },
            BackendError::Io(reason) => Error::Persistence {
                storage_id: self.storage_id.to_string(),
                reason,
            },
        }
    }

    /// Store an entry: 1 if new, 0 if the unique id is already persisted
    pub fn try_put(&self, entry: &Entry) -> Result<u32> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Internal(format!(
                "{} of '{}' is shut down",
                TIER, self.storage_id
            )));
        }

        let _guard = self.write_lock.lock();
        let capacity = self.capacity();
        let (count, bytes) = (self.counters.entries(), self.counters.bytes());
        if !capacity.admits(count, bytes, entry.size_bytes()) {
            return Err(capacity.overflow(&self.storage_id, TIER, count, bytes));
        }

        if self
            .backend
            .put(&self.table, entry)
            .map_err(|err| self.map_err(err))?
        {
            self.counters.record_added(entry);
            Ok(1)
        } else {
            debug!(storage = %self.storage_id, entry = entry.unique_id(), "already persisted");
            Ok(0)
        }
    }

    /// Look up an entry
    pub fn try_get(&self, unique_id: i64) -> Result<Option<Entry>> {
        let entry = self
            .backend
            .get(&self.table, unique_id)
            .map_err(|err| self.map_err(err))?;
        match entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        Ok(entry)
    }

    /// All persisted entries ordered by unique id
    pub fn try_get_all(&self) -> Result<Vec<Entry>> {
        self.backend
            .get_all(&self.table)
            .map_err(|err| self.map_err(err))
    }

    /// Remove an entry: 1 if it was persisted, else 0
    pub fn try_remove(&self, entry: &Entry) -> Result<u32> {
        self.try_remove_id(entry.unique_id())
    }

    /// Remove by unique id: 1 if it was persisted, else 0
    pub fn try_remove_id(&self, unique_id: i64) -> Result<u32> {
        let _guard = self.write_lock.lock();
        match self
            .backend
            .remove(&self.table, unique_id)
            .map_err(|err| self.map_err(err))?
        {
            Some(removed) => {
                self.counters.record_removed(&removed);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Remove and return every non-durable (swapped) entry
    pub fn drain_transient(&self) -> Result<Vec<Entry>> {
        let _guard = self.write_lock.lock();
        let drained = self
            .backend
            .remove_transient(&self.table)
            .map_err(|err| self.map_err(err))?;
        self.counters.subtract(TierUsage::of(&drained));
        Ok(drained)
    }

    /// Remove every entry
    pub fn try_clear(&self) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let cleared = self
            .backend
            .clear(&self.table)
            .map_err(|err| self.map_err(err))?;
        self.counters.reset();
        Ok(cleared)
    }
}

impl StoreMap for PersistentTier {
    fn put(&self, entry: &Entry) -> Result<u32> {
        self.try_put(entry)
    }

    fn get(&self, unique_id: i64) -> Option<Entry> {
        self.try_get(unique_id).unwrap_or_else(|err| {
            warn!(storage = %self.storage_id, entry = unique_id, error = %err, "persistent lookup failed");
            None
        })
    }

    fn get_all(&self) -> Vec<Entry> {
        self.try_get_all().unwrap_or_else(|err| {
            warn!(storage = %self.storage_id, error = %err, "persistent scan failed");
            Vec::new()
        })
    }

    fn remove(&self, entry: &Entry) -> u32 {
        self.try_remove(entry).unwrap_or_else(|err| {
            warn!(storage = %self.storage_id, entry = entry.unique_id(), error = %err, "persistent remove failed");
            0
        })
    }

    fn remove_transient(&self) -> Result<u32> {
        Ok(self.drain_transient()?.len() as u32)
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
        self.try_clear().unwrap_or_else(|err| {
            warn!(storage = %self.storage_id, error = %err, "persistent clear failed");
            0
        })
    }

    fn shutdown(&self, _force: bool) {
        self.shut_down.store(true, Ordering::Release);
        info!(storage = %self.storage_id, table = %self.table, "persistent tier shut down");
    }

    fn destroy(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.backend
            .drop_table(&self.table)
            .map_err(|err| self.map_err(err))?;
        self.shut_down.store(true, Ordering::Release);
        self.counters.reset();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
