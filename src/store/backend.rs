//! Persistence Backend
//!
//! Storage engine behind a persistent tier. Each store owns one table named
//! after its stripped storage id. The backend also owns the connection and
//! tells registered [`ConnectionListener`]s when it drops and comes back.
//!
//! [`InMemoryBackend`] simulates such an engine for tests and the `simulate`
//! command: it can be disconnected, reconnected and made to fail.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Weak;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

use super::entry::Entry;
use super::listener::{ConnectionListener, ListenerSet};
use super::map::TierUsage;

/// Failure reported by a persistence backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The connection to the storage engine is down
    #[error("backend is disconnected")]
    Disconnected,

    /// The storage engine failed the operation
    #[error("backend I/O failure: {0}")]
    Io(String),
}

/// Result type of backend operations
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Storage engine trait
///
/// Implementations must only notify connection listeners from their connection
/// management path, never from inside one of the data operations below.
pub trait PersistenceBackend: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &str;

    /// True while the connection is up
    fn is_connected(&self) -> bool;

    /// Open (or create) a table, returning the usage of what it already holds
    fn open(&self, table: &str) -> BackendResult<TierUsage>;

    /// Store an entry: false if the unique id is already present
    fn put(&self, table: &str, entry: &Entry) -> BackendResult<bool>;

    /// Look up an entry
    fn get(&self, table: &str, unique_id: i64) -> BackendResult<Option<Entry>>;

    /// All entries of a table ordered by unique id
    fn get_all(&self, table: &str) -> BackendResult<Vec<Entry>>;

    /// Remove an entry, returning it if it was stored
    fn remove(&self, table: &str, unique_id: i64) -> BackendResult<Option<Entry>>;

    /// Remove every non-durable entry, returning the removed entries
    fn remove_transient(&self, table: &str) -> BackendResult<Vec<Entry>>;

    /// Remove every entry, returning how many were stored
    fn clear(&self, table: &str) -> BackendResult<u64>;

    /// Delete the table itself
    fn drop_table(&self, table: &str) -> BackendResult<()>;

    /// Register for connection state notifications
    fn add_connection_listener(&self, listener: Weak<dyn ConnectionListener>);

    /// Operation statistics
    fn stats(&self) -> BackendStats;
}

/// Backend statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Number of open tables
    pub tables: u64,
    /// Entries stored across all tables
    pub entry_count: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
    /// Operations rejected while disconnected or failed on purpose
    pub failures: u64,
}

/// In-memory backend with a simulated connection
/// Uses DashMap so independent tables never contend
pub struct InMemoryBackend {
    /// Storage (table -> unique id -> entry)
    tables: DashMap<String, DashMap<i64, Entry>>,
    connected: AtomicBool,
    fail_open: AtomicBool,
    failing_puts: AtomicU32,
    listeners: ListenerSet,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            tables: DashMap::new(),
            connected: AtomicBool::new(true),
            fail_open: AtomicBool::new(false),
            failing_puts: AtomicU32::new(0),
            listeners: ListenerSet::new(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}

impl InMemoryBackend {
    /// Create a connected, empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the connection and notify listeners (no-op if already down)
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            info!(backend = self.name(), "connection lost");
            self.listeners.notify_disconnected();
        }
    }

    /// Restore the connection and notify listeners (no-op if already up)
    pub fn reconnect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!(backend = self.name(), "connection restored");
            self.listeners.notify_reconnected();
        }
    }

    /// Make the next `count` puts fail with an I/O error
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::Release);
    }

    /// Make `open` fail until reset
    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::Release);
    }

    /// Number of entries stored in `table`
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Number of registered live listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn check_connected(&self) -> BackendResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            Err(BackendError::Disconnected)
        }
    }

    fn take_put_failure(&self) -> bool {
        let failed = self
            .failing_puts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        failed
    }
}

impl PersistenceBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "in-memory"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn open(&self, table: &str) -> BackendResult<TierUsage> {
        self.check_connected()?;
        if self.fail_open.load(Ordering::Acquire) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::Io(format!("cannot open table '{}'", table)));
        }

        let table_data = self
            .tables
            .entry(table.to_string())
            .or_insert_with(DashMap::new);
        let stored: Vec<Entry> = table_data.iter().map(|item| item.value().clone()).collect();
        let usage = TierUsage::of(&stored);
        debug!(table, entries = usage.entries, "table opened");
        Ok(usage)
    }

    fn put(&self, table: &str, entry: &Entry) -> BackendResult<bool> {
        self.check_connected()?;
        if self.take_put_failure() {
            return Err(BackendError::Io(format!(
                "write of entry {} to '{}' failed",
                entry.unique_id(),
                table
            )));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);

        let table_data = self
            .tables
            .entry(table.to_string())
            .or_insert_with(DashMap::new);
        let inserted = match table_data.entry(entry.unique_id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                true
            }
        };
        Ok(inserted)
    }

    fn get(&self, table: &str, unique_id: i64) -> BackendResult<Option<Entry>> {
        self.check_connected()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .tables
            .get(table)
            .and_then(|table_data| table_data.get(&unique_id).map(|e| e.value().clone())))
    }

    fn get_all(&self, table: &str) -> BackendResult<Vec<Entry>> {
        self.check_connected()?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let mut entries: Vec<Entry> = match self.tables.get(table) {
            Some(table_data) => table_data.iter().map(|e| e.value().clone()).collect(),
            None => Vec::new(),
        };
        entries.sort_by_key(Entry::unique_id);
        Ok(entries)
    }

    fn remove(&self, table: &str, unique_id: i64) -> BackendResult<Option<Entry>> {
        self.check_connected()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .tables
            .get(table)
            .and_then(|table_data| table_data.remove(&unique_id).map(|(_, entry)| entry)))
    }

    fn remove_transient(&self, table: &str) -> BackendResult<Vec<Entry>> {
        self.check_connected()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let mut removed = Vec::new();
        if let Some(table_data) = self.tables.get(table) {
            table_data.retain(|_, entry| {
                if entry.is_durable() {
                    true
                } else {
                    removed.push(entry.clone());
                    false
                }
            });
        }
        removed.sort_by_key(Entry::unique_id);
        Ok(removed)
    }

    fn clear(&self, table: &str) -> BackendResult<u64> {
        self.check_connected()?;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        Ok(match self.tables.get(table) {
            Some(table_data) => {
                let count = table_data.len() as u64;
                table_data.clear();
                count
            }
            None => 0,
        })
    }

    fn drop_table(&self, table: &str) -> BackendResult<()> {
        self.check_connected()?;
        self.tables.remove(table);
        debug!(table, "table dropped");
        Ok(())
    }

    fn add_connection_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            tables: self.tables.len() as u64,
            entry_count: self.tables.iter().map(|t| t.value().len() as u64).sum(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
