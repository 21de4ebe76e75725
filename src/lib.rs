//! brokerstore - Tiered Storage for Message Broker Queues and Maps
//!
//! Every queue and map of a publish/subscribe broker (client callback queues,
//! topic history, the message body store, sessions, subscriptions) is a
//! [`TieredCacheStore`]: a bounded in-memory cache portion in front of an
//! optional persistent tier, with exact entry and byte accounting across both.
//!
//! Queue entries may reference one shared message body instead of copying it;
//! the body's reference count tracks how many stores still hold it.
//!
//! # Architecture
//!
//! ```text
//! producer ─ put ─▶ TieredCacheStore ─┬─▶ TransientTier (RAM)
//!                                      └─▶ PersistentTier ─▶ PersistenceBackend
//!                                                  ▲
//!                     ConnectionListener ◀─────────┘ disconnect / reconnect
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types
//! - [`store`] - Entries, tiers, the tiered store and its configuration

pub mod error;
pub mod store;

// Re-export commonly used types
pub use error::{Error, Result};
pub use store::{
    Entry, EntryKind, InMemoryBackend, PersistenceBackend, StorageId, StoreConfig, StoreMap,
    StoreRole, StoreSettings, TieredCacheStore,
};
