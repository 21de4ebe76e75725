//! Tiered Broker Store
//!
//! Queue and map storage for a message broker: callback queues, topic history,
//! message bodies, sessions and subscriptions all share one store design.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      TieredCacheStore (per storage id)                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Transient Tier (RAM)           │  Persistent Tier                    │
//! │  ┌──────────────────────────┐   │  ┌──────────────────────────────┐   │
//! │  │ BTreeMap<unique id, ..>  │   │  │ PersistenceBackend table     │   │
//! │  │ max_entries_cache        │   │  │ max_entries / max_bytes      │   │
//! │  │ max_bytes_cache          │   │  │ (stripped storage id)        │   │
//! │  └──────────────────────────┘   │  └──────────────────────────────┘   │
//! │               │                 │                │                    │
//! │               └──── swap out / swap in ──────────┘                    │
//! │                                 │                                     │
//! │                ConnectionListener (disconnect / reconnect)            │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!          Entry ── Payload::Reference ──▶ SharedBody (reference counted)
//! ```
//!
//! # Design Principles
//!
//! - One generic store for every role; the swap and overflow logic exists once
//! - Exact O(1) entry and byte accounting across both tiers
//! - Durable entries are never dropped silently
//! - Degrades to transient-only operation while the persistent tier is away

mod backend;
mod body;
mod config;
mod entry;
mod listener;
mod map;
mod metrics;
mod persistent;
mod proptest;
mod tiered;
mod transient;

pub use backend::{BackendError, BackendResult, BackendStats, InMemoryBackend, PersistenceBackend};
pub use body::{BodyLookup, BodyQos, BodyRef, BodyRegistry, SharedBody};
pub use config::{FailurePolicy, OverflowPolicy, StoreConfig, StoreOverrides, StoreRole, StoreSettings};
pub use entry::{next_unique_id, Entry, EntryKind, Payload, Priority, StorageId, UniqueIdGenerator};
pub use listener::{ConnectionListener, ConnectionState, ListenerSet};
pub use map::{Capacity, StoreMap, TierCounters, TierUsage};
pub use metrics::{MetricsSnapshot, PrometheusExporter, StoreMetrics};
pub use persistent::PersistentTier;
pub use tiered::{StoreUsage, TieredCacheStore, TieredStoreBuilder};
pub use transient::TransientTier;
