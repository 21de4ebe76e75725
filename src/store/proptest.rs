//! Property-Based Tests for the Tiered Store
//!
//! Drives random operation sequences against a tiered store backed by the
//! in-memory persistence backend.
//!
//! # Test Properties
//!
//! 1. **Accounting**: the counters always equal the sum over `get_all`
//! 2. **Reference Conservation**: a body's count equals the entries referencing it
//! 3. **Swap Identity**: an entry read back after swapping equals what was put
//! 4. **Durability**: durable entries survive a disconnect/reconnect cycle
//! 5. **Limits**: a connected store never holds more than its limits

#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use super::backend::InMemoryBackend;
use super::body::{BodyQos, BodyRegistry, SharedBody};
use super::config::StoreConfig;
use super::entry::{Entry, EntryKind, StorageId};
use super::map::{StoreMap, TierUsage};
use super::tiered::TieredCacheStore;

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Put(i64),
    Get(i64),
    Remove(i64),
    Disconnect,
    Reconnect,
    RemoveTransient,
}

/// Strategy for one store operation over a small id space so ids collide.
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0i64..24).prop_map(Op::Put),
        2 => (0i64..24).prop_map(Op::Get),
        2 => (0i64..24).prop_map(Op::Remove),
        1 => Just(Op::Disconnect),
        1 => Just(Op::Reconnect),
        1 => Just(Op::RemoveTransient),
    ]
}

/// Strategy for operation sequences that never lose the connection.
fn connected_op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0i64..24).prop_map(Op::Put),
        2 => (0i64..24).prop_map(Op::Get),
        2 => (0i64..24).prop_map(Op::Remove),
    ]
}

/// Strategy for (entry size, durable) pairs.
fn entry_shape_strategy() -> impl Strategy<Value = Vec<(usize, bool)>> {
    prop::collection::vec((1usize..64, any::<bool>()), 1..40)
}

// =============================================================================
// Fixture
// =============================================================================

struct Fixture {
    store: Arc<TieredCacheStore>,
    backend: Arc<InMemoryBackend>,
    bodies: Vec<Arc<SharedBody>>,
}

impl Fixture {
    fn new(config: StoreConfig) -> Self {
        let registry = Arc::new(BodyRegistry::new());
        let bodies: Vec<_> = [true, false]
            .into_iter()
            .enumerate()
            .map(|(i, durable)| {
                let body = SharedBody::new(
                    "prop",
                    500 + i as i64,
                    "<key/>",
                    Bytes::from(vec![b'b'; 10]),
                    BodyQos {
                        durable,
                        ..BodyQos::default()
                    },
                );
                registry.publish(body.clone());
                body
            })
            .collect();

        let backend = Arc::new(InMemoryBackend::new());
        let store = TieredCacheStore::builder(StorageId::new("callback", "prop"))
            .config(config)
            .backend(backend.clone())
            .lookup(registry)
            .open()
            .unwrap();

        Self {
            store,
            backend,
            bodies,
        }
    }

    /// The same id always yields the same entry
    fn entry(&self, id: i64) -> Entry {
        let storage_id = StorageId::new("callback", "prop");
        if id % 4 == 0 {
            let body = &self.bodies[(id / 4) as usize % self.bodies.len()];
            Entry::reference(storage_id, EntryKind::Update, id, body)
        } else {
            let size = (id as usize % 5 + 1) * 8;
            Entry::inline(storage_id, EntryKind::Update, id, Bytes::from(vec![id as u8; size]))
                .durable(id % 3 == 0)
        }
    }

    fn apply(&self, op: &Op) {
        match *op {
            Op::Put(id) => {
                let _ = self.store.put(&self.entry(id));
            }
            Op::Get(id) => {
                self.store.get(id);
            }
            Op::Remove(id) => {
                self.store.remove(&self.entry(id));
            }
            Op::Disconnect => self.backend.disconnect(),
            Op::Reconnect => self.backend.reconnect(),
            Op::RemoveTransient => {
                let _ = self.store.remove_transient();
            }
        }
    }
}

fn check_accounting(store: &TieredCacheStore) -> Result<(), TestCaseError> {
    let usage = TierUsage::of(&store.get_all());
    prop_assert_eq!(store.num_entries(), usage.entries);
    prop_assert_eq!(store.num_bytes(), usage.bytes);
    prop_assert_eq!(store.num_durable_entries(), usage.durable_entries);
    prop_assert_eq!(store.num_durable_bytes(), usage.durable_bytes);
    Ok(())
}

fn check_references(fixture: &Fixture) -> Result<(), TestCaseError> {
    let all = fixture.store.get_all();
    for body in &fixture.bodies {
        let referencing = all
            .iter()
            .filter_map(Entry::body_ref)
            .filter(|body_ref| body_ref.body_unique_id() == body.unique_id())
            .count() as u32;
        prop_assert_eq!(body.reference_count(), referencing);
    }
    Ok(())
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the combined counters match the visible entries after every operation
    #[test]
    fn prop_accounting_holds(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let fixture = Fixture::new(StoreConfig::new(12, 400, 4, 120));
        for op in &ops {
            fixture.apply(op);
            check_accounting(&fixture.store)?;
        }
        fixture.backend.reconnect();
        check_accounting(&fixture.store)?;
    }

    /// Property: body reference counts equal the referencing entries while connected
    #[test]
    fn prop_references_conserved(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let fixture = Fixture::new(StoreConfig::new(12, 400, 4, 120));
        for op in &ops {
            fixture.apply(op);
            if fixture.store.is_connected() {
                check_references(&fixture)?;
            }
        }
        fixture.backend.reconnect();
        check_references(&fixture)?;

        fixture.store.clear();
        for body in &fixture.bodies {
            prop_assert_eq!(body.reference_count(), 0);
        }
    }

    /// Property: a connected store never exceeds its entry or byte limits
    #[test]
    fn prop_limits_respected(ops in prop::collection::vec(connected_op_strategy(), 1..80)) {
        let fixture = Fixture::new(StoreConfig::new(8, 200, 3, 90));
        for op in &ops {
            fixture.apply(op);
            prop_assert!(fixture.store.num_entries() <= 8);
            prop_assert!(fixture.store.num_bytes() <= 200);
            check_accounting(&fixture.store)?;
        }
    }

    /// Property: entries read back equal what was put, wherever they were swapped to
    #[test]
    fn prop_swap_identity(shapes in entry_shape_strategy()) {
        let fixture = Fixture::new(StoreConfig::new(100, 10_000, 3, 100));
        let entries: Vec<Entry> = shapes
            .iter()
            .enumerate()
            .map(|(i, &(size, durable))| {
                Entry::inline(
                    StorageId::new("callback", "prop"),
                    EntryKind::Update,
                    i as i64 + 1,
                    Bytes::from(vec![i as u8; size]),
                )
                .durable(durable)
            })
            .collect();

        for entry in &entries {
            prop_assert_eq!(fixture.store.put(entry).unwrap(), 1);
        }
        for entry in &entries {
            let got = fixture.store.get(entry.unique_id());
            prop_assert_eq!(got.as_ref(), Some(entry));
        }
        prop_assert_eq!(fixture.store.get_all(), entries);
        check_accounting(&fixture.store)?;
    }

    /// Property: durable entries are all readable after a disconnect/reconnect cycle
    #[test]
    fn prop_durable_survives_outage(shapes in entry_shape_strategy()) {
        let fixture = Fixture::new(StoreConfig::new(100, 10_000, 3, 100));
        let entries: Vec<Entry> = shapes
            .iter()
            .enumerate()
            .map(|(i, &(size, durable))| {
                Entry::inline(
                    StorageId::new("callback", "prop"),
                    EntryKind::Update,
                    i as i64 + 1,
                    Bytes::from(vec![i as u8; size]),
                )
                .durable(durable)
            })
            .collect();
        for entry in &entries {
            fixture.store.put(entry).unwrap();
        }

        fixture.backend.disconnect();
        fixture.backend.reconnect();

        for entry in entries.iter().filter(|e| e.is_durable()) {
            let got = fixture.store.get(entry.unique_id());
            prop_assert_eq!(got.as_ref(), Some(entry));
        }
        check_accounting(&fixture.store)?;
    }
}
