//! brokerstore Integration Tests
//!
//! Exercises the public store API end to end:
//! - Tiering: swap out, swap in, write-through and overflow
//! - Connection state: disconnect, reconnect and transient-only operation
//! - Shared bodies: reference counting across several stores
//! - Configuration: role defaults and settings files
//! - Observability: metrics snapshots and Prometheus export

use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;

use brokerstore::store::{
    BodyQos, BodyRegistry, ConnectionState, Entry, EntryKind, InMemoryBackend, SharedBody,
    StorageId, StoreConfig, StoreMap, TierUsage, TieredCacheStore,
};
use brokerstore::Error;

fn storage(postfix: &str) -> StorageId {
    StorageId::new("callback", postfix)
}

fn make_entry(storage_id: &StorageId, id: i64, size: usize, durable: bool) -> Entry {
    Entry::inline(storage_id.clone(), EntryKind::Update, id, Bytes::from(vec![1u8; size]))
        .durable(durable)
}

fn open_store(
    storage_id: StorageId,
    config: StoreConfig,
    backend: &Arc<InMemoryBackend>,
) -> Arc<TieredCacheStore> {
    TieredCacheStore::builder(storage_id)
        .config(config)
        .backend(backend.clone())
        .open()
        .unwrap()
}

fn assert_accounting(store: &TieredCacheStore) {
    let usage = TierUsage::of(&store.get_all());
    assert_eq!(store.num_entries(), usage.entries);
    assert_eq!(store.num_bytes(), usage.bytes);
    assert_eq!(store.num_durable_entries(), usage.durable_entries);
    assert_eq!(store.num_durable_bytes(), usage.durable_bytes);
}

// =============================================================================
// Tiering
// =============================================================================

mod tiering_tests {
    use super::*;

    #[test]
    fn test_cache_swap_scenario() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client1");
        let store = open_store(id.clone(), StoreConfig::new(2, 1000, 1, 1000), &backend);

        let e1 = make_entry(&id, 1, 10, false);
        let e2 = make_entry(&id, 2, 10, false);
        assert_eq!(store.put(&e1).unwrap(), 1);
        assert_eq!(store.put(&e2).unwrap(), 1);
        assert_eq!(store.num_entries(), 2);
        assert_eq!(store.transient().num_entries(), 1);
        assert_eq!(backend.table_len("callback_client1"), 1);

        // A third entry exceeds the store limit
        assert_matches!(
            store.put(&make_entry(&id, 3, 10, false)),
            Err(Error::ResourceOverflow { .. })
        );

        assert_eq!(store.get(1), Some(e1.clone()));
        assert_eq!(store.get(2), Some(e2));
        assert_eq!(store.num_entries(), 2);

        assert_eq!(store.remove(&e1), 1);
        assert_eq!(store.remove(&e1), 0);
        assert_eq!(store.num_entries(), 1);
        assert_accounting(&store);
    }

    #[test]
    fn test_byte_overflow_is_exact() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client2");
        let store = open_store(id.clone(), StoreConfig::new(100, 30, 100, 30), &backend);

        store.put(&make_entry(&id, 1, 20, false)).unwrap();
        // Exactly at the limit is fine
        assert_eq!(store.put(&make_entry(&id, 2, 10, false)).unwrap(), 1);
        assert_matches!(
            store.put(&make_entry(&id, 3, 1, false)),
            Err(Error::ResourceOverflow { max_bytes: 30, .. })
        );
        assert_eq!(store.num_bytes(), 30);
    }

    #[test]
    fn test_durable_entries_written_through() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client3");
        let store = open_store(id.clone(), StoreConfig::default(), &backend);

        for i in 1..=5 {
            store.put(&make_entry(&id, i, 8, i % 2 == 1)).unwrap();
        }
        assert_eq!(backend.table_len("callback_client3"), 3);
        assert_eq!(store.num_entries(), 5);
        assert_eq!(store.num_durable_entries(), 3);
        assert_accounting(&store);
    }

    #[test]
    fn test_remove_transient_drops_swapped_entries() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client4");
        let store = open_store(id.clone(), StoreConfig::new(20, 1000, 2, 1000), &backend);

        for i in 1..=6 {
            store.put(&make_entry(&id, i, 8, i % 3 == 0)).unwrap();
        }
        assert_eq!(store.remove_transient().unwrap(), 4);
        assert_eq!(store.num_entries(), 2);
        assert!(store.get_all().iter().all(Entry::is_durable));
        assert_accounting(&store);
    }
}

// =============================================================================
// Connection State
// =============================================================================

mod connection_tests {
    use super::*;

    #[test]
    fn test_disconnect_reconnect_cycle() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client5");
        let store = open_store(id.clone(), StoreConfig::new(10, 1000, 2, 1000), &backend);

        let durable = make_entry(&id, 1, 10, true);
        let swapped = make_entry(&id, 2, 10, false);
        let cached = make_entry(&id, 3, 10, false);
        let newest = make_entry(&id, 4, 10, false);
        for entry in [&durable, &swapped, &cached, &newest] {
            store.put(entry).unwrap();
        }
        assert_eq!(store.num_entries(), 4);

        backend.disconnect();
        assert_eq!(store.connection_state(), ConnectionState::Disconnected);
        assert_eq!(store.num_entries(), 2);
        assert_eq!(store.max_entries(), 2);
        assert!(store.get(1).is_none());
        assert_matches!(
            store.put(&make_entry(&id, 5, 10, false)),
            Err(Error::ResourceOverflow { .. })
        );

        backend.reconnect();
        assert_eq!(store.connection_state(), ConnectionState::Connected);
        assert_eq!(store.get(1), Some(durable));
        // Swapped non-durable entries do not survive the outage
        assert!(store.get(2).is_none());
        assert_eq!(store.get(3), Some(cached));
        assert_eq!(store.metrics().reconnects, 1);
        assert_accounting(&store);
    }

    #[test]
    fn test_every_store_on_a_backend_is_notified() {
        let backend = Arc::new(InMemoryBackend::new());
        let stores: Vec<_> = (0..3)
            .map(|i| open_store(storage(&format!("s{}", i)), StoreConfig::default(), &backend))
            .collect();
        assert_eq!(backend.listener_count(), 3);

        backend.disconnect();
        assert!(stores.iter().all(|store| !store.is_connected()));
        backend.reconnect();
        assert!(stores.iter().all(|store| store.is_connected()));

        drop(stores);
        assert_eq!(backend.listener_count(), 0);
    }

    #[test]
    fn test_failed_open_stays_transient_only() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_open(true);
        let id = storage("client6");
        let store = open_store(id.clone(), StoreConfig::new(10, 1000, 2, 1000), &backend);

        assert!(store.persistent().is_none());
        assert_eq!(backend.listener_count(), 0);
        store.put(&make_entry(&id, 1, 10, true)).unwrap();
        store.put(&make_entry(&id, 2, 10, false)).unwrap();
        assert_matches!(
            store.put(&make_entry(&id, 3, 10, false)),
            Err(Error::ResourceOverflow { .. })
        );

        backend.fail_open(false);
        backend.disconnect();
        backend.reconnect();
        assert!(!store.is_connected());
        assert_eq!(store.num_entries(), 2);
    }

    #[test]
    fn test_persistence_failure_keeps_entry_in_memory() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("client7");
        let store = open_store(id.clone(), StoreConfig::default(), &backend);

        backend.fail_next_puts(1);
        assert_eq!(store.put(&make_entry(&id, 1, 10, true)).unwrap(), 1);
        assert_eq!(backend.table_len("callback_client7"), 0);
        assert_eq!(store.num_durable_entries(), 1);
        assert_eq!(store.usage().unbacked_entries, 1);
        assert_eq!(store.metrics().persistence_failures, 1);
        assert_accounting(&store);
    }
}

// =============================================================================
// Shared Bodies
// =============================================================================

mod reference_tests {
    use super::*;

    fn publish(registry: &BodyRegistry, unique_id: i64, durable: bool) -> Arc<SharedBody> {
        let body = SharedBody::new(
            "news",
            unique_id,
            "<key oid='news'/>",
            Bytes::from_static(b"breaking"),
            BodyQos {
                durable,
                ..BodyQos::default()
            },
        );
        registry.publish(body.clone());
        body
    }

    #[test]
    fn test_one_body_many_queues() {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(BodyRegistry::new());
        let body = publish(&registry, 42, false);

        let stores: Vec<_> = (0..3)
            .map(|i| {
                TieredCacheStore::builder(storage(&format!("subscriber{}", i)))
                    .config(StoreConfig::new(10, 1000, 1, 1000))
                    .backend(backend.clone())
                    .lookup(registry.clone())
                    .open()
                    .unwrap()
            })
            .collect();

        let entries: Vec<_> = stores
            .iter()
            .map(|store| {
                let entry = Entry::reference(store.storage_id().clone(), EntryKind::Update, 7, &body);
                store.put(&entry).unwrap();
                entry
            })
            .collect();
        assert_eq!(body.reference_count(), 3);

        // Duplicate put takes no extra reference
        assert_eq!(stores[0].put(&entries[0]).unwrap(), 0);
        assert_eq!(body.reference_count(), 3);

        stores[0].remove(&entries[0]);
        assert_eq!(body.reference_count(), 2);
        stores[1].clear();
        assert_eq!(body.reference_count(), 1);
        stores[2].remove(&entries[2]);
        assert_eq!(body.reference_count(), 0);
        assert!(body.is_unreferenced());
        assert_eq!(registry.release_unreferenced("news"), 1);
    }

    #[test]
    fn test_reference_survives_swap() {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(BodyRegistry::new());
        let body = publish(&registry, 43, false);
        let id = storage("subscriber");
        let store = TieredCacheStore::builder(id.clone())
            .config(StoreConfig::new(10, 1000, 1, 1000))
            .backend(backend.clone())
            .lookup(registry.clone())
            .open()
            .unwrap();

        let entry = Entry::reference(id.clone(), EntryKind::Update, 1, &body);
        store.put(&entry).unwrap();
        store.put(&make_entry(&id, 2, 10, false)).unwrap();
        assert!(!store.transient().contains(1));
        assert_eq!(body.reference_count(), 1);

        let found = store.get(1).unwrap();
        assert_eq!(found.resolve(None).map(|b| b.unique_id()), Some(43));
        assert_eq!(body.reference_count(), 1);
    }

    #[test]
    fn test_purge_on_reconnect_releases_references() {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = Arc::new(BodyRegistry::new());
        let body = publish(&registry, 44, false);
        let id = storage("subscriber");
        let store = TieredCacheStore::builder(id.clone())
            .config(StoreConfig::new(10, 1000, 1, 1000))
            .backend(backend.clone())
            .lookup(registry.clone())
            .open()
            .unwrap();

        store.put(&Entry::reference(id.clone(), EntryKind::Update, 1, &body)).unwrap();
        store.put(&make_entry(&id, 2, 10, false)).unwrap();

        backend.disconnect();
        backend.reconnect();
        assert_eq!(body.reference_count(), 0);
        assert_eq!(store.metrics().purged_on_reconnect, 1);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config_tests {
    use super::*;
    use brokerstore::store::{OverflowPolicy, StoreRole, StoreSettings};

    const SETTINGS: &str = r#"
defaults:
  max_bytes: 4194304
roles:
  history:
    max_entries: 50
    max_entries_cache: 20
stores:
  "callback:client9":
    max_entries: 3
    max_entries_cache: 5
    on_overflow: discardOldest
"#;

    #[test]
    fn test_role_defaults() {
        let settings = StoreSettings::default();
        let history = settings
            .resolve_for(&StorageId::new("history", "news"))
            .unwrap();
        assert_eq!(history.max_entries, 10);
        assert_eq!(history.max_entries_cache, 10);

        let callback = settings.resolve_for(&storage("any")).unwrap();
        assert_eq!(callback, StoreConfig::default());
    }

    #[test]
    fn test_settings_precedence() {
        let settings = StoreSettings::from_yaml_str(SETTINGS).unwrap();

        let history = settings
            .resolve(StoreRole::History, &StorageId::new("history", "news"))
            .unwrap();
        assert_eq!(history.max_entries, 50);
        assert_eq!(history.max_entries_cache, 20);
        assert_eq!(history.max_bytes, 4_194_304);

        // Per-store override, with the cache clamped to the store and the
        // unsupported overflow policy replaced
        let client = settings.resolve_for(&storage("client9")).unwrap();
        assert_eq!(client.max_entries, 3);
        assert_eq!(client.max_entries_cache, 3);
        assert_eq!(client.on_overflow, OverflowPolicy::DeadMessage);
    }

    #[test]
    fn test_resolved_config_drives_store() {
        let settings = StoreSettings::from_yaml_str(SETTINGS).unwrap();
        let id = storage("client9");
        let config = settings.resolve_for(&id).unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let store = open_store(id.clone(), config, &backend);

        for i in 1..=3 {
            store.put(&make_entry(&id, i, 10, false)).unwrap();
        }
        assert_matches!(
            store.put(&make_entry(&id, 4, 10, false)),
            Err(Error::ResourceOverflow { max_entries: 3, .. })
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert_matches!(
            StoreSettings::from_yaml_str("defaults:\n  max_entrie: 3\n"),
            Err(Error::Serialization(_))
        );
        assert_matches!(
            StoreConfig::new(0, 10, 1, 1).validate(),
            Err(Error::Configuration(_))
        );
        assert_matches!("queue".parse::<StoreRole>(), Err(Error::Configuration(_)));
    }
}

// =============================================================================
// Observability
// =============================================================================

mod metrics_tests {
    use super::*;
    use brokerstore::store::PrometheusExporter;

    #[test]
    fn test_metrics_snapshot_tracks_activity() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("metrics");
        let store = open_store(id.clone(), StoreConfig::new(3, 1000, 1, 1000), &backend);

        store.put(&make_entry(&id, 1, 10, false)).unwrap();
        store.put(&make_entry(&id, 2, 10, false)).unwrap();
        store.get(2);
        store.get(1);
        store.get(99);

        let snapshot = store.metrics();
        assert_eq!(snapshot.swap_outs, 1);
        assert_eq!(snapshot.swap_ins, 1);
        assert_eq!(snapshot.transient_hits, 1);
        assert_eq!(snapshot.persistent_hits, 1);
        assert_eq!(snapshot.misses, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["swap_outs"], 1);
    }

    #[test]
    fn test_prometheus_export() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("exported");
        let store = open_store(id.clone(), StoreConfig::default(), &backend);
        store.put(&make_entry(&id, 1, 10, true)).unwrap();

        let exporter = PrometheusExporter::new().unwrap();
        let usage = store.usage();
        exporter.observe(&id, &store.metrics(), &usage.tiers());
        let text = exporter.render().unwrap();

        assert!(text.contains("brokerstore_entries"));
        assert!(text.contains("storage_id=\"callback:exported\""));
        assert!(text.contains("tier=\"persistent\""));
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_access_with_outages() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = storage("busy");
        let store = open_store(id.clone(), StoreConfig::new(10_000, u64::MAX, 16, u64::MAX), &backend);

        let workers: Vec<_> = (0..4i64)
            .map(|t| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        let entry = make_entry(&id, t * 10_000 + i, 8, i % 4 == 0);
                        let _ = store.put(&entry);
                        store.get(t * 10_000 + i / 2);
                        if i % 5 == 0 {
                            store.remove(&entry);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..5 {
            backend.disconnect();
            thread::yield_now();
            backend.reconnect();
        }
        for worker in workers {
            worker.join().unwrap();
        }

        backend.reconnect();
        assert_accounting(&store);
    }
}
