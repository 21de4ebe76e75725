//! Store Metrics Collection
//!
//! Lock-free counters for the tiered store's hit, swap and connection
//! activity, plus a Prometheus exporter that publishes them per storage id.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;

use super::entry::StorageId;
use super::map::TierUsage;
use crate::error::Result;

/// Store metrics collector
#[derive(Debug, Default)]
pub struct StoreMetrics {
    // Lookups
    transient_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,

    // Tier movement
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,

    // Rejections and swallowed failures
    overflows: AtomicU64,
    persistence_failures: AtomicU64,

    // Connection
    disconnects: AtomicU64,
    reconnects: AtomicU64,
    purged_on_reconnect: AtomicU64,
}

impl StoreMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transient_hit(&self) {
        self.transient_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Non-durable entry written to the persistent tier for lack of cache space
    pub fn record_swap_out(&self) {
        self.swap_outs.fetch_add(1, Ordering::Relaxed);
    }

    /// Persistent entry promoted back into the transient tier
    pub fn record_swap_in(&self) {
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Persistent write failed and was downgraded to transient-only
    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Reconnect that purged `purged` swapped entries
    pub fn record_reconnect(&self, purged: u64) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.purged_on_reconnect.fetch_add(purged, Ordering::Relaxed);
    }

    pub fn transient_hits(&self) -> u64 {
        self.transient_hits.load(Ordering::Relaxed)
    }

    pub fn persistent_hits(&self) -> u64 {
        self.persistent_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hits from either tier over all lookups
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.transient_hits() + self.persistent_hits();
        let total = hits + self.misses();

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transient_hits: self.transient_hits(),
            persistent_hits: self.persistent_hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            purged_on_reconnect: self.purged_on_reconnect.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.transient_hits.store(0, Ordering::Relaxed);
        self.persistent_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.swap_outs.store(0, Ordering::Relaxed);
        self.swap_ins.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
        self.persistence_failures.store(0, Ordering::Relaxed);
        self.disconnects.store(0, Ordering::Relaxed);
        self.reconnects.store(0, Ordering::Relaxed);
        self.purged_on_reconnect.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of all store metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    // Lookups
    pub transient_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,

    // Tier movement
    pub swap_outs: u64,
    pub swap_ins: u64,

    // Rejections
    pub overflows: u64,
    pub persistence_failures: u64,

    // Connection
    pub disconnects: u64,
    pub reconnects: u64,
    pub purged_on_reconnect: u64,
}

impl MetricsSnapshot {
    /// Counter values keyed by their `event` label
    pub fn events(&self) -> [(&'static str, u64); 10] {
        [
            ("transient_hit", self.transient_hits),
            ("persistent_hit", self.persistent_hits),
            ("miss", self.misses),
            ("swap_out", self.swap_outs),
            ("swap_in", self.swap_ins),
            ("overflow", self.overflows),
            ("persistence_failure", self.persistence_failures),
            ("disconnect", self.disconnects),
            ("reconnect", self.reconnects),
            ("purged_on_reconnect", self.purged_on_reconnect),
        ]
    }
}

// =============================================================================
// Prometheus Export
// =============================================================================

/// Publishes store snapshots into a Prometheus registry
pub struct PrometheusExporter {
    registry: Registry,
    events: IntCounterVec,
    entries: IntGaugeVec,
    bytes: IntGaugeVec,
    durable_entries: IntGaugeVec,
}

impl PrometheusExporter {
    /// Create an exporter with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create an exporter registering into `registry`
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let events = IntCounterVec::new(
            Opts::new("brokerstore_events_total", "Store events by kind"),
            &["storage_id", "event"],
        )?;
        let entries = IntGaugeVec::new(
            Opts::new("brokerstore_entries", "Entries held per tier"),
            &["storage_id", "tier"],
        )?;
        let bytes = IntGaugeVec::new(
            Opts::new("brokerstore_bytes", "Bytes held per tier"),
            &["storage_id", "tier"],
        )?;
        let durable_entries = IntGaugeVec::new(
            Opts::new("brokerstore_durable_entries", "Durable entries held per tier"),
            &["storage_id", "tier"],
        )?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(entries.clone()))?;
        registry.register(Box::new(bytes.clone()))?;
        registry.register(Box::new(durable_entries.clone()))?;

        Ok(Self {
            registry,
            events,
            entries,
            bytes,
            durable_entries,
        })
    }

    /// Publish one store's counters and per-tier usage
    pub fn observe(&self, storage_id: &StorageId, snapshot: &MetricsSnapshot, tiers: &[(&str, TierUsage)]) {
        let storage = storage_id.to_string();

        for (event, value) in snapshot.events() {
            let counter = self.events.with_label_values(&[storage.as_str(), event]);
            counter.reset();
            counter.inc_by(value);
        }

        for (tier, usage) in tiers {
            let labels = [storage.as_str(), *tier];
            self.entries.with_label_values(&labels).set(gauge(usage.entries));
            self.bytes.with_label_values(&labels).set(gauge(usage.bytes));
            self.durable_entries
                .with_label_values(&labels)
                .set(gauge(usage.durable_entries));
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything observed so far
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn gauge(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = StoreMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert_eq!(metrics.hit_ratio(), 0.0);
    }

    #[test]
    fn test_hit_tracking() {
        let metrics = StoreMetrics::new();
        metrics.record_transient_hit();
        metrics.record_transient_hit();
        metrics.record_persistent_hit();
        metrics.record_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transient_hits, 2);
        assert_eq!(snapshot.persistent_hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert!((snapshot.hit_ratio - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_connection_tracking() {
        let metrics = StoreMetrics::new();
        metrics.record_disconnect();
        metrics.record_reconnect(3);
        metrics.record_reconnect(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.disconnects, 1);
        assert_eq!(snapshot.reconnects, 2);
        assert_eq!(snapshot.purged_on_reconnect, 3);

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = StoreMetrics::new();
        metrics.record_swap_out();
        metrics.record_swap_out();
        metrics.record_overflow();

        let exporter = PrometheusExporter::new().unwrap();
        let storage = StorageId::new("callback", "client7");
        let usage = TierUsage {
            entries: 4,
            bytes: 400,
            durable_entries: 1,
            durable_bytes: 100,
        };
        exporter.observe(&storage, &metrics.snapshot(), &[("transient", usage)]);
        // Observing again replaces rather than accumulates
        exporter.observe(&storage, &metrics.snapshot(), &[("transient", usage)]);

        let text = exporter.render().unwrap();
        assert!(text.contains(
            "brokerstore_events_total{event=\"swap_out\",storage_id=\"callback:client7\"} 2"
        ));
        assert!(text.contains("brokerstore_entries{storage_id=\"callback:client7\",tier=\"transient\"} 4"));
        assert!(text.contains("brokerstore_bytes{storage_id=\"callback:client7\",tier=\"transient\"} 400"));
    }

    #[test]
    fn test_prometheus_duplicate_registration_fails() {
        let registry = Registry::new();
        let _first = PrometheusExporter::with_registry(registry.clone()).unwrap();
        assert!(PrometheusExporter::with_registry(registry).is_err());
    }
}
