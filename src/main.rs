//! brokerstore - Tiered Broker Store Tool
//!
//! Inspect how store settings resolve and exercise a tiered store against the
//! in-memory persistence backend.
//!
//! ```text
//! brokerstore resolve  --settings stores.yaml --storage-id history:news
//! brokerstore simulate --storage-id callback:client7 --entries 500 --disconnect-at 200
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use brokerstore::store::{
    next_unique_id, BodyQos, BodyRegistry, Entry, EntryKind, InMemoryBackend, PrometheusExporter,
    SharedBody, StorageId, StoreMap, StoreRole, StoreSettings, TieredCacheStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Tiered broker store - resolve settings and simulate workloads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved configuration of one store as JSON
    Resolve {
        /// Settings file (YAML, or JSON by extension)
        #[arg(long, env = "BROKERSTORE_SETTINGS")]
        settings: Option<PathBuf>,

        /// Store role (default: derived from the storage id prefix)
        #[arg(long)]
        role: Option<StoreRole>,

        /// Storage id, e.g. history:news
        #[arg(long)]
        storage_id: StorageId,
    },

    /// Drive a synthetic workload against an in-memory persistent tier
    Simulate {
        /// Settings file (YAML, or JSON by extension)
        #[arg(long, env = "BROKERSTORE_SETTINGS")]
        settings: Option<PathBuf>,

        /// Storage id of the simulated store
        #[arg(long, default_value = "callback:simulated")]
        storage_id: StorageId,

        /// Number of entries to put
        #[arg(long, default_value = "100")]
        entries: usize,

        /// Payload size of inline entries in bytes
        #[arg(long, default_value = "256")]
        entry_size: usize,

        /// Every n-th entry is durable (0 = none)
        #[arg(long, default_value = "3")]
        durable_every: usize,

        /// Every n-th entry references a shared body (0 = none)
        #[arg(long, default_value = "5")]
        reference_every: usize,

        /// Drop the backend connection before this put
        #[arg(long)]
        disconnect_at: Option<usize>,

        /// Number of puts the outage lasts
        #[arg(long, default_value = "10")]
        outage: usize,

        /// Print Prometheus text exposition after the run
        #[arg(long)]
        prometheus: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match args.command {
        Command::Resolve {
            settings,
            role,
            storage_id,
        } => resolve(settings, role, storage_id),
        Command::Simulate {
            settings,
            storage_id,
            entries,
            entry_size,
            durable_every,
            reference_every,
            disconnect_at,
            outage,
            prometheus,
        } => simulate(SimulateOptions {
            settings,
            storage_id,
            entries,
            entry_size,
            durable_every,
            reference_every,
            disconnect_at,
            outage,
            prometheus,
        }),
    }
}

fn load_settings(path: Option<PathBuf>) -> anyhow::Result<StoreSettings> {
    match path {
        Some(path) => StoreSettings::load(&path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(StoreSettings::default()),
    }
}

// =============================================================================
// Resolve
// =============================================================================

fn resolve(settings: Option<PathBuf>, role: Option<StoreRole>, storage_id: StorageId) -> anyhow::Result<()> {
    let settings = load_settings(settings)?;
    let role = match role {
        Some(role) => role,
        None => StoreRole::of(&storage_id)?,
    };
    let config = settings.resolve(role, &storage_id)?;

    info!(storage = %storage_id, %role, "resolved store configuration");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

struct SimulateOptions {
    settings: Option<PathBuf>,
    storage_id: StorageId,
    entries: usize,
    entry_size: usize,
    durable_every: usize,
    reference_every: usize,
    disconnect_at: Option<usize>,
    outage: usize,
    prometheus: bool,
}

fn every(n: usize, i: usize) -> bool {
    n != 0 && i % n == 0
}

fn simulate(opts: SimulateOptions) -> anyhow::Result<()> {
    let settings = load_settings(opts.settings)?;
    let config = settings.resolve_for(&opts.storage_id)?;

    let backend = Arc::new(InMemoryBackend::new());
    let registry = Arc::new(BodyRegistry::new());
    let store = TieredCacheStore::builder(opts.storage_id.clone())
        .config(config)
        .backend(backend.clone())
        .lookup(registry.clone())
        .open()?;

    let body = SharedBody::new(
        "simulated",
        next_unique_id(),
        "<key oid='simulated'/>",
        Bytes::from(vec![b'b'; opts.entry_size]),
        BodyQos::default(),
    );
    registry.publish(body.clone());

    info!(
        storage = %opts.storage_id,
        entries = opts.entries,
        "starting simulation"
    );

    let mut stored = Vec::with_capacity(opts.entries);
    let mut rejected = 0usize;
    for i in 0..opts.entries {
        if opts.disconnect_at == Some(i) {
            backend.disconnect();
        }
        if opts.disconnect_at.map(|at| at + opts.outage) == Some(i) {
            backend.reconnect();
        }

        let unique_id = next_unique_id();
        let entry = if every(opts.reference_every, i) {
            Entry::reference(opts.storage_id.clone(), EntryKind::Update, unique_id, &body)
        } else {
            Entry::inline(
                opts.storage_id.clone(),
                EntryKind::Update,
                unique_id,
                Bytes::from(vec![b'x'; opts.entry_size]),
            )
            .durable(every(opts.durable_every, i))
        };

        match store.put(&entry) {
            Ok(_) => stored.push(entry),
            Err(err) => {
                rejected += 1;
                warn!(entry = unique_id, error = %err, "put rejected");
            }
        }
    }
    backend.reconnect();

    let found = stored
        .iter()
        .filter(|entry| store.get(entry.unique_id()).is_some())
        .count();
    let removed: u32 = stored
        .iter()
        .step_by(4)
        .map(|entry| store.remove(entry))
        .sum();

    let usage = store.usage();
    println!("{}", usage);
    println!(
        "stored {} rejected {} found {} removed {} body references {}",
        stored.len(),
        rejected,
        found,
        removed,
        body.reference_count()
    );

    if opts.prometheus {
        let exporter = PrometheusExporter::new()?;
        exporter.observe(&opts.storage_id, &store.metrics(), &usage.tiers());
        print!("{}", exporter.render()?);
    } else {
        println!("{}", serde_json::to_string_pretty(&store.metrics())?);
    }
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
