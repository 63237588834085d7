// ABOUTME: Entry point for the fleetd binary.
// ABOUTME: Loads configuration, initializes tracing, builds the registry and recovery engine, and runs a subcommand.

mod bridge;
mod cli;
mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleetd_core::{DeviceFilter, DeviceRecord, DeviceTypeCatalog};
use fleetd_recovery::{HealthEngine, HealthEvent};
use fleetd_registry::{DeviceRegistry, NewDevice, RegistryError};
use fleetd_store::{FileBackend, JsonlAuditLog, PersistenceManager};

use crate::bridge::{TracingDispatcher, TracingHandle, run_bridge};
use crate::cli::{Cli, Commands};
use crate::config::FleetConfig;

const DEFAULT_LOG_FILTER: &str =
    "fleetd=info,fleetd_store=info,fleetd_registry=info,fleetd_recovery=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::from_env()?;
    tracing::debug!("fleetd starting with data dir {}", config.data_dir().display());

    run(cli.command, &config).await
}

async fn run(command: Commands, config: &FleetConfig) -> anyhow::Result<()> {
    match command {
        Commands::List {
            device_type,
            mode,
            features,
            json,
        } => {
            let registry = open_registry(config)?;
            let mut filter = DeviceFilter::new();
            if let Some(device_type) = device_type {
                filter = filter.device_type(device_type);
            }
            if let Some(mode) = mode {
                filter = filter.mode(mode);
            }
            for feature in features {
                filter = filter.feature(feature);
            }

            let devices = registry.list_devices(&filter);
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                for record in &devices {
                    println!("{}", format_record(record));
                }
            }
        }
        Commands::Add { id, device_type } => {
            let mut registry = open_registry(config)?;
            let record = registry
                .add_device(NewDevice::new(id, device_type))
                .map_err(explain)?;
            println!("{}", format_record(&record));
        }
        Commands::Delete { id } => {
            let mut registry = open_registry(config)?;
            registry.delete_device(&id).map_err(explain)?;
            match registry.default_device() {
                Some(record) => println!("deleted {}; default is {}", id, record.id),
                None => println!("deleted {}; registry is empty", id),
            }
        }
        Commands::Promote { id } => {
            let mut registry = open_registry(config)?;
            let record = registry.promote_device(&id).map_err(explain)?;
            println!("{}", format_record(&record));
        }
        Commands::Mode { mode } => {
            let mut registry = open_registry(config)?;
            if let Some(mode) = mode {
                registry.set_mode(mode).map_err(explain)?;
            }
            println!("{}", registry.mode());
        }
        Commands::Features { device_type } => {
            let registry = open_registry(config)?;
            let features = registry
                .get_available_features(&device_type)
                .map_err(explain)?;
            for feature in features {
                let marker = if feature.experimental { " (experimental)" } else { "" };
                println!("{}{}", feature.name, marker);
            }
        }
        Commands::Pricing { device_type } => {
            let registry = open_registry(config)?;
            let pricing = registry.get_pricing(&device_type).map_err(explain)?;
            println!("{}", serde_json::to_string_pretty(&pricing)?);
        }
        Commands::Audit { repair } => {
            let path = config.audit_log_path();
            if !path.exists() {
                println!("no audit log at {}", path.display());
                return Ok(());
            }
            if repair {
                let kept = JsonlAuditLog::repair(&path)?;
                tracing::info!("audit log repaired, {} entries kept", kept);
            }
            for entry in JsonlAuditLog::replay(&path)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        Commands::Watch => watch(config).await?,
    }
    Ok(())
}

/// Build the registry from config: YAML device types, file-backed snapshot,
/// and the JSONL audit log, all under the data directory.
fn open_registry(config: &FleetConfig) -> anyhow::Result<DeviceRegistry> {
    let catalog = DeviceTypeCatalog::load(&config.device_types_path).with_context(|| {
        format!(
            "loading device types from {}",
            config.device_types_path.display()
        )
    })?;
    let backend = FileBackend::new(config.data_dir())
        .with_context(|| format!("opening data dir {}", config.data_dir().display()))?;
    let audit = JsonlAuditLog::open(&config.audit_log_path())?;

    let registry = DeviceRegistry::open(
        PersistenceManager::new(Arc::new(backend)),
        Arc::new(catalog),
        Arc::new(audit),
        config.mode,
    )?;
    Ok(registry)
}

async fn watch(config: &FleetConfig) -> anyhow::Result<()> {
    let registry = open_registry(config)?;
    let audit = Arc::new(JsonlAuditLog::open(&config.audit_log_path())?);
    let engine = HealthEngine::new(config.recovery.clone(), Arc::new(TracingDispatcher), audit);

    for record in registry.list_devices(&DeviceFilter::new()) {
        engine
            .register_device(record.id.clone(), Arc::new(TracingHandle::new(record.id)))
            .await;
    }

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("event printer lagged, {} events dropped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stats = run_bridge(&engine, stdin).await?;
    tracing::info!(
        "input closed: {} reports applied, {} skipped",
        stats.applied,
        stats.skipped
    );

    engine.shutdown().await;
    printer.abort();
    Ok(())
}

fn print_event(event: &HealthEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("could not serialize event for {}: {}", event.device_id(), e),
    }
}

fn format_record(record: &DeviceRecord) -> String {
    let marker = if record.is_default { "*" } else { " " };
    let features: Vec<&str> = record.features.iter().map(|f| f.name.as_str()).collect();
    format!(
        "{} {}\t{}\t{}\t{:.2} {}\t[{}]",
        marker,
        record.id,
        record.device_type,
        record.mode,
        record.pricing.base_rate,
        record.pricing.currency,
        features.join(", ")
    )
}

/// Attach a retry hint to storage failures; the other kinds are final.
fn explain(err: RegistryError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow::Error::new(err).context("storage unavailable, the operation can be retried")
    } else {
        err.into()
    }
}
