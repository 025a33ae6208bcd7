//! mstore demo
//!
//! Wires a managed store to two in-memory backends from a configuration file
//! and walks through the record, version, relationship and policy APIs.

use anyhow::{Context, Result};
use clap::Parser;
use mstore_common::{StorageConfig, SyncStrategy, Value, fields};
use mstore_engine::{
    Callback, ChangeBuffer, ChangeEvent, EVENT_DATA_CHANGED, KeyValueAdapter, ManagedStorage, MemoryBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "mstore-demo")]
#[command(about = "mstore managed storage demo")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML); MSTORE__* environment variables override it
    #[arg(short, long, env = "MSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Sync strategy override (write_through, write_back, read_through, read_ahead)
    #[arg(short, long)]
    strategy: Option<SyncStrategy>,

    /// Number of records to write
    #[arg(short, long, default_value = "5")]
    records: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = StorageConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(strategy) = args.strategy {
        config = config.with_sync_strategy(strategy);
    }
    info!(
        "Starting mstore demo: strategy={}, cache={} records",
        config.sync_strategy, config.max_memory_items
    );

    let storage = Arc::new(ManagedStorage::new(config));
    let primary = Arc::new(MemoryBackend::new("primary"));
    let mirror = Arc::new(MemoryBackend::new("mirror"));
    storage.add_backend("primary", primary.clone(), true);
    storage.add_backend("mirror", mirror.clone(), false);

    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    storage.add_change_callback(Callback::from_fn(move |_: &ChangeEvent| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));
    storage.add_change_callback(Callback::from_async(|event: ChangeEvent| async move {
        info!("{}.{} changed to {}", event.key, event.field, event.new_value);
        Ok(())
    }));

    run_records(&storage, args.records).await?;
    run_satellites(&storage).await;
    run_adapter(&storage).await;
    run_buffered(&storage).await;

    let report = storage.flush_to_backends().await;
    info!(
        "Flush: {} synced, {} failed; primary holds {} records, mirror {}",
        report.synced.len(),
        report.failed.len(),
        primary.len(),
        mirror.len()
    );

    let health = storage.check_health().await;
    info!("Health: {}", health.status);
    info!("{} change notifications delivered", changes.load(Ordering::Relaxed));

    let stats = serde_json::to_string_pretty(&storage.statistics()).context("failed to encode statistics")?;
    println!("{stats}");

    storage.cleanup().await;
    info!("mstore demo finished");
    Ok(())
}

async fn run_records(storage: &ManagedStorage, count: usize) -> Result<()> {
    for i in 0..count {
        let id = format!("task/{i}");
        let report = storage
            .store_fields(&id, &fields! { "title" => format!("Task {i}"), "status" => "ready" }, Some("demo"))
            .await;
        if !report.is_complete() {
            warn!("Write of {id} missed backends {:?}", report.failed_backends);
        }
    }

    storage
        .update_fields("task/0", &fields! { "status" => "busy", "owner" => "alice" }, Some("alice"))
        .await;

    match storage
        .atomic_update(
            "task/0",
            &fields! { "status" => "done" },
            Some(&fields! { "status" => "ready" }),
            Some("bob"),
        )
        .await
    {
        Ok(_) => warn!("Conditional update unexpectedly applied"),
        Err(e) => info!("Conditional update rejected: {e}"),
    }

    storage
        .atomic_update(
            "task/0",
            &fields! { "status" => "done" },
            Some(&fields! { "status" => "busy" }),
            Some("alice"),
        )
        .await
        .context("conditional update of task/0")?;

    let task = storage.load_fields("task/0", Some(&["status", "owner"])).await;
    info!("task/0 is now {task:?}");
    Ok(())
}

async fn run_satellites(storage: &ManagedStorage) {
    for status in ["draft", "review", "final"] {
        storage
            .store_version("doc/1", Value::from(fields! { "status" => status }), None, None)
            .await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for version in storage.list_versions("doc/1", 5).await {
        info!("doc/1 version {} at {}", version.version_id, version.datetime);
    }

    storage.add_relationship("project/1", "task/0", "contains");
    storage.add_relationship("project/1", "task/1", "contains");
    storage.add_relationship("alice", "task/0", "owns");
    info!(
        "task/0 relationships: {:?}",
        storage.get_all_relationships("task/0")
    );

    storage.cache_policy_decision("alice", "write", "task/0", true, "owner", Some(Duration::from_secs(60)));
    if let Some(decision) = storage.get_cached_policy_decision("alice", "write", "task/0") {
        info!("Cached decision for alice: allowed={} ({})", decision.decision, decision.reason);
    }

    for entry in storage.get_audit_log("task/0", 5, None) {
        info!(
            "audit task/0: {} {:?} by {:?}",
            entry.action, entry.field, entry.identity_id
        );
    }
}

async fn run_adapter(storage: &Arc<ManagedStorage>) {
    let adapter = KeyValueAdapter::new(Arc::clone(storage));
    adapter.on_event(
        EVENT_DATA_CHANGED,
        Callback::from_fn(|args: &Vec<Value>| {
            info!("data_changed: {args:?}");
            Ok(())
        }),
    );
    adapter.store_data("settings", &fields! { "theme" => "dark" }).await;
    adapter.store_data("settings", &fields! { "theme" => "light" }).await;
    info!("Adapter keys: {:?}", adapter.list_keys(""));
}

async fn run_buffered(storage: &ManagedStorage) {
    let buffer = ChangeBuffer::from_config(Arc::clone(storage.notifier()), &storage.config().notifications);
    buffer.add_batch_callback(Callback::from_fn(|batch: &Vec<ChangeEvent>| {
        info!("Buffered batch of {} changes", batch.len());
        Ok(())
    }));
    for step in 0..3 {
        buffer
            .add_change("job/1", "progress", None, Value::from(step * 50), Some("worker"))
            .await;
    }
    let stats = buffer.stats();
    info!(
        "{} changes buffered for up to {:?}",
        stats.buffered_changes, stats.buffer_time
    );
    buffer.cleanup().await;
}
