//! Scheduled backup example: a fast schedule, a corrupted artifact and a restore

use anyhow::Context;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tablevault::artifact::MemoryArtifactStore;
use tablevault::codec::EncryptionKey;
use tablevault::config::{EngineConfig, StaticKeyProvider};
use tablevault::engine::BackupEngine;
use tablevault::metrics;
use tablevault::policy::{BackupKind, BackupPolicy};
use tablevault::table::{MemoryTableStore, Row};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tablevault::init_tracing();
    println!("tablevault - Scheduled Backup Example\n");

    // Step 1: Seed a data store
    let tables = Arc::new(MemoryTableStore::new("id"));
    for (table, count) in [("users", 3), ("orders", 12)] {
        let rows = (1..=count).map(|id| {
            let mut row = Row::new();
            row.insert("id".into(), json!(id));
            row.insert("label".into(), json!(format!("{}-{}", table, id)));
            row
        });
        tables.upsert_rows(table, rows)?;
    }

    // Step 2: Build the engine with one scheduled and one manual policy
    let artifacts = MemoryArtifactStore::new();
    let config = EngineConfig::default()
        .with_policy(
            BackupPolicy::new("frequent", "Every second", BackupKind::Full, ["users", "orders"])
                .with_schedule("every 1s")
                .with_compression(true)
                .with_encryption(true)
                .with_retention_days(0),
        )
        .with_policy(
            BackupPolicy::new("manual", "Manual users", BackupKind::Incremental, ["users"])
                .with_enabled(false),
        );

    let engine = BackupEngine::builder(config)
        .table_store(tables.clone())
        .artifact_store(Arc::new(artifacts.clone()))
        .key_provider(Arc::new(StaticKeyProvider::new(EncryptionKey::generate())))
        .build()
        .await
        .context("building engine")?;

    for (policy_id, warning) in engine.start() {
        println!("schedule warning for {}: {}", policy_id, warning);
    }

    // Step 3: Let the scheduler run a few times
    tokio::time::sleep(Duration::from_millis(3500)).await;
    engine.shutdown();

    let runs = engine.list_backup_runs(Some("frequent"));
    println!("Scheduled runs kept after retention: {}", runs.len());
    let latest = runs.first().context("no scheduled run completed")?;
    println!(
        "  latest: {} ({}, {} bytes, ratio {:.2})",
        latest.id,
        latest.status,
        latest.size_bytes,
        latest.metadata.compression_ratio.unwrap_or(1.0)
    );

    // Step 4: A manual override on a disabled incremental policy degrades to full
    let manual = engine.trigger_backup_with_override("manual").await?;
    println!(
        "\nManual run {}: requested {}, ran {} (degraded: {})",
        manual.id, manual.metadata.requested_kind, manual.metadata.kind, manual.metadata.degraded_to_full
    );

    // Step 5: Corrupt the artifact and watch the restore refuse it
    let artifact = manual.artifact_ref.clone().context("manual run has no artifact")?;
    artifacts.tamper(&artifact, |data| {
        data.pop();
    });
    println!("\nIntegrity after truncation: {}", engine.verify_integrity(&manual.id).await?);
    let refused = engine.trigger_restore(&manual.id, None).await?;
    println!(
        "Restore from corrupted artifact: {} ({}: {})",
        refused.status,
        refused.error.unwrap_or_default(),
        refused.error_detail.unwrap_or_default()
    );

    // Step 6: Restore the scheduled snapshot instead
    tables.truncate("users");
    tables.truncate("orders");
    let restore = engine.trigger_restore(&latest.id, None).await?;
    println!("\nRestore from {}: {}", latest.id, restore.status);
    for (table, rows) in &restore.rows_restored_by_table {
        println!("  {}: {} rows", table, rows);
    }

    let stats = engine.get_statistics();
    println!(
        "\nStatistics: {} runs, {} succeeded, {} failed, {} bytes",
        stats.total_runs, stats.success_count, stats.failure_count, stats.total_bytes
    );

    println!("\nMetrics:\n{}", metrics::gather_text());
    Ok(())
}
