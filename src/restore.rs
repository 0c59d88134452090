//! Restore pipeline
//!
//! One restore run: fetch the artifact of a successful backup, verify its
//! checksum, decrypt and decompress it, then import the selected tables one
//! at a time. Nothing is decoded or imported from an artifact whose checksum
//! does not match.
//!
//! Import is not transactional across tables. When a table fails, the tables
//! imported before it stay imported and are listed in `tables_restored`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::artifact::ArtifactStore;
use crate::codec::IntegrityCodec;
use crate::config::KeyProvider;
use crate::engine::EngineContext;
use crate::ledger::{BackupRun, RestoreOutcome, RestoreRun, RunStatus};
use crate::metrics::{self, Timer};
use crate::snapshot::Snapshot;
use crate::table::TableStore;
use crate::{EngineError, Result};

/// Outcome of re-checking a stored artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub backup_run_id: String,
    pub artifact_ref: String,
    pub expected_checksum: String,
    /// Checksum of the fetched bytes; `None` when the artifact is missing
    pub actual_checksum: Option<String>,
    pub expected_size: u64,
    pub actual_size: Option<u64>,
    pub valid: bool,
}

#[derive(Default)]
struct Progress {
    tables_restored: Vec<String>,
    rows_restored_by_table: BTreeMap<String, u64>,
}

/// Executes restore runs and integrity checks
#[derive(Clone)]
pub struct RestoreOrchestrator {
    ctx: Arc<EngineContext>,
}

impl RestoreOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Restore `tables` (or every table in the artifact) from a backup run
    ///
    /// Only lookup failures are returned as errors. Once the restore run
    /// exists, failures are recorded on it and it is returned with status
    /// `Failed`.
    #[instrument(skip(self))]
    pub async fn run_restore(
        &self,
        backup_run_id: &str,
        tables: Option<Vec<String>>,
    ) -> Result<RestoreRun> {
        let backup = self.restorable(backup_run_id)?;

        let restore = self.ctx.ledger.begin_restore(&backup.id, tables.clone());
        // Must precede the first await: the run is already visible as InProgress.
        let mut cancel = self.ctx.cancellations.register(&restore.id);
        self.ctx.persist_ledger().await;
        info!(restore_id = %restore.id, backup_run_id = %backup.id, "Restore run started");
        let _active = metrics::track_active_run();
        let timer = Timer::start();

        let progress = Arc::new(Mutex::new(Progress::default()));
        let timeout = self.ctx.run_timeout;

        let result = tokio::select! {
            result = self.execute(&backup, tables, progress.clone()) => result,
            _ = tokio::time::sleep(timeout) => Err(EngineError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        };
        let cancelled = self.ctx.cancellations.close(&restore.id);
        let result = match result {
            Ok(()) if cancelled => Err(EngineError::Cancelled),
            other => other,
        };

        let progress = std::mem::take(&mut *progress.lock());
        let failure = result.as_ref().err().map(|e| (e.kind(), e.to_string()));
        let finalized = self.ctx.ledger.finalize_restore(
            &restore.id,
            RestoreOutcome {
                tables_restored: progress.tables_restored,
                rows_restored_by_table: progress.rows_restored_by_table,
                failure,
            },
        );
        self.ctx.cancellations.release(&restore.id);
        let finalized = finalized?;
        self.ctx.persist_ledger().await;
        metrics::record_restore(finalized.status.label(), timer.elapsed_secs());

        match result {
            Ok(()) => info!(
                restore_id = %finalized.id,
                tables = finalized.tables_restored.len(),
                duration_secs = timer.elapsed_secs(),
                "Restore run succeeded"
            ),
            Err(e) => error!(
                restore_id = %finalized.id,
                kind = %e.kind(),
                error = %e,
                tables_restored = ?finalized.tables_restored,
                "Restore run failed"
            ),
        }
        Ok(finalized)
    }

    /// Re-fetch and re-checksum an artifact without restoring it
    pub async fn verify(&self, backup_run_id: &str) -> Result<VerifyReport> {
        let backup = self.restorable(backup_run_id)?;
        let (artifact_ref, expected) = artifact_of(&backup)?;

        let fetched = match self.fetch(&artifact_ref).await {
            Ok(data) => Some(data),
            Err(EngineError::Store(e)) if !e.is_transient() => None,
            Err(e) => return Err(e),
        };

        let actual_checksum = fetched.as_ref().map(|data| self.ctx.codec.checksum(data));
        let valid = actual_checksum.as_deref() == Some(expected.as_str());
        if !valid {
            info!(backup_run_id, artifact = %artifact_ref, "Artifact failed verification");
        }

        Ok(VerifyReport {
            backup_run_id: backup.id.clone(),
            artifact_ref,
            expected_checksum: expected,
            actual_checksum,
            expected_size: backup.size_bytes,
            actual_size: fetched.map(|data| data.len() as u64),
            valid,
        })
    }

    fn restorable(&self, backup_run_id: &str) -> Result<BackupRun> {
        let backup = self
            .ctx
            .ledger
            .get_backup(backup_run_id)
            .ok_or_else(|| EngineError::BackupNotFound(backup_run_id.to_string()))?;
        if backup.status != RunStatus::Success {
            return Err(EngineError::BackupNotRestorable {
                run_id: backup.id,
                status: backup.status,
            });
        }
        Ok(backup)
    }

    async fn fetch(&self, artifact_ref: &str) -> Result<bytes::Bytes> {
        let artifacts = self.ctx.artifacts.clone();
        self.ctx
            .retry
            .execute("fetch_artifact", || {
                let artifacts = artifacts.clone();
                async move { Ok(artifacts.get(artifact_ref).await?) }
            })
            .await
    }

    async fn execute(
        &self,
        backup: &BackupRun,
        tables: Option<Vec<String>>,
        progress: Arc<Mutex<Progress>>,
    ) -> Result<()> {
        let (artifact_ref, expected) = artifact_of(backup)?;
        let data = self.fetch(&artifact_ref).await?;

        let actual = self.ctx.codec.checksum(&data);
        if actual != expected {
            return Err(EngineError::IntegrityCheckFailed {
                artifact: artifact_ref,
                expected,
                actual,
            });
        }
        debug!(artifact = %artifact_ref, "Checksum verified");

        let key = if backup.metadata.encrypted {
            Some(self.ctx.keys.encryption_key()?)
        } else {
            None
        };
        let compressed = backup.metadata.compressed;
        let codec = self.ctx.codec.clone();

        let snapshot = tokio::task::spawn_blocking(move || -> Result<Snapshot> {
            let mut payload = data.to_vec();
            if let Some(key) = key {
                payload = codec.decrypt(&payload, &key)?;
            }
            if compressed {
                payload = codec.decompress(&payload)?;
            }
            Snapshot::from_bytes(&payload)
        })
        .await??;

        let Snapshot {
            tables: mut contents,
            ..
        } = snapshot;
        let selected = effective_tables(&contents, tables.as_deref());
        debug!(tables = ?selected, "Importing tables");

        for table in selected {
            let rows = contents.remove(&table).unwrap_or_default();
            let store = self.ctx.tables.clone();
            let written = self
                .ctx
                .retry
                .execute("import_rows", || {
                    let store = store.clone();
                    let rows = rows.clone();
                    let table = table.clone();
                    async move {
                        let result = store.import_rows(&table, rows).await;
                        result.map_err(|source| EngineError::Import { table, source })
                    }
                })
                .await?;

            debug!(table = %table, rows = written, "Table imported");
            let mut progress = progress.lock();
            progress.rows_restored_by_table.insert(table.clone(), written);
            progress.tables_restored.push(table);
        }

        Ok(())
    }
}

fn artifact_of(backup: &BackupRun) -> Result<(String, String)> {
    match (&backup.artifact_ref, &backup.checksum) {
        (Some(artifact), Some(checksum)) => Ok((artifact.clone(), checksum.clone())),
        _ => Err(EngineError::Internal(format!(
            "successful run {} has no artifact reference",
            backup.id
        ))),
    }
}

/// Requested tables present in the artifact, in request order; else all, sorted
fn effective_tables<T>(contents: &BTreeMap<String, T>, requested: Option<&[String]>) -> Vec<String> {
    match requested {
        Some(requested) => {
            let mut selected: Vec<String> = Vec::new();
            for table in requested {
                if contents.contains_key(table) && !selected.contains(table) {
                    selected.push(table.clone());
                }
            }
            selected
        }
        None => contents.keys().cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::backup::{BackupOrchestrator, Trigger};
    use crate::policy::{BackupKind, BackupPolicy};
    use crate::retry::RetryConfig;
    use crate::table::{Fault, FaultTarget, MemoryTableStore, Row};
    use crate::ErrorKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn row(id: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("v".into(), json!(id * 10));
        row
    }

    struct Fixture {
        tables: Arc<MemoryTableStore>,
        artifacts: MemoryArtifactStore,
        ctx: Arc<EngineContext>,
    }

    impl Fixture {
        fn new() -> Self {
            let tables = Arc::new(MemoryTableStore::new("id"));
            tables.upsert_rows("users", (1..=3).map(row)).unwrap();
            tables.upsert_rows("orders", (1..=5).map(row)).unwrap();
            let artifacts = MemoryArtifactStore::new();
            let ctx = Arc::new(
                EngineContext::new(tables.clone(), Arc::new(artifacts.clone())).with_retry(RetryConfig {
                    initial_delay_ms: 1,
                    max_delay_ms: 2,
                    jitter: false,
                    ..RetryConfig::default()
                }),
            );
            ctx.registry
                .upsert(
                    BackupPolicy::new("p", "All", BackupKind::Full, ["users", "orders"])
                        .with_compression(true),
                )
                .unwrap();
            Self {
                tables,
                artifacts,
                ctx,
            }
        }

        async fn backup(&self) -> BackupRun {
            BackupOrchestrator::new(self.ctx.clone())
                .run_backup("p", Trigger::Manual { allow_disabled: false })
                .await
                .unwrap()
        }

        fn restorer(&self) -> RestoreOrchestrator {
            RestoreOrchestrator::new(self.ctx.clone())
        }
    }

    #[test]
    fn test_effective_tables() {
        let mut contents = BTreeMap::new();
        contents.insert("b".to_string(), ());
        contents.insert("a".to_string(), ());

        assert_eq!(effective_tables(&contents, None), vec!["a", "b"]);
        let requested = vec!["b".to_string(), "zzz".to_string(), "a".to_string()];
        assert_eq!(effective_tables(&contents, Some(requested.as_slice())), vec!["b", "a"]);
        let none: Vec<String> = Vec::new();
        assert!(effective_tables(&contents, Some(none.as_slice())).is_empty());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        let users = fx.tables.rows("users");
        let orders = fx.tables.rows("orders");
        fx.tables.truncate("users");
        fx.tables.truncate("orders");

        let restore = fx.restorer().run_restore(&backup.id, None).await.unwrap();
        assert_eq!(restore.status, RunStatus::Success);
        assert_eq!(restore.tables_restored, vec!["orders", "users"]);
        assert_eq!(restore.rows_restored_by_table["users"], 3);
        assert_eq!(fx.tables.rows("users"), users);
        assert_eq!(fx.tables.rows("orders"), orders);
    }

    #[tokio::test]
    async fn test_restore_selected_tables_only() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        fx.tables.truncate("users");
        fx.tables.truncate("orders");

        let restore = fx
            .restorer()
            .run_restore(&backup.id, Some(vec!["users".into(), "ghosts".into()]))
            .await
            .unwrap();
        assert_eq!(restore.tables_restored, vec!["users"]);
        assert_eq!(restore.requested_tables, Some(vec!["users".into(), "ghosts".into()]));
        assert!(fx.tables.rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_artifact_is_never_imported() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        fx.tables.truncate("users");
        let artifact = backup.artifact_ref.clone().unwrap();
        assert!(fx.artifacts.tamper(&artifact, |data| {
            data.pop();
        }));

        let restorer = fx.restorer();
        assert!(!restorer.verify(&backup.id).await.unwrap().valid);

        let restore = restorer.run_restore(&backup.id, None).await.unwrap();
        assert_eq!(restore.status, RunStatus::Failed);
        assert_eq!(restore.error_kind, Some(ErrorKind::IntegrityCheckFailed));
        assert_eq!(restore.error.as_deref(), Some("IntegrityCheckFailed"));
        assert!(restore
            .error_detail
            .as_deref()
            .unwrap()
            .starts_with("Integrity check failed"));
        assert!(restore.tables_restored.is_empty());
        assert!(fx.tables.rows("users").is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        fx.artifacts
            .delete(backup.artifact_ref.as_deref().unwrap())
            .await
            .unwrap();

        let report = fx.restorer().verify(&backup.id).await.unwrap();
        assert!(!report.valid);
        assert!(report.actual_checksum.is_none());

        let restore = fx.restorer().run_restore(&backup.id, None).await.unwrap();
        assert_eq!(restore.error_kind, Some(ErrorKind::ArtifactMissing));
    }

    #[tokio::test]
    async fn test_partial_restore_is_reported() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        fx.tables.inject_fault("users", FaultTarget::Import, Fault::Permanent);

        let restore = fx.restorer().run_restore(&backup.id, None).await.unwrap();
        assert_eq!(restore.status, RunStatus::Failed);
        assert_eq!(restore.error_kind, Some(ErrorKind::ImportFailed));
        // "orders" sorts first and was imported before "users" failed
        assert_eq!(restore.tables_restored, vec!["orders"]);
        assert_eq!(restore.rows_restored_by_table["orders"], 5);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let fx = Fixture::new();
        let err = fx.restorer().run_restore("nope", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupNotFound);
        assert!(err.is_user_error());

        fx.tables.inject_fault("users", FaultTarget::Export, Fault::Permanent);
        let failed = BackupOrchestrator::new(fx.ctx.clone())
            .run_backup("p", Trigger::Scheduled)
            .await
            .unwrap_err();
        let failed_id = match failed {
            EngineError::BackupFailed { run_id, .. } => run_id,
            other => panic!("unexpected error {:?}", other),
        };
        let err = fx.restorer().run_restore(&failed_id, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupNotRestorable);
        assert!(fx.ctx.ledger.list_restores().is_empty());
    }

    #[tokio::test]
    async fn test_restore_twice_is_idempotent() {
        let fx = Fixture::new();
        let backup = fx.backup().await;
        let first = fx.restorer().run_restore(&backup.id, None).await.unwrap();
        let second = fx.restorer().run_restore(&backup.id, None).await.unwrap();
        assert_eq!(first.rows_restored_by_table, second.rows_restored_by_table);
        assert_eq!(fx.ctx.ledger.list_restores()[0].id, second.id);
    }
}
