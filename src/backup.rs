//! Backup pipeline
//!
//! One backup run: export every table of a policy, serialize the row sets
//! deterministically, optionally compress and encrypt, checksum the final
//! bytes, store them, record the result and sweep expired runs.
//!
//! Every failure after the run record exists is written back to the ledger
//! before it is returned, so no run is left in progress by an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::artifact::{artifact_name, ArtifactStore};
use crate::codec::IntegrityCodec;
use crate::config::KeyProvider;
use crate::engine::EngineContext;
use crate::ledger::{BackupOutcome, BackupRun, BackupRunMetadata, LedgerError};
use crate::metrics::{self, Timer};
use crate::policy::{BackupKind, BackupPolicy};
use crate::retention;
use crate::scheduler::DueHandler;
use crate::snapshot::Snapshot;
use crate::table::{Row, TableStore};
use crate::{EngineError, Result};

/// What started a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A policy timer fired
    Scheduled,
    /// An operator asked for it; `allow_disabled` runs disabled policies too
    Manual { allow_disabled: bool },
}

impl Trigger {
    fn allows_disabled(self) -> bool {
        matches!(self, Trigger::Manual { allow_disabled: true })
    }
}

/// Rows to export and why
#[derive(Debug, Clone, PartialEq)]
pub struct ExportScope {
    /// Kind actually executed
    pub kind: BackupKind,
    /// Only rows changed after this instant
    pub since: Option<DateTime<Utc>>,
    /// Run that provided `since`
    pub base_run_id: Option<String>,
    /// An incremental or differential run found no reference run
    pub degraded_to_full: bool,
}

struct StoredArtifact {
    artifact_ref: String,
    checksum: String,
    size_bytes: u64,
}

/// Executes backup runs
#[derive(Clone)]
pub struct BackupOrchestrator {
    ctx: Arc<EngineContext>,
}

impl BackupOrchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run one backup of `policy_id` end to end
    ///
    /// Returns the finalized run on success. A run that started and failed is
    /// recorded as `Failed` and surfaced as [`EngineError::BackupFailed`]. A
    /// trigger that finds another run of the same policy in progress creates
    /// nothing and fails with the ledger's overlap error.
    #[instrument(skip(self))]
    pub async fn run_backup(&self, policy_id: &str, trigger: Trigger) -> Result<BackupRun> {
        let policy = self.ctx.registry.get(policy_id)?;
        if !policy.enabled && !trigger.allows_disabled() {
            return Err(EngineError::PolicyDisabled(policy.id));
        }

        let run = match self.ctx.ledger.begin_backup(&policy.id, policy.kind) {
            Ok(run) => run,
            Err(LedgerError::RunInProgress { policy_id, run_id }) => {
                warn!(
                    policy_id = %policy_id,
                    active_run_id = %run_id,
                    ?trigger,
                    "SkippedOverlappingRun: a backup for this policy is already in progress"
                );
                metrics::record_skipped_overlap(&policy_id);
                return Err(LedgerError::RunInProgress { policy_id, run_id }.into());
            }
            Err(e) => return Err(e.into()),
        };
        // Must precede the first await: the run is already visible as InProgress.
        let mut cancel = self.ctx.cancellations.register(&run.id);
        self.ctx.persist_ledger().await;

        info!(run_id = %run.id, kind = %policy.kind, tables = policy.tables.len(), "Backup run started");
        let _active = metrics::track_active_run();
        let timer = Timer::start();

        let artifact_key = artifact_name(&policy.id, &run.id);
        let metadata = Arc::new(Mutex::new(run.metadata.clone()));
        let timeout = self.ctx.run_timeout;

        let result = tokio::select! {
            result = self.execute(&policy, &artifact_key, metadata.clone()) => result,
            _ = tokio::time::sleep(timeout) => Err(EngineError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
        };
        let cancelled = self.ctx.cancellations.close(&run.id);
        let result = match result {
            Ok(_) if cancelled => Err(EngineError::Cancelled),
            other => other,
        };

        if matches!(result, Err(EngineError::Timeout(_)) | Err(EngineError::Cancelled)) {
            // The store may have completed before the run was abandoned.
            if let Err(e) = self.ctx.artifacts.delete(&artifact_key).await {
                warn!(run_id = %run.id, artifact = %artifact_key, error = %e, "Failed to remove abandoned artifact");
            }
        }

        let outcome = match &result {
            Ok(stored) => BackupOutcome::Success {
                artifact_ref: stored.artifact_ref.clone(),
                checksum: stored.checksum.clone(),
                size_bytes: stored.size_bytes,
            },
            Err(e) => BackupOutcome::Failed {
                kind: e.kind(),
                detail: e.to_string(),
            },
        };
        let metadata = metadata.lock().clone();
        let finalized = self.ctx.ledger.finalize_backup(&run.id, outcome, metadata);
        self.ctx.cancellations.release(&run.id);
        let finalized = finalized?;
        self.ctx.persist_ledger().await;
        metrics::record_backup(
            &policy.id,
            finalized.status.label(),
            timer.elapsed_secs(),
            finalized.size_bytes,
        );

        match result {
            Ok(_) => {
                info!(
                    run_id = %finalized.id,
                    size_bytes = finalized.size_bytes,
                    kind = %finalized.metadata.kind,
                    degraded_to_full = finalized.metadata.degraded_to_full,
                    duration_secs = timer.elapsed_secs(),
                    "Backup run succeeded"
                );

                let current = self.ctx.registry.get(&policy.id).unwrap_or(policy);
                let report = retention::sweep(&self.ctx, &current, Utc::now()).await;
                if !report.deleted.is_empty() || !report.failed.is_empty() {
                    self.ctx.persist_ledger().await;
                }
                Ok(finalized)
            }
            Err(e) => {
                error!(run_id = %run.id, kind = %e.kind(), error = %e, "Backup run failed");
                Err(EngineError::BackupFailed {
                    run_id: run.id,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Export scope for the next run of `policy`
    pub fn resolve_scope(&self, policy: &BackupPolicy) -> ExportScope {
        let reference = match policy.kind {
            BackupKind::Full => None,
            BackupKind::Incremental => self.ctx.ledger.last_success(&policy.id, None),
            BackupKind::Differential => self
                .ctx
                .ledger
                .last_success(&policy.id, Some(BackupKind::Full)),
        };

        match (policy.kind, reference) {
            (BackupKind::Full, _) => ExportScope {
                kind: BackupKind::Full,
                since: None,
                base_run_id: None,
                degraded_to_full: false,
            },
            (kind, Some(base)) => ExportScope {
                kind,
                since: Some(base.start_time),
                base_run_id: Some(base.id),
                degraded_to_full: false,
            },
            (kind, None) => {
                info!(policy_id = %policy.id, requested = %kind, "No reference run, exporting everything");
                ExportScope {
                    kind: BackupKind::Full,
                    since: None,
                    base_run_id: None,
                    degraded_to_full: true,
                }
            }
        }
    }

    async fn execute(
        &self,
        policy: &BackupPolicy,
        artifact_key: &str,
        metadata: Arc<Mutex<BackupRunMetadata>>,
    ) -> Result<StoredArtifact> {
        // Never fall back to an unencrypted artifact.
        let key = if policy.encrypt {
            Some(self.ctx.keys.encryption_key()?)
        } else {
            None
        };

        let scope = self.resolve_scope(policy);
        {
            let mut meta = metadata.lock();
            meta.kind = scope.kind;
            meta.since = scope.since;
            meta.base_run_id = scope.base_run_id.clone();
            meta.degraded_to_full = scope.degraded_to_full;
            meta.compressed = policy.compress;
            meta.encrypted = policy.encrypt;
        }

        let tables = self.export_tables(policy, scope.since).await?;
        let snapshot = Snapshot::new(tables);
        metadata.lock().table_row_counts = snapshot.row_counts();

        let raw = snapshot.to_bytes()?;
        let raw_len = raw.len();
        let codec = self.ctx.codec.clone();
        let compress = policy.compress;

        let (payload, compressed_len) = tokio::task::spawn_blocking(move || -> Result<(Vec<u8>, Option<usize>)> {
            let mut data = raw;
            let mut compressed_len = None;
            if compress {
                data = codec.compress(&data)?;
                compressed_len = Some(data.len());
            }
            if let Some(key) = key {
                data = codec.encrypt(&data, &key)?;
            }
            Ok((data, compressed_len))
        })
        .await??;

        if let Some(compressed_len) = compressed_len.filter(|len| *len > 0) {
            metadata.lock().compression_ratio = Some(raw_len as f64 / compressed_len as f64);
        }

        let checksum = self.ctx.codec.checksum(&payload);
        let size_bytes = payload.len() as u64;
        debug!(raw_len, size_bytes, checksum = %checksum, "Payload encoded");

        let data = Bytes::from(payload);
        let artifacts = self.ctx.artifacts.clone();
        let artifact_ref = self
            .ctx
            .retry
            .execute("store_artifact", || {
                let artifacts = artifacts.clone();
                let data = data.clone();
                async move { Ok(artifacts.put(artifact_key, data).await?) }
            })
            .await?;

        Ok(StoredArtifact {
            artifact_ref,
            checksum,
            size_bytes,
        })
    }

    async fn export_tables(
        &self,
        policy: &BackupPolicy,
        since: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, Vec<Row>>> {
        let export_one = |table: String| {
            let tables = self.ctx.tables.clone();
            let retry = self.ctx.retry.clone();
            async move {
                let rows = retry
                    .execute("export_rows", || {
                        let tables = tables.clone();
                        let table = table.clone();
                        async move {
                            let result = tables.export_rows(&table, since).await;
                            result.map_err(|source| EngineError::Export { table, source })
                        }
                    })
                    .await?;
                debug!(table = %table, rows = rows.len(), "Table exported");
                Ok::<_, EngineError>((table, rows))
            }
        };

        let exported = if self.ctx.parallel_table_export {
            futures::future::try_join_all(policy.tables.iter().cloned().map(export_one)).await?
        } else {
            let mut exported = Vec::with_capacity(policy.tables.len());
            for table in policy.tables.iter().cloned() {
                exported.push(export_one(table).await?);
            }
            exported
        };

        Ok(exported.into_iter().collect())
    }
}

#[async_trait]
impl DueHandler for BackupOrchestrator {
    async fn on_due(&self, policy_id: &str) {
        match self.run_backup(policy_id, Trigger::Scheduled).await {
            Ok(run) => debug!(policy_id, run_id = %run.id, "Scheduled backup finished"),
            Err(EngineError::PolicyDisabled(_)) => {
                debug!(policy_id, "Policy disabled, scheduled trigger ignored")
            }
            // Overlaps and failed runs are already logged and recorded.
            Err(e) => debug!(policy_id, error = %e, "Scheduled backup did not succeed"),
        }
    }
}
