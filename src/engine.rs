//! Administrative facade
//!
//! [`BackupEngine`] owns the policy registry, the run ledger, the scheduler
//! and the orchestrators, and exposes the operations an administrative layer
//! needs. All shared state lives in an [`EngineContext`] handed to each
//! worker by `Arc`; there are no process-wide singletons.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::artifact::{ArtifactStore, FileArtifactStore, StoreError};
use crate::backup::{BackupOrchestrator, Trigger};
use crate::cadence::{Cadence, ScheduleParseWarning};
use crate::cancel::RunCancellations;
use crate::codec::{IntegrityCodec, StandardCodec};
use crate::config::{EngineConfig, EnvKeyProvider, KeyProvider, NoKeyProvider};
use crate::ledger::{BackupRun, RestoreRun, RunLedger, RunStatus, Statistics};
use crate::policy::{BackupPolicy, PolicyRegistry, PolicyUpdate};
use crate::restore::{RestoreOrchestrator, VerifyReport};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::Scheduler;
use crate::table::TableStore;
use crate::{EngineError, ErrorKind, Result};

/// Shared handles used by every run
pub struct EngineContext {
    pub registry: Arc<PolicyRegistry>,
    pub ledger: Arc<RunLedger>,
    pub tables: Arc<dyn TableStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub codec: Arc<dyn IntegrityCodec>,
    pub keys: Arc<dyn KeyProvider>,
    pub cancellations: Arc<RunCancellations>,
    pub retry: RetryExecutor,
    pub run_timeout: Duration,
    pub parallel_table_export: bool,
}

impl EngineContext {
    /// Context with an empty registry, an in-memory ledger, the standard
    /// codec, no encryption key and default retry and timeout settings
    pub fn new(tables: Arc<dyn TableStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            registry: Arc::new(PolicyRegistry::new()),
            ledger: Arc::new(RunLedger::new()),
            tables,
            artifacts,
            codec: Arc::new(StandardCodec::new()),
            keys: Arc::new(NoKeyProvider),
            cancellations: Arc::new(RunCancellations::new()),
            retry: RetryExecutor::new(defaults.retry.clone()),
            run_timeout: defaults.run_timeout(),
            parallel_table_export: defaults.parallel_table_export,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<RunLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn IntegrityCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = RetryExecutor::new(retry);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn with_parallel_table_export(mut self, enabled: bool) -> Self {
        self.parallel_table_export = enabled;
        self
    }

    /// Persist the ledger, logging instead of failing
    ///
    /// A run must still be finalized even when its record cannot be written.
    pub async fn persist_ledger(&self) {
        if let Err(e) = self.ledger.persist().await {
            error!(error = %e, "Failed to persist run ledger");
        }
    }
}

/// Builder for [`BackupEngine`]
pub struct BackupEngineBuilder {
    config: EngineConfig,
    tables: Option<Arc<dyn TableStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    codec: Option<Arc<dyn IntegrityCodec>>,
    keys: Option<Arc<dyn KeyProvider>>,
}

impl BackupEngineBuilder {
    /// The data store to export from and import into (required)
    pub fn table_store(mut self, tables: Arc<dyn TableStore>) -> Self {
        self.tables = Some(tables);
        self
    }

    /// Artifact backend; defaults to files under `config.artifact_root`
    pub fn artifact_store(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Codec; defaults to [`StandardCodec`]
    pub fn codec(mut self, codec: Arc<dyn IntegrityCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Key source; defaults to the environment variable named in the config
    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Load the ledger, register configured policies and assemble the engine
    ///
    /// The scheduler is not started; call [`BackupEngine::start`].
    pub async fn build(self) -> Result<BackupEngine> {
        let config = self.config;
        config.validate()?;

        let tables = self
            .tables
            .ok_or_else(|| EngineError::Config("a table store is required".into()))?;
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(FileArtifactStore::new(config.artifact_root.clone())) as Arc<dyn ArtifactStore>);
        let codec = self
            .codec
            .unwrap_or_else(|| Arc::new(StandardCodec::new()) as Arc<dyn IntegrityCodec>);
        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(EnvKeyProvider::new(config.encryption_key_env.clone())) as Arc<dyn KeyProvider>);

        let ledger = match &config.ledger_path {
            Some(path) => Arc::new(RunLedger::load(path).await?),
            None => Arc::new(RunLedger::new()),
        };

        let (default_cadence, warning) =
            Cadence::parse_or_default(&config.default_cadence, Cadence::daily());
        if warning.is_some() {
            warn!(default_cadence = %config.default_cadence, "Configured default cadence is invalid, using daily");
        }

        let ctx = Arc::new(
            EngineContext::new(tables, artifacts)
                .with_ledger(ledger)
                .with_codec(codec)
                .with_key_provider(keys)
                .with_retry(config.retry.clone())
                .with_run_timeout(config.run_timeout())
                .with_parallel_table_export(config.parallel_table_export),
        );

        for policy in &config.policies {
            ctx.registry.upsert(policy.clone())?;
        }
        // Persist any runs the load marked as interrupted.
        ctx.persist_ledger().await;

        let backups = Arc::new(BackupOrchestrator::new(ctx.clone()));
        let restores = RestoreOrchestrator::new(ctx.clone());
        let scheduler = Arc::new(Scheduler::new(
            ctx.registry.clone(),
            backups.clone(),
            default_cadence,
        ));

        info!(
            policies = config.policies.len(),
            ledger = ?config.ledger_path,
            "Backup engine ready"
        );

        Ok(BackupEngine {
            ctx,
            backups,
            restores,
            scheduler,
        })
    }
}

/// Backup and recovery engine
pub struct BackupEngine {
    ctx: Arc<EngineContext>,
    backups: Arc<BackupOrchestrator>,
    restores: RestoreOrchestrator,
    scheduler: Arc<Scheduler>,
}

impl BackupEngine {
    /// Start building an engine from `config`
    pub fn builder(config: EngineConfig) -> BackupEngineBuilder {
        BackupEngineBuilder {
            config,
            tables: None,
            artifacts: None,
            codec: None,
            keys: None,
        }
    }

    /// Shared context, for embedding the orchestrators elsewhere
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Arm a timer for every enabled policy and follow registry changes
    ///
    /// Returns the policies whose schedules fell back to the default cadence.
    pub fn start(&self) -> Vec<(String, ScheduleParseWarning)> {
        self.scheduler.start_all()
    }

    /// Stop all timers; in-flight runs finish on their own
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    /// Stop a policy's timer until its next change or [`BackupEngine::start`]
    pub fn stop_policy(&self, policy_id: &str) -> bool {
        self.scheduler.stop(policy_id)
    }

    pub fn list_policies(&self) -> Vec<BackupPolicy> {
        self.ctx.registry.list()
    }

    pub fn get_policy(&self, policy_id: &str) -> Result<BackupPolicy> {
        self.ctx.registry.get(policy_id)
    }

    /// Create or replace a policy
    pub fn upsert_policy(&self, policy: BackupPolicy) -> Result<BackupPolicy> {
        self.ctx.registry.upsert(policy)
    }

    /// Change some fields of a policy
    pub fn update_policy(&self, policy_id: &str, update: PolicyUpdate) -> Result<BackupPolicy> {
        self.ctx.registry.update(policy_id, update)
    }

    pub fn set_policy_enabled(&self, policy_id: &str, enabled: bool) -> Result<BackupPolicy> {
        self.ctx.registry.set_enabled(policy_id, enabled)
    }

    /// Run a backup now and wait for the result
    pub async fn trigger_backup(&self, policy_id: &str) -> Result<BackupRun> {
        self.backups
            .run_backup(policy_id, Trigger::Manual { allow_disabled: false })
            .await
    }

    /// Run a backup now, even if the policy is disabled
    pub async fn trigger_backup_with_override(&self, policy_id: &str) -> Result<BackupRun> {
        self.backups
            .run_backup(policy_id, Trigger::Manual { allow_disabled: true })
            .await
    }

    pub fn get_backup_run(&self, run_id: &str) -> Result<BackupRun> {
        self.ctx
            .ledger
            .get_backup(run_id)
            .ok_or_else(|| EngineError::BackupNotFound(run_id.to_string()))
    }

    /// Backup runs newest first, optionally for one policy
    pub fn list_backup_runs(&self, policy_id: Option<&str>) -> Vec<BackupRun> {
        self.ctx.ledger.list_backups(policy_id)
    }

    /// Restore from a successful backup run
    pub async fn trigger_restore(
        &self,
        backup_run_id: &str,
        tables: Option<Vec<String>>,
    ) -> Result<RestoreRun> {
        self.restores.run_restore(backup_run_id, tables).await
    }

    pub fn get_restore_run(&self, run_id: &str) -> Result<RestoreRun> {
        self.ctx
            .ledger
            .get_restore(run_id)
            .ok_or_else(|| EngineError::RestoreNotFound(run_id.to_string()))
    }

    /// Restore runs newest first
    pub fn list_restore_runs(&self) -> Vec<RestoreRun> {
        self.ctx.ledger.list_restores()
    }

    /// Whether the stored artifact still matches its recorded checksum
    pub async fn verify_integrity(&self, backup_run_id: &str) -> Result<bool> {
        Ok(self.restores.verify(backup_run_id).await?.valid)
    }

    /// Verification with expected and actual checksums and sizes
    pub async fn verify_report(&self, backup_run_id: &str) -> Result<VerifyReport> {
        self.restores.verify(backup_run_id).await
    }

    /// Delete a finalized backup run and its artifact, ignoring retention
    ///
    /// Returns false if the run does not exist.
    pub async fn delete_backup_run(&self, run_id: &str) -> Result<bool> {
        let Some(run) = self.ctx.ledger.get_backup(run_id) else {
            return Ok(false);
        };

        if let Some(artifact) = &run.artifact_ref {
            match self.ctx.artifacts.delete(artifact).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let removed = self.ctx.ledger.remove_backup(run_id)?.is_some();
        self.ctx.persist_ledger().await;
        info!(run_id, removed, "Backup run deleted");
        Ok(removed)
    }

    /// Request cancellation of an in-flight backup or restore run
    ///
    /// Returns true only if the run will be finalized as `Cancelled`.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        if !self.is_in_flight(run_id) || !self.ctx.cancellations.cancel(run_id) {
            return false;
        }
        if self.is_in_flight(run_id) {
            return true;
        }
        // Finalized between the two checks; the request may not have been seen.
        self.ctx.cancellations.discard(run_id);
        self.run_state(run_id).map(|(_, kind)| kind) == Some(Some(ErrorKind::Cancelled))
    }

    fn is_in_flight(&self, run_id: &str) -> bool {
        matches!(self.run_state(run_id), Some((RunStatus::InProgress, _)))
    }

    fn run_state(&self, run_id: &str) -> Option<(RunStatus, Option<ErrorKind>)> {
        match self.ctx.ledger.get_backup(run_id) {
            Some(run) => Some((run.status, run.error_kind)),
            None => self
                .ctx
                .ledger
                .get_restore(run_id)
                .map(|run| (run.status, run.error_kind)),
        }
    }

    pub fn get_statistics(&self) -> Statistics {
        self.ctx
            .ledger
            .statistics(self.scheduler.next_scheduled_at())
    }

    /// Location of the persisted ledger, if any
    pub fn ledger_path(&self) -> Option<&Path> {
        self.ctx.ledger.path()
    }
}

impl Drop for BackupEngine {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}
