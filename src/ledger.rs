//! Run ledger
//!
//! The ledger is the only state shared between backup timers, restore callers
//! and the retention sweep. Every mutation happens under one write lock, so
//! "is a run already in progress for this policy?" and "create the run" are a
//! single atomic step, and a run can be finalized exactly once.
//!
//! When a persistence path is configured the whole ledger is written as JSON
//! after each mutation (temp file + rename). Loading a ledger marks runs that
//! were still in progress as failed with [`ErrorKind::Interrupted`], so a
//! crash leaves a discoverable record rather than a stuck run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::policy::BackupKind;
use crate::ErrorKind;

/// Errors raised by the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Policy {policy_id} already has run {run_id} in progress")]
    RunInProgress { policy_id: String, run_id: String },

    #[error("Run {0} is already finalized")]
    AlreadyFinalized(String),

    #[error("Ledger persistence failed: {0}")]
    Persistence(String),
}

impl LedgerError {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::RunNotFound(_) => ErrorKind::BackupNotFound,
            LedgerError::RunInProgress { .. } => ErrorKind::OverlappingRun,
            LedgerError::AlreadyFinalized(_) => ErrorKind::RunAlreadyFinalized,
            LedgerError::Persistence(_) => ErrorKind::Internal,
        }
    }
}

/// Lifecycle state of a backup or restore run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    InProgress,
    Success,
    Failed,
}

impl RunStatus {
    /// Whether the run has been finalized
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }

    /// Lowercase label used for metrics
    pub fn label(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Details recorded on a backup run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRunMetadata {
    /// Rows exported per table
    pub table_row_counts: BTreeMap<String, u64>,
    /// Serialized bytes divided by compressed bytes, when compressed
    pub compression_ratio: Option<f64>,
    /// Kind configured on the policy when the run started
    pub requested_kind: BackupKind,
    /// Kind actually executed
    pub kind: BackupKind,
    /// An incremental or differential run had no reference run and exported everything
    pub degraded_to_full: bool,
    /// Run whose start time bounded the export
    pub base_run_id: Option<String>,
    /// Lower bound passed to the exporter
    pub since: Option<DateTime<Utc>>,
    pub compressed: bool,
    pub encrypted: bool,
}

impl BackupRunMetadata {
    pub fn new(kind: BackupKind) -> Self {
        Self {
            table_row_counts: BTreeMap::new(),
            compression_ratio: None,
            requested_kind: kind,
            kind,
            degraded_to_full: false,
            base_run_id: None,
            since: None,
            compressed: false,
            encrypted: false,
        }
    }
}

/// One execution of a backup policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRun {
    pub id: String,
    pub policy_id: String,
    /// Creation order; breaks ties between equal start times
    pub sequence: u64,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Size of the stored artifact
    pub size_bytes: u64,
    /// Set if and only if the run succeeded
    pub artifact_ref: Option<String>,
    /// SHA-256 hex of the stored bytes; set if and only if the run succeeded
    pub checksum: Option<String>,
    /// Name of the error kind, e.g. `"ExportFailed"`
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Full error message
    #[serde(default)]
    pub error_detail: Option<String>,
    pub metadata: BackupRunMetadata,
}

/// One execution of a restore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRun {
    pub id: String,
    pub backup_run_id: String,
    pub sequence: u64,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Tables the caller asked for, if any
    pub requested_tables: Option<Vec<String>>,
    /// Tables imported, in import order
    pub tables_restored: Vec<String>,
    pub rows_restored_by_table: BTreeMap<String, u64>,
    /// Name of the error kind, e.g. `"IntegrityCheckFailed"`
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Full error message
    #[serde(default)]
    pub error_detail: Option<String>,
}

/// Terminal result of a backup run
#[derive(Debug, Clone)]
pub enum BackupOutcome {
    Success {
        artifact_ref: String,
        checksum: String,
        size_bytes: u64,
    },
    Failed {
        kind: ErrorKind,
        detail: String,
    },
}

/// Terminal result of a restore run
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub tables_restored: Vec<String>,
    pub rows_restored_by_table: BTreeMap<String, u64>,
    /// Kind and full message of the failure, if any
    pub failure: Option<(ErrorKind, String)>,
}

/// Aggregate view over the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_runs: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub in_progress_count: usize,
    /// Bytes held by successful runs
    pub total_bytes: u64,
    /// Mean artifact size of successful runs
    pub average_bytes: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_scheduled_at: Option<DateTime<Utc>>,
    pub average_compression_ratio: Option<f64>,
    pub restore_runs: usize,
    pub restore_success_count: usize,
    pub restore_failure_count: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    backups: HashMap<String, BackupRun>,
    restores: HashMap<String, RestoreRun>,
    next_sequence: u64,
}

impl LedgerState {
    fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }
}

/// On-disk form of the ledger
#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    backups: Vec<BackupRun>,
    restores: Vec<RestoreRun>,
}

const INTERRUPTED_DETAIL: &str = "process stopped while the run was in progress";

impl BackupRun {
    fn mark_interrupted(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.end_time = Some(now);
        self.error = Some(ErrorKind::Interrupted.to_string());
        self.error_kind = Some(ErrorKind::Interrupted);
        self.error_detail = Some(INTERRUPTED_DETAIL.to_string());
    }
}

impl RestoreRun {
    fn mark_interrupted(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.end_time = Some(now);
        self.error = Some(ErrorKind::Interrupted.to_string());
        self.error_kind = Some(ErrorKind::Interrupted);
        self.error_detail = Some(INTERRUPTED_DETAIL.to_string());
    }
}

/// Run history for backups and restores
pub struct RunLedger {
    state: RwLock<LedgerState>,
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
}

impl RunLedger {
    /// In-memory ledger
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            path: None,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the ledger persisted at `path`, or start empty if there is none
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let mut state = LedgerState::default();

        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| LedgerError::Persistence(format!("Failed to stat {}: {}", path.display(), e)))?
        {
            let data = tokio::fs::read(&path).await.map_err(|e| {
                LedgerError::Persistence(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let file: LedgerFile = serde_json::from_slice(&data).map_err(|e| {
                LedgerError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
            })?;

            let now = Utc::now();
            let mut interrupted = 0;
            for mut run in file.backups {
                if run.status == RunStatus::InProgress {
                    run.mark_interrupted(now);
                    interrupted += 1;
                }
                state.next_sequence = state.next_sequence.max(run.sequence + 1);
                state.backups.insert(run.id.clone(), run);
            }
            for mut run in file.restores {
                if run.status == RunStatus::InProgress {
                    run.mark_interrupted(now);
                    interrupted += 1;
                }
                state.next_sequence = state.next_sequence.max(run.sequence + 1);
                state.restores.insert(run.id.clone(), run);
            }

            info!(
                path = %path.display(),
                backups = state.backups.len(),
                restores = state.restores.len(),
                interrupted,
                "Loaded run ledger"
            );
            if interrupted > 0 {
                warn!(interrupted, "Runs left in progress by a previous process were marked failed");
            }
        }

        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Persistence path, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Atomically check that no backup is in progress for `policy_id` and create one
    pub fn begin_backup(&self, policy_id: &str, kind: BackupKind) -> Result<BackupRun, LedgerError> {
        let mut state = self.state.write();

        if let Some(active) = state
            .backups
            .values()
            .find(|r| r.policy_id == policy_id && r.status == RunStatus::InProgress)
        {
            return Err(LedgerError::RunInProgress {
                policy_id: policy_id.to_string(),
                run_id: active.id.clone(),
            });
        }

        let run = BackupRun {
            id: Uuid::new_v4().to_string(),
            policy_id: policy_id.to_string(),
            sequence: state.next_sequence(),
            status: RunStatus::InProgress,
            start_time: Utc::now(),
            end_time: None,
            size_bytes: 0,
            artifact_ref: None,
            checksum: None,
            error: None,
            error_kind: None,
            error_detail: None,
            metadata: BackupRunMetadata::new(kind),
        };
        state.backups.insert(run.id.clone(), run.clone());
        debug!(run_id = %run.id, policy_id, "Backup run created");
        Ok(run)
    }

    /// Finalize a backup run; fails if it was already finalized
    pub fn finalize_backup(
        &self,
        run_id: &str,
        outcome: BackupOutcome,
        metadata: BackupRunMetadata,
    ) -> Result<BackupRun, LedgerError> {
        let mut state = self.state.write();
        let run = state
            .backups
            .get_mut(run_id)
            .ok_or_else(|| LedgerError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Err(LedgerError::AlreadyFinalized(run_id.to_string()));
        }

        run.end_time = Some(Utc::now());
        run.metadata = metadata;
        match outcome {
            BackupOutcome::Success {
                artifact_ref,
                checksum,
                size_bytes,
            } => {
                run.status = RunStatus::Success;
                run.artifact_ref = Some(artifact_ref);
                run.checksum = Some(checksum);
                run.size_bytes = size_bytes;
            }
            BackupOutcome::Failed { kind, detail } => {
                run.status = RunStatus::Failed;
                run.artifact_ref = None;
                run.checksum = None;
                run.error = Some(kind.to_string());
                run.error_kind = Some(kind);
                run.error_detail = Some(detail);
            }
        }
        Ok(run.clone())
    }

    /// Create an in-progress restore run
    pub fn begin_restore(&self, backup_run_id: &str, tables: Option<Vec<String>>) -> RestoreRun {
        let mut state = self.state.write();
        let run = RestoreRun {
            id: Uuid::new_v4().to_string(),
            backup_run_id: backup_run_id.to_string(),
            sequence: state.next_sequence(),
            status: RunStatus::InProgress,
            start_time: Utc::now(),
            end_time: None,
            requested_tables: tables,
            tables_restored: Vec::new(),
            rows_restored_by_table: BTreeMap::new(),
            error: None,
            error_kind: None,
            error_detail: None,
        };
        state.restores.insert(run.id.clone(), run.clone());
        run
    }

    /// Finalize a restore run; fails if it was already finalized
    pub fn finalize_restore(&self, run_id: &str, outcome: RestoreOutcome) -> Result<RestoreRun, LedgerError> {
        let mut state = self.state.write();
        let run = state
            .restores
            .get_mut(run_id)
            .ok_or_else(|| LedgerError::RunNotFound(run_id.to_string()))?;

        if run.status.is_terminal() {
            return Err(LedgerError::AlreadyFinalized(run_id.to_string()));
        }

        run.end_time = Some(Utc::now());
        run.tables_restored = outcome.tables_restored;
        run.rows_restored_by_table = outcome.rows_restored_by_table;
        match outcome.failure {
            None => run.status = RunStatus::Success,
            Some((kind, detail)) => {
                run.status = RunStatus::Failed;
                run.error = Some(kind.to_string());
                run.error_kind = Some(kind);
                run.error_detail = Some(detail);
            }
        }
        Ok(run.clone())
    }

    pub fn get_backup(&self, run_id: &str) -> Option<BackupRun> {
        self.state.read().backups.get(run_id).cloned()
    }

    pub fn get_restore(&self, run_id: &str) -> Option<RestoreRun> {
        self.state.read().restores.get(run_id).cloned()
    }

    /// Backup runs, newest first, optionally for one policy
    pub fn list_backups(&self, policy_id: Option<&str>) -> Vec<BackupRun> {
        let mut runs: Vec<_> = self
            .state
            .read()
            .backups
            .values()
            .filter(|r| policy_id.map_or(true, |p| r.policy_id == p))
            .cloned()
            .collect();
        runs.sort_by(|a, b| (b.start_time, b.sequence).cmp(&(a.start_time, a.sequence)));
        runs
    }

    /// Restore runs, newest first
    pub fn list_restores(&self) -> Vec<RestoreRun> {
        let mut runs: Vec<_> = self.state.read().restores.values().cloned().collect();
        runs.sort_by(|a, b| (b.start_time, b.sequence).cmp(&(a.start_time, a.sequence)));
        runs
    }

    /// Newest successful run of a policy, optionally restricted to an executed kind
    pub fn last_success(&self, policy_id: &str, kind: Option<BackupKind>) -> Option<BackupRun> {
        self.state
            .read()
            .backups
            .values()
            .filter(|r| r.policy_id == policy_id && r.status == RunStatus::Success)
            .filter(|r| kind.map_or(true, |k| r.metadata.kind == k))
            .max_by_key(|r| (r.start_time, r.sequence))
            .cloned()
    }

    /// Remove a finalized backup run record
    pub fn remove_backup(&self, run_id: &str) -> Result<Option<BackupRun>, LedgerError> {
        let mut state = self.state.write();
        match state.backups.get(run_id) {
            None => Ok(None),
            Some(run) if run.status == RunStatus::InProgress => Err(LedgerError::RunInProgress {
                policy_id: run.policy_id.clone(),
                run_id: run_id.to_string(),
            }),
            Some(_) => Ok(state.backups.remove(run_id)),
        }
    }

    /// Aggregate statistics; `next_scheduled_at` comes from the scheduler
    pub fn statistics(&self, next_scheduled_at: Option<DateTime<Utc>>) -> Statistics {
        let state = self.state.read();
        let mut stats = Statistics {
            next_scheduled_at,
            ..Default::default()
        };

        let mut ratios = Vec::new();
        for run in state.backups.values() {
            stats.total_runs += 1;
            match run.status {
                RunStatus::Success => {
                    stats.success_count += 1;
                    stats.total_bytes += run.size_bytes;
                    if let Some(ratio) = run.metadata.compression_ratio {
                        ratios.push(ratio);
                    }
                }
                RunStatus::Failed => stats.failure_count += 1,
                RunStatus::InProgress => stats.in_progress_count += 1,
            }
            stats.last_run_at = stats.last_run_at.max(Some(run.start_time));
        }

        if stats.success_count > 0 {
            stats.average_bytes = stats.total_bytes / stats.success_count as u64;
        }
        if !ratios.is_empty() {
            stats.average_compression_ratio = Some(ratios.iter().sum::<f64>() / ratios.len() as f64);
        }

        for run in state.restores.values() {
            stats.restore_runs += 1;
            match run.status {
                RunStatus::Success => stats.restore_success_count += 1,
                RunStatus::Failed => stats.restore_failure_count += 1,
                RunStatus::InProgress => {}
            }
        }

        stats
    }

    /// Write the ledger to its path; no-op for in-memory ledgers
    pub async fn persist(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Serialise writers so an older snapshot never lands after a newer one.
        let _guard = self.write_lock.lock().await;

        let data = {
            let state = self.state.read();
            let mut backups: Vec<_> = state.backups.values().cloned().collect();
            backups.sort_by_key(|r| r.sequence);
            let mut restores: Vec<_> = state.restores.values().cloned().collect();
            restores.sort_by_key(|r| r.sequence);
            serde_json::to_vec_pretty(&LedgerFile {
                version: 1,
                backups,
                restores,
            })
            .map_err(|e| LedgerError::Persistence(format!("Failed to serialize ledger: {}", e)))?
        };

        write_atomic(path, &data).await
    }
}

impl Default for RunLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Write to a temp file in the same directory, then rename over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LedgerError::Persistence(format!("Failed to create directory {}: {}", parent.display(), e))
            })?;
        }
    }

    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| LedgerError::Persistence(format!("Failed to create {}: {}", temp_path.display(), e)))?;
    file.write_all(data)
        .await
        .map_err(|e| LedgerError::Persistence(format!("Failed to write ledger: {}", e)))?;
    file.sync_all()
        .await
        .map_err(|e| LedgerError::Persistence(format!("Failed to sync ledger: {}", e)))?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        LedgerError::Persistence(format!("Failed to rename {}: {}", temp_path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn success(ledger: &RunLedger, run: &BackupRun, size: u64) -> BackupRun {
        ledger
            .finalize_backup(
                &run.id,
                BackupOutcome::Success {
                    artifact_ref: format!("p_{}.backup", run.id),
                    checksum: "abc".into(),
                    size_bytes: size,
                },
                run.metadata.clone(),
            )
            .unwrap()
    }

    #[test]
    fn test_begin_backup_rejects_overlap() {
        let ledger = RunLedger::new();
        let first = ledger.begin_backup("p", BackupKind::Full).unwrap();

        match ledger.begin_backup("p", BackupKind::Full) {
            Err(LedgerError::RunInProgress { run_id, .. }) => assert_eq!(run_id, first.id),
            other => panic!("expected overlap, got {:?}", other),
        }

        // Other policies are unaffected
        assert!(ledger.begin_backup("q", BackupKind::Full).is_ok());

        success(&ledger, &first, 10);
        assert!(ledger.begin_backup("p", BackupKind::Full).is_ok());
    }

    #[test]
    fn test_finalize_exactly_once() {
        let ledger = RunLedger::new();
        let run = ledger.begin_backup("p", BackupKind::Full).unwrap();
        let done = success(&ledger, &run, 10);
        assert_eq!(done.status, RunStatus::Success);
        assert!(done.checksum.is_some() && done.artifact_ref.is_some());

        let err = ledger
            .finalize_backup(
                &run.id,
                BackupOutcome::Failed {
                    kind: ErrorKind::Timeout,
                    detail: "late".into(),
                },
                run.metadata.clone(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RunAlreadyFinalized);
        assert_eq!(ledger.get_backup(&run.id).unwrap().status, RunStatus::Success);
    }

    #[test]
    fn test_failed_runs_have_no_checksum() {
        let ledger = RunLedger::new();
        let run = ledger.begin_backup("p", BackupKind::Full).unwrap();
        let failed = ledger
            .finalize_backup(
                &run.id,
                BackupOutcome::Failed {
                    kind: ErrorKind::StoreUnavailable,
                    detail: "Artifact store unavailable: down".into(),
                },
                run.metadata.clone(),
            )
            .unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.checksum.is_none() && failed.artifact_ref.is_none());
        assert_eq!(failed.error_kind, Some(ErrorKind::StoreUnavailable));
        assert_eq!(failed.error.as_deref(), Some("StoreUnavailable"));
        assert_eq!(failed.error_detail.as_deref(), Some("Artifact store unavailable: down"));
    }

    #[test]
    fn test_list_newest_first_and_last_success() {
        let ledger = RunLedger::new();
        let a = ledger.begin_backup("p", BackupKind::Full).unwrap();
        success(&ledger, &a, 1);
        let b = ledger.begin_backup("p", BackupKind::Incremental).unwrap();
        let mut meta = b.metadata.clone();
        meta.kind = BackupKind::Incremental;
        ledger
            .finalize_backup(
                &b.id,
                BackupOutcome::Success {
                    artifact_ref: "x".into(),
                    checksum: "y".into(),
                    size_bytes: 2,
                },
                meta,
            )
            .unwrap();
        let c = ledger.begin_backup("q", BackupKind::Full).unwrap();

        let ids: Vec<_> = ledger.list_backups(None).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id.clone(), b.id.clone(), a.id.clone()]);
        assert_eq!(ledger.list_backups(Some("q")).len(), 1);

        assert_eq!(ledger.last_success("p", None).unwrap().id, b.id);
        assert_eq!(ledger.last_success("p", Some(BackupKind::Full)).unwrap().id, a.id);
        assert!(ledger.last_success("q", None).is_none());
    }

    #[test]
    fn test_remove_refuses_in_progress() {
        let ledger = RunLedger::new();
        let run = ledger.begin_backup("p", BackupKind::Full).unwrap();
        assert!(ledger.remove_backup(&run.id).is_err());
        success(&ledger, &run, 1);
        assert!(ledger.remove_backup(&run.id).unwrap().is_some());
        assert!(ledger.remove_backup(&run.id).unwrap().is_none());
    }

    #[test]
    fn test_statistics() {
        let ledger = RunLedger::new();
        let a = ledger.begin_backup("p", BackupKind::Full).unwrap();
        let mut meta = a.metadata.clone();
        meta.compression_ratio = Some(4.0);
        ledger
            .finalize_backup(
                &a.id,
                BackupOutcome::Success {
                    artifact_ref: "a".into(),
                    checksum: "a".into(),
                    size_bytes: 100,
                },
                meta,
            )
            .unwrap();
        let b = ledger.begin_backup("p", BackupKind::Full).unwrap();
        success(&ledger, &b, 300);
        let c = ledger.begin_backup("p", BackupKind::Full).unwrap();
        ledger
            .finalize_backup(
                &c.id,
                BackupOutcome::Failed {
                    kind: ErrorKind::ExportFailed,
                    detail: "x".into(),
                },
                c.metadata.clone(),
            )
            .unwrap();

        let stats = ledger.statistics(None);
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.total_bytes, 400);
        assert_eq!(stats.average_bytes, 200);
        assert_eq!(stats.average_compression_ratio, Some(4.0));
        assert_eq!(stats.last_run_at, Some(c.start_time));
    }

    #[tokio::test]
    async fn test_persist_and_reload_marks_interrupted_runs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("ledger.json");

        let ledger = RunLedger::load(&path).await.unwrap();
        let done = ledger.begin_backup("p", BackupKind::Full).unwrap();
        success(&ledger, &done, 5);
        let stuck = ledger.begin_backup("p", BackupKind::Full).unwrap();
        let restore = ledger.begin_restore(&done.id, None);
        ledger.persist().await.unwrap();

        let reloaded = RunLedger::load(&path).await.unwrap();
        assert_eq!(reloaded.get_backup(&done.id).unwrap().status, RunStatus::Success);

        let stuck = reloaded.get_backup(&stuck.id).unwrap();
        assert_eq!(stuck.status, RunStatus::Failed);
        assert_eq!(stuck.error_kind, Some(ErrorKind::Interrupted));
        assert!(stuck.end_time.is_some());

        let restore = reloaded.get_restore(&restore.id).unwrap();
        assert_eq!(restore.status, RunStatus::Failed);

        // Sequences continue after the highest persisted one
        let next = reloaded.begin_backup("p", BackupKind::Full).unwrap();
        assert!(next.sequence > restore.sequence);
    }
}
