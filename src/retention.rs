//! Retention sweep
//!
//! A successful run expires once it is older than the policy's retention
//! period, but the newest successful run of a policy is never a candidate,
//! so a policy always keeps at least one recovery point.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactStore, StoreError};
use crate::engine::EngineContext;
use crate::ledger::{BackupRun, RunStatus};
use crate::metrics;
use crate::policy::BackupPolicy;

/// Result of one sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    /// Runs removed from the ledger
    pub deleted: Vec<String>,
    /// Runs that could not be removed, with the reason
    pub failed: Vec<(String, String)>,
}

/// Runs of `policy` eligible for deletion at `now`
pub fn select_expired<'a>(
    runs: &'a [BackupRun],
    policy: &BackupPolicy,
    now: DateTime<Utc>,
) -> Vec<&'a BackupRun> {
    let mut successes: Vec<&BackupRun> = runs
        .iter()
        .filter(|r| r.policy_id == policy.id && r.status == RunStatus::Success)
        .collect();
    successes.sort_by(|a, b| (b.start_time, b.sequence).cmp(&(a.start_time, a.sequence)));

    let retention = Duration::days(policy.retention_days as i64);
    successes
        .into_iter()
        .skip(1)
        .filter(|r| now - r.start_time > retention)
        .collect()
}

/// Delete expired runs of `policy` and their artifacts
///
/// Failures are logged and skipped; they never fail the caller.
pub async fn sweep(ctx: &EngineContext, policy: &BackupPolicy, now: DateTime<Utc>) -> SweepReport {
    let runs = ctx.ledger.list_backups(Some(&policy.id));
    let expired = select_expired(&runs, policy, now);
    let mut report = SweepReport::default();

    if expired.is_empty() {
        debug!(policy_id = %policy.id, "Retention sweep found nothing to delete");
        return report;
    }

    for run in expired {
        if let Some(artifact) = &run.artifact_ref {
            match ctx.artifacts.delete(artifact).await {
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(policy_id = %policy.id, run_id = %run.id, error = %e, "Retention sweep could not delete artifact");
                    report.failed.push((run.id.clone(), e.to_string()));
                    continue;
                }
            }
        }

        match ctx.ledger.remove_backup(&run.id) {
            Ok(_) => report.deleted.push(run.id.clone()),
            Err(e) => {
                warn!(policy_id = %policy.id, run_id = %run.id, error = %e, "Retention sweep could not remove run");
                report.failed.push((run.id.clone(), e.to_string()));
            }
        }
    }

    info!(
        policy_id = %policy.id,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Retention sweep finished"
    );
    metrics::record_retention(report.deleted.len(), report.failed.len());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BackupRunMetadata;
    use crate::policy::BackupKind;

    fn run(id: &str, sequence: u64, age_days: i64, status: RunStatus, now: DateTime<Utc>) -> BackupRun {
        BackupRun {
            id: id.to_string(),
            policy_id: "p".to_string(),
            sequence,
            status,
            start_time: now - Duration::days(age_days),
            end_time: None,
            size_bytes: 0,
            artifact_ref: Some(format!("p_{}.backup", id)),
            checksum: Some("c".into()),
            error: None,
            error_kind: None,
            error_detail: None,
            metadata: BackupRunMetadata::new(BackupKind::Full),
        }
    }

    fn policy(retention_days: u32) -> BackupPolicy {
        BackupPolicy::new("p", "P", BackupKind::Full, ["users"]).with_retention_days(retention_days)
    }

    fn ids(runs: Vec<&BackupRun>) -> Vec<&str> {
        runs.into_iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_only_older_than_retention_expire() {
        let now = Utc::now();
        let runs = vec![
            run("new", 3, 1, RunStatus::Success, now),
            run("mid", 2, 5, RunStatus::Success, now),
            run("old", 1, 10, RunStatus::Success, now),
        ];
        assert_eq!(ids(select_expired(&runs, &policy(7), now)), vec!["old"]);
    }

    #[test]
    fn test_newest_success_is_never_expired() {
        let now = Utc::now();
        let runs = vec![
            run("a", 1, 30, RunStatus::Success, now),
            run("failed", 2, 0, RunStatus::Failed, now),
        ];
        assert!(select_expired(&runs, &policy(0), now).is_empty());
    }

    #[test]
    fn test_zero_retention_keeps_only_newest() {
        let now = Utc::now();
        let runs = vec![
            run("a", 1, 0, RunStatus::Success, now - Duration::seconds(3)),
            run("b", 2, 0, RunStatus::Success, now - Duration::seconds(2)),
            run("c", 3, 0, RunStatus::Success, now - Duration::seconds(1)),
        ];
        assert_eq!(ids(select_expired(&runs, &policy(0), now)), vec!["b", "a"]);
    }

    #[test]
    fn test_boundary_is_strictly_greater() {
        let now = Utc::now();
        let runs = vec![
            run("new", 2, 0, RunStatus::Success, now),
            run("edge", 1, 7, RunStatus::Success, now),
        ];
        assert!(select_expired(&runs, &policy(7), now).is_empty());
    }

    #[test]
    fn test_failed_runs_are_not_swept() {
        let now = Utc::now();
        let runs = vec![
            run("new", 2, 0, RunStatus::Success, now),
            run("broken", 1, 30, RunStatus::Failed, now),
        ];
        assert!(select_expired(&runs, &policy(1), now).is_empty());
    }
}
