//! Backup policies and the configuration registry
//!
//! The registry exclusively owns [`BackupPolicy`] records. Policies are never
//! deleted, only disabled, so historical runs always resolve to a policy.
//! Changes that affect timing (enabling, disabling, a new schedule) are
//! published as [`PolicyChange`] events for the scheduler.

use std::collections::{HashMap, HashSet};
use std::fmt;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{EngineError, Result};

lazy_static! {
    /// Policy ids become part of artifact file names
    static ref POLICY_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap();
}

/// Export scope strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// All rows
    Full,
    /// Rows changed since the last successful run of any kind
    Incremental,
    /// Rows changed since the last successful full run
    Differential,
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupKind::Full => write!(f, "full"),
            BackupKind::Incremental => write!(f, "incremental"),
            BackupKind::Differential => write!(f, "differential"),
        }
    }
}

fn default_schedule() -> String {
    "daily".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_true() -> bool {
    true
}

/// What to back up, how often, and how long to keep it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: String,
    pub name: String,
    pub kind: BackupKind,
    /// Cadence expression, see [`crate::cadence::Cadence`]
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Days a superseded successful run is kept; 0 deletes it at the next sweep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub encrypt: bool,
    /// Tables to export, in order
    pub tables: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl BackupPolicy {
    /// Create an enabled daily policy with a 7 day retention
    pub fn new<I, S>(id: impl Into<String>, name: impl Into<String>, kind: BackupKind, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            schedule: default_schedule(),
            retention_days: default_retention_days(),
            compress: false,
            encrypt: false,
            tables: tables.into_iter().map(Into::into).collect(),
            enabled: true,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypt = enabled;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check the policy invariants
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidPolicy("policy id cannot be empty".into()));
        }
        if !POLICY_ID.is_match(&self.id) {
            return Err(EngineError::InvalidPolicy(format!(
                "policy id '{}' may only contain letters, digits, '.', '_' and '-', \
                 must start with a letter or digit and be at most 128 characters",
                self.id
            )));
        }
        if self.tables.is_empty() {
            return Err(EngineError::InvalidPolicy(format!(
                "policy '{}' must name at least one table",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            if table.trim().is_empty() {
                return Err(EngineError::InvalidPolicy(format!(
                    "policy '{}' contains an empty table name",
                    self.id
                )));
            }
            if !seen.insert(table.as_str()) {
                return Err(EngineError::InvalidPolicy(format!(
                    "policy '{}' lists table '{}' more than once",
                    self.id, table
                )));
            }
        }

        if self.schedule.trim().is_empty() {
            return Err(EngineError::InvalidPolicy(format!(
                "policy '{}' has an empty schedule",
                self.id
            )));
        }

        Ok(())
    }
}

/// Partial update: every `Some` field replaces the stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub kind: Option<BackupKind>,
    pub schedule: Option<String>,
    pub retention_days: Option<u32>,
    pub compress: Option<bool>,
    pub encrypt: Option<bool>,
    pub tables: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

impl PolicyUpdate {
    fn apply(self, policy: &mut BackupPolicy) {
        if let Some(name) = self.name {
            policy.name = name;
        }
        if let Some(kind) = self.kind {
            policy.kind = kind;
        }
        if let Some(schedule) = self.schedule {
            policy.schedule = schedule;
        }
        if let Some(days) = self.retention_days {
            policy.retention_days = days;
        }
        if let Some(compress) = self.compress {
            policy.compress = compress;
        }
        if let Some(encrypt) = self.encrypt {
            policy.encrypt = encrypt;
        }
        if let Some(tables) = self.tables {
            policy.tables = tables;
        }
        if let Some(enabled) = self.enabled {
            policy.enabled = enabled;
        }
    }
}

/// Timing-relevant change to a policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    /// A new policy was registered
    Created(String),
    /// A policy was enabled or disabled
    EnabledChanged { policy_id: String, enabled: bool },
    /// A policy's cadence expression changed
    ScheduleChanged(String),
}

impl PolicyChange {
    pub fn policy_id(&self) -> &str {
        match self {
            PolicyChange::Created(id) | PolicyChange::ScheduleChanged(id) => id,
            PolicyChange::EnabledChanged { policy_id, .. } => policy_id,
        }
    }
}

/// Registry of backup policies
pub struct PolicyRegistry {
    policies: RwLock<HashMap<String, BackupPolicy>>,
    changes: broadcast::Sender<PolicyChange>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            policies: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Subscribe to timing-relevant policy changes
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    /// Get a policy by id
    pub fn get(&self, id: &str) -> Result<BackupPolicy> {
        self.policies
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::PolicyNotFound(id.to_string()))
    }

    /// All policies sorted by id
    pub fn list(&self) -> Vec<BackupPolicy> {
        let mut policies: Vec<_> = self.policies.read().values().cloned().collect();
        policies.sort_by(|a, b| a.id.cmp(&b.id));
        policies
    }

    /// Insert or replace a policy after validating it
    pub fn upsert(&self, policy: BackupPolicy) -> Result<BackupPolicy> {
        policy.validate()?;

        let change = {
            let mut policies = self.policies.write();
            let change = match policies.get(&policy.id) {
                None => Some(PolicyChange::Created(policy.id.clone())),
                Some(old) => diff(old, &policy),
            };
            policies.insert(policy.id.clone(), policy.clone());
            change
        };

        info!(policy_id = %policy.id, kind = %policy.kind, enabled = policy.enabled, "Policy saved");
        self.publish(change);
        Ok(policy)
    }

    /// Apply a partial update to an existing policy
    pub fn update(&self, id: &str, update: PolicyUpdate) -> Result<BackupPolicy> {
        let (policy, change) = {
            let mut policies = self.policies.write();
            let current = policies
                .get(id)
                .ok_or_else(|| EngineError::PolicyNotFound(id.to_string()))?;

            let mut updated = current.clone();
            update.apply(&mut updated);
            updated.id = id.to_string();
            updated.validate()?;

            let change = diff(current, &updated);
            policies.insert(id.to_string(), updated.clone());
            (updated, change)
        };

        info!(policy_id = %id, "Policy updated");
        self.publish(change);
        Ok(policy)
    }

    /// Enable or disable a policy
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<BackupPolicy> {
        self.update(
            id,
            PolicyUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    fn publish(&self, change: Option<PolicyChange>) {
        if let Some(change) = change {
            debug!(?change, "Publishing policy change");
            // No subscribers is fine: nothing is scheduled yet.
            let _ = self.changes.send(change);
        }
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn diff(old: &BackupPolicy, new: &BackupPolicy) -> Option<PolicyChange> {
    if old.enabled != new.enabled {
        Some(PolicyChange::EnabledChanged {
            policy_id: new.id.clone(),
            enabled: new.enabled,
        })
    } else if old.schedule != new.schedule {
        Some(PolicyChange::ScheduleChanged(new.id.clone()))
    } else {
        None
    }
}
