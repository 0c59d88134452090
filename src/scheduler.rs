//! Policy timers
//!
//! Each enabled policy gets its own timer task. When the timer fires, the
//! handler runs on a freshly spawned task, so a slow backup never delays the
//! next tick or another policy's timer. A watcher task follows registry
//! changes and re-arms the affected timer.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cadence::{Cadence, ScheduleParseWarning};
use crate::policy::{BackupPolicy, PolicyRegistry};

/// Receives due ticks
#[async_trait]
pub trait DueHandler: Send + Sync {
    /// Called on its own task each time `policy_id`'s timer fires
    async fn on_due(&self, policy_id: &str);
}

struct TimerHandle {
    task: JoinHandle<()>,
    cadence: Cadence,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One timer per enabled policy
pub struct Scheduler {
    registry: Arc<PolicyRegistry>,
    handler: Arc<dyn DueHandler>,
    default_cadence: Cadence,
    timers: DashMap<String, TimerHandle>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        handler: Arc<dyn DueHandler>,
        default_cadence: Cadence,
    ) -> Self {
        Self {
            registry,
            handler,
            default_cadence,
            timers: DashMap::new(),
            watcher: Mutex::new(None),
        }
    }

    /// Start following registry changes and arm every enabled policy
    ///
    /// Returns the schedules that fell back to the default cadence.
    pub fn start_all(self: &Arc<Self>) -> Vec<(String, ScheduleParseWarning)> {
        self.watch_registry();

        let mut warnings = Vec::new();
        for policy in self.registry.list() {
            if let Some(warning) = self.start(&policy) {
                warnings.push((policy.id.clone(), warning));
            }
        }
        info!(timers = self.timers.len(), "Scheduler started");
        warnings
    }

    /// Begin firing `on_due(policy.id)`; disabled policies are stopped instead
    pub fn start(&self, policy: &BackupPolicy) -> Option<ScheduleParseWarning> {
        if !policy.enabled {
            self.stop(&policy.id);
            return None;
        }

        let (cadence, warning) = Cadence::parse_or_default(&policy.schedule, self.default_cadence);
        let next_fire = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run_timer(
            policy.id.clone(),
            cadence,
            self.handler.clone(),
            next_fire.clone(),
        ));

        debug!(policy_id = %policy.id, %cadence, "Timer armed");
        // Replacing an existing handle drops it, which aborts the old timer.
        self.timers.insert(
            policy.id.clone(),
            TimerHandle {
                task,
                cadence,
                next_fire,
            },
        );
        warning
    }

    /// Cancel future ticks for a policy; in-flight runs are unaffected
    pub fn stop(&self, policy_id: &str) -> bool {
        let stopped = self.timers.remove(policy_id).is_some();
        if stopped {
            debug!(policy_id, "Timer stopped");
        }
        stopped
    }

    /// Re-read a policy from the registry and re-arm or stop its timer
    pub fn reschedule(&self, policy_id: &str) -> Option<ScheduleParseWarning> {
        match self.registry.get(policy_id) {
            Ok(policy) => self.start(&policy),
            Err(_) => {
                self.stop(policy_id);
                None
            }
        }
    }

    /// Whether a timer is armed for `policy_id`
    pub fn is_scheduled(&self, policy_id: &str) -> bool {
        self.timers.contains_key(policy_id)
    }

    /// Cadence in effect for `policy_id`
    pub fn cadence_of(&self, policy_id: &str) -> Option<Cadence> {
        self.timers.get(policy_id).map(|t| t.cadence)
    }

    /// Earliest upcoming tick across all policies
    pub fn next_scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.timers.iter().filter_map(|t| *t.next_fire.lock()).min()
    }

    /// Stop every timer and the registry watcher
    pub fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.timers.clear();
        info!("Scheduler stopped");
    }

    fn watch_registry(self: &Arc<Self>) {
        let mut changes = self.registry.subscribe();
        let scheduler: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                let event = changes.recv().await;
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                match event {
                    Ok(change) => {
                        debug!(?change, "Rescheduling after policy change");
                        scheduler.reschedule(change.policy_id());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed policy changes, re-arming every timer");
                        for policy in scheduler.registry.list() {
                            scheduler.start(&policy);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.watcher.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

async fn run_timer(
    policy_id: String,
    cadence: Cadence,
    handler: Arc<dyn DueHandler>,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
) {
    loop {
        let now = Utc::now();
        let next = cadence.next_fire_time(now);
        *next_fire.lock() = Some(next);

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        debug!(policy_id = %policy_id, "Policy due");
        let handler = handler.clone();
        let id = policy_id.clone();
        tokio::spawn(async move {
            handler.on_due(&id).await;
        });
    }
}
