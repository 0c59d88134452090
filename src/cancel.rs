//! Cancellation signals for in-flight runs
//!
//! A run registers right after it is created and closes its slot once its
//! pipeline has stopped, just before it is finalized. A request that arrives
//! before registration is kept and picked up by `register`; a request that
//! arrives after `close` is refused.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::info;

enum Slot {
    Open(watch::Sender<bool>),
    Closed,
}

/// Registry of cancellable runs keyed by run id
#[derive(Default)]
pub struct RunCancellations {
    slots: DashMap<String, Slot>,
}

impl RunCancellations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and get the signal it should watch
    pub fn register(&self, run_id: &str) -> CancelSignal {
        let slot = self
            .slots
            .entry(run_id.to_string())
            .or_insert_with(|| Slot::Open(watch::channel(false).0));
        let rx = match slot.value() {
            Slot::Open(tx) => tx.subscribe(),
            // Run ids are unique; a closed slot only pends.
            Slot::Closed => watch::channel(false).1,
        };
        CancelSignal { rx }
    }

    /// Request cancellation; returns false once the run has closed its slot
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.slots.entry(run_id.to_string()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Open(tx) => {
                    info!(run_id, "Cancellation requested");
                    tx.send_replace(true);
                    true
                }
                Slot::Closed => false,
            },
            Entry::Vacant(slot) => {
                info!(run_id, "Cancellation requested before registration");
                slot.insert(Slot::Open(watch::channel(true).0));
                true
            }
        }
    }

    /// Stop accepting requests for a run; returns whether one was made
    pub fn close(&self, run_id: &str) -> bool {
        match self.slots.get_mut(run_id) {
            Some(mut slot) => {
                let requested = matches!(slot.value(), Slot::Open(tx) if *tx.borrow());
                *slot = Slot::Closed;
                requested
            }
            None => false,
        }
    }

    /// Drop a request made for a run that was never registered
    pub fn discard(&self, run_id: &str) {
        self.slots
            .remove_if(run_id, |_, slot| matches!(slot, Slot::Open(tx) if tx.receiver_count() == 0));
    }

    /// Forget a finalized run
    pub fn release(&self, run_id: &str) {
        self.slots.remove(run_id);
    }
}

/// Receiving side of a run's cancellation flag
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Resolves once cancellation is requested; pends forever otherwise
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let registry = RunCancellations::new();
        let mut signal = registry.register("r1");

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        assert!(registry.cancel("r1"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.close("r1"));
    }

    #[tokio::test]
    async fn test_request_before_register_is_kept() {
        let registry = RunCancellations::new();
        assert!(registry.cancel("r1"));

        let mut signal = registry.register("r1");
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .unwrap();
        assert!(registry.close("r1"));
    }

    #[tokio::test]
    async fn test_closed_run_refuses_requests() {
        let registry = RunCancellations::new();
        let mut signal = registry.register("r1");
        assert!(!registry.close("r1"));
        assert!(!registry.cancel("r1"));

        let pending = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(pending.is_err());

        registry.release("r1");
        assert!(!registry.close("r1"));
    }

    #[test]
    fn test_discard_only_drops_unregistered_requests() {
        let registry = RunCancellations::new();
        assert!(registry.cancel("orphan"));
        registry.discard("orphan");
        assert!(!registry.close("orphan"));

        let _signal = registry.register("live");
        assert!(registry.cancel("live"));
        registry.discard("live");
        assert!(registry.close("live"));
    }
}
