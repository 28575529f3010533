//! Pending-request table keyed by request id.
//!
//! Every entry is removed exactly once: by a terminal frame, by its timer, or
//! by a connection sweep. `DashMap::remove`/`remove_if` is the arbiter, so the
//! loser of any race finds nothing and does nothing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hostbridge_protocol::{HostCommand, RequestId};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{BridgeError, BridgeResult};

struct PendingRequest {
    command: HostCommand,
    responder: oneshot::Sender<BridgeResult<Value>>,
    timer: Option<AbortHandle>,
    /// Bumped on every rearm; a timer only fires for its own generation.
    generation: u64,
    sent_at: Instant,
    last_activity: Instant,
}

/// Handle returned to the caller that issued a request.
#[derive(Debug)]
pub struct Ticket {
    id: RequestId,
    rx: oneshot::Receiver<BridgeResult<Value>>,
}

impl Ticket {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn outcome(self) -> BridgeResult<Value> {
        self.rx.await.unwrap_or(Err(BridgeError::ConnectionClosed))
    }
}

#[derive(Clone)]
pub struct Correlator {
    pending: Arc<DashMap<RequestId, PendingRequest>>,
    inactivity: Duration,
}

impl Correlator {
    pub fn new(inactivity: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            inactivity,
        }
    }

    /// Track a new request whose timer expires after `timeout`.
    pub fn register(&self, id: RequestId, command: HostCommand, timeout: Duration) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                command,
                responder: tx,
                timer: None,
                generation: 0,
                sent_at: now,
                last_activity: now,
            },
        );
        self.arm(&id, 0, timeout);
        Ticket { id, rx }
    }

    /// Progress arrived for `id`: push its deadline out by the inactivity
    /// window. Returns false when the id is not pending.
    pub fn extend(&self, id: &str) -> bool {
        let generation = {
            let Some(mut entry) = self.pending.get_mut(id) else {
                return false;
            };
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.generation += 1;
            entry.last_activity = Instant::now();
            entry.generation
        };
        self.arm(id, generation, self.inactivity);
        true
    }

    /// Complete `id` with `outcome`. Returns false if it was already settled.
    pub fn settle(&self, id: &str, outcome: BridgeResult<Value>) -> bool {
        let Some((id, entry)) = self.pending.remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        tracing::debug!(
            id = %id,
            command = %entry.command,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "request settled"
        );
        let _ = entry.responder.send(outcome);
        true
    }

    /// Drop `id` without notifying its caller.
    pub fn discard(&self, id: &str) {
        if let Some((_, entry)) = self.pending.remove(id)
            && let Some(timer) = entry.timer
        {
            timer.abort();
        }
    }

    /// Reject every pending request with `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut swept = 0;
        for id in ids {
            if self.settle(&id, Err(BridgeError::ConnectionClosed)) {
                swept += 1;
            }
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn last_activity(&self, id: &str) -> Option<Instant> {
        self.pending.get(id).map(|e| e.last_activity)
    }

    fn arm(&self, id: &str, generation: u64, after: Duration) {
        let pending = Arc::clone(&self.pending);
        let key = id.to_string();
        let deadline = Instant::now() + after;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some((id, entry)) = pending.remove_if(&key, |_, e| e.generation == generation)
            else {
                return;
            };
            tracing::error!(
                id = %id,
                command = %entry.command,
                timeout_ms = after.as_millis() as u64,
                elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
                "request timed out"
            );
            let _ = entry.responder.send(Err(BridgeError::Timeout {
                command: entry.command.to_string(),
                id,
                timeout_ms: after.as_millis() as u64,
            }));
        });

        match self.pending.get_mut(id) {
            Some(mut entry) if entry.generation == generation => {
                entry.timer = Some(task.abort_handle());
            }
            _ => task.abort(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INACTIVITY: Duration = Duration::from_secs(60);
    const TIMEOUT: Duration = Duration::from_millis(120_000);

    async fn settle_tasks() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let correlator = Correlator::new(INACTIVITY);
        let start = Instant::now();
        let ticket = correlator.register("r1".into(), HostCommand::GetStyles, TIMEOUT);

        tokio::time::advance(Duration::from_millis(119_999)).await;
        settle_tasks().await;
        assert!(correlator.contains("r1"));

        let err = ticket.outcome().await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::Timeout {
                command: "get_styles".into(),
                id: "r1".into(),
                timeout_ms: 120_000,
            }
        );
        assert!(start.elapsed() >= TIMEOUT);
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_extends_liveness() {
        let correlator = Correlator::new(INACTIVITY);
        let start = Instant::now();
        let ticket = correlator.register("r1".into(), HostCommand::ScanTextNodes, TIMEOUT);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(correlator.extend("r1"));

        tokio::time::advance(Duration::from_secs(2)).await;
        settle_tasks().await;
        assert!(correlator.contains("r1"), "original deadline must not fire");

        let err = ticket.outcome().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 60_000, .. }));
        assert!(start.elapsed() >= Duration::from_secs(179));
    }

    #[tokio::test(start_paused = true)]
    async fn settles_exactly_once() {
        let correlator = Correlator::new(INACTIVITY);
        let ticket = correlator.register("r1".into(), HostCommand::Join, TIMEOUT);

        assert!(correlator.settle("r1", Ok(json!({"ok": true}))));
        assert!(!correlator.settle("r1", Err(BridgeError::HostError("late".into()))));
        assert!(!correlator.extend("r1"));
        assert_eq!(ticket.outcome().await.unwrap(), json!({"ok": true}));

        // The aborted timer must not resurrect anything.
        tokio::time::advance(TIMEOUT * 2).await;
        settle_tasks().await;
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_after_timeout_is_ignored() {
        let correlator = Correlator::new(INACTIVITY);
        let ticket = correlator.register("r1".into(), HostCommand::GetStyles, Duration::from_secs(1));
        assert!(ticket.outcome().await.is_err());
        assert!(!correlator.settle("r1", Ok(json!(1))));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_all_sweeps_everything() {
        let correlator = Correlator::new(INACTIVITY);
        let tickets: Vec<Ticket> = (0..4)
            .map(|i| correlator.register(format!("r{i}"), HostCommand::GetNodeInfo, TIMEOUT))
            .collect();
        assert_eq!(correlator.len(), 4);

        assert_eq!(correlator.fail_all(), 4);
        assert!(correlator.is_empty());
        for ticket in tickets {
            assert_eq!(ticket.outcome().await, Err(BridgeError::ConnectionClosed));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn discard_drops_silently() {
        let correlator = Correlator::new(INACTIVITY);
        let ticket = correlator.register("r1".into(), HostCommand::GetSelection, TIMEOUT);
        correlator.discard("r1");
        assert!(correlator.is_empty());
        // Sender dropped without a value.
        assert_eq!(ticket.outcome().await, Err(BridgeError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn extend_updates_last_activity() {
        let correlator = Correlator::new(INACTIVITY);
        let _ticket = correlator.register("r1".into(), HostCommand::ScanTextNodes, TIMEOUT);
        let first = correlator.last_activity("r1").unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        correlator.extend("r1");
        let second = correlator.last_activity("r1").unwrap();
        assert_eq!(second - first, Duration::from_secs(5));
    }
}
