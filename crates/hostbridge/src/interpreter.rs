use hostbridge_protocol::{InboundFrame, ProgressPayload, ProgressStatus, RequestId, TerminalOutcome};
use tokio::sync::broadcast;

use crate::correlator::Correlator;
use crate::error::BridgeError;

/// A progress update for one in-flight request, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub request_id: RequestId,
    pub payload: ProgressPayload,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Resolved(RequestId),
    Rejected(RequestId),
    Extended(RequestId),
    /// Carries an id that matched nothing pending.
    Unmatched(Option<RequestId>),
    Broadcast,
    Malformed,
}

/// Routes inbound frames to the correlator and progress subscribers.
#[derive(Clone)]
pub struct ProgressInterpreter {
    correlator: Correlator,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressInterpreter {
    pub fn new(correlator: Correlator, buffer: usize) -> Self {
        let (progress_tx, _) = broadcast::channel(buffer.max(1));
        Self {
            correlator,
            progress_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub fn handle(&self, text: &str) -> Disposition {
        match InboundFrame::parse(text) {
            Ok(frame) => self.apply(frame),
            Err(e) => {
                tracing::warn!(err = %e, len = text.len(), "dropping malformed frame");
                Disposition::Malformed
            }
        }
    }

    pub fn apply(&self, frame: InboundFrame) -> Disposition {
        match frame {
            InboundFrame::Progress { id, payload } => {
                if !self.correlator.extend(&id) {
                    tracing::debug!(id = %id, status = %payload.status, "progress for unknown request");
                    return Disposition::Unmatched(Some(id));
                }
                log_progress(&id, &payload);
                // No subscribers is fine.
                let _ = self.progress_tx.send(ProgressEvent {
                    request_id: id.clone(),
                    payload,
                });
                Disposition::Extended(id)
            }
            InboundFrame::Terminal { id, outcome } => {
                let (outcome, resolved) = match outcome {
                    TerminalOutcome::Result(value) => (Ok(value), true),
                    TerminalOutcome::Error(message) => (Err(BridgeError::HostError(message)), false),
                };
                if !self.correlator.settle(&id, outcome) {
                    tracing::info!(id = %id, "terminal frame for unknown request");
                    return Disposition::Unmatched(Some(id));
                }
                if resolved {
                    Disposition::Resolved(id)
                } else {
                    Disposition::Rejected(id)
                }
            }
            InboundFrame::Broadcast(value) => {
                tracing::info!(frame = %value, "received broadcast");
                Disposition::Broadcast
            }
        }
    }
}

fn log_progress(id: &str, payload: &ProgressPayload) {
    match payload.status {
        ProgressStatus::Error => tracing::warn!(
            id = %id,
            command = %payload.command_type,
            progress = payload.progress,
            message = %payload.message,
            "command reported an error"
        ),
        _ if payload.is_finished() => tracing::info!(
            id = %id,
            command = %payload.command_type,
            total = payload.total_items,
            "command completed, waiting for final result"
        ),
        _ => tracing::info!(
            id = %id,
            command = %payload.command_type,
            status = %payload.status,
            progress = payload.progress,
            chunk = ?payload.current_chunk,
            chunks = ?payload.total_chunks,
            message = %payload.message,
            "progress"
        ),
    }
}
