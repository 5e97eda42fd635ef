//! # Engine Event Channel
//!
//! The engine has no user-visible failure surface of its own. Anything that
//! can be attributed to a single unit of work (one subscriber delivery, one
//! offline change, one pipeline run) is contained to that unit and surfaced
//! here as a structured event for the surrounding application (dashboard UI,
//! alerting) to render. Delivery uses a `tokio::sync::broadcast` channel so
//! any number of observers can attach and detach independently.

use tokio::sync::broadcast;
use uuid::Uuid;

/// Structured error/diagnostic events emitted by engine components.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A pipeline run aborted on fetch or transformation failure.
    PipelineError {
        pipeline_id: Uuid,
        pipeline_name: String,
        reason: String,
    },
    /// A data source fetch failed and the source was marked unhealthy.
    SourceUnhealthy {
        source_id: String,
        error_count: u64,
        reason: String,
    },
    /// A subscriber callback returned an error; delivery continued to the
    /// remaining subscribers.
    SubscriberCallbackError {
        subscription_id: Uuid,
        widget_key: String,
        reason: String,
    },
    /// A cached entry could not be decoded and was dropped (surfaced as a
    /// cache miss, never as corrupted data).
    CacheDecodeError { key: String, reason: String },
    /// An offline change lost a last-writer-wins comparison and was dropped.
    OfflineChangeDiscarded { widget_key: String },
    /// An offline change could not be applied; the batch continued.
    OfflineChangeFailed { widget_key: String, reason: String },
}

pub type EventSender = broadcast::Sender<EngineEvent>;
pub type EventReceiver = broadcast::Receiver<EngineEvent>;

/// Creates the engine-wide event channel.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Best-effort emit. A send error only means no observer is currently
/// attached, which is a valid state.
pub(crate) fn emit(tx: &EventSender, event: EngineEvent) {
    let _ = tx.send(event);
}
