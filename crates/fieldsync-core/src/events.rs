//! Engine events
//!
//! Observers (the UI layer) subscribe to a broadcast stream of
//! [`EngineEvent`]s. Emitting never blocks and never fails: a slow or
//! missing subscriber only loses events, it cannot stall a save.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::conflict::ConflictRecord;
use crate::error::ErrorKind;
use crate::models::RecordId;
use crate::network::NetworkState;
use crate::sync::{SyncProgress, SyncReport};

/// Default capacity of the event channel
const EVENT_CAPACITY: usize = 256;

/// Events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A save request started committing
    SaveStarted { record_id: RecordId, revision: u64 },
    /// A save was committed and confirmed by the remote
    SaveSucceeded { record_id: RecordId, attempts: u32 },
    /// A save failed terminally
    SaveFailed {
        record_id: RecordId,
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },
    /// A committed change was put on the pending queue
    ChangeQueued { record_id: RecordId, attempts: u32 },
    /// A sync pass started
    SyncStarted,
    /// A sync batch finished
    SyncProgress(SyncProgress),
    /// A sync pass completed
    SyncCompleted(SyncReport),
    /// A sync pass aborted
    SyncFailed {
        kind: ErrorKind,
        completed_batches: usize,
        remaining_batches: usize,
        message: String,
    },
    /// Concurrent edits that need a user decision
    ConflictRequiresManualResolution(ConflictRecord),
    /// Reachability changed
    NetworkChanged { old: NetworkState, new: NetworkState },
}

/// Broadcast bus for engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to current subscribers
    pub fn emit(&self, event: EngineEvent) {
        trace!(?event, "Emitting engine event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::SyncStarted);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let record_id = RecordId::new("r1").unwrap();

        bus.emit(EngineEvent::SaveStarted {
            record_id: record_id.clone(),
            revision: 1,
        });
        bus.emit(EngineEvent::SaveSucceeded {
            record_id,
            attempts: 1,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::SaveStarted { revision: 1, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            EngineEvent::SaveSucceeded { attempts: 1, .. }
        ));
    }

    #[test]
    fn test_event_json_shape() {
        let event = EngineEvent::SaveFailed {
            record_id: RecordId::new("r9").unwrap(),
            kind: ErrorKind::PermanentRemote,
            attempts: 1,
            message: "quota".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "save_failed");
        assert_eq!(json["kind"], "permanent_remote");
        assert_eq!(json["record_id"], "r9");
    }
}
