//! Event Bus (C10): publishes state-change events to subscribers, grouped
//! by user-room/account-room (spec.md §6). The WebSocket transport that
//! would fan these out to browser clients is an out-of-scope external
//! collaborator (§1); this is the publishing side of that contract, played
//! by a `tokio::sync::broadcast` channel the way `projection.rs` plays the
//! same role with `watch` channels for its feeds -- broadcast fits better
//! here because events are a log, not a latest-value snapshot.

use model::{Event, EventKind};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, kind: EventKind, data: serde_json::Value, account_room: Option<String>) {
        let event = Event {
            kind,
            data,
            timestamp: time::OffsetDateTime::now_utc(),
            account_room,
        };
        // No subscribers is routine (e.g. headless runs, tests); the
        // return value only tells us whether anyone would have seen it.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
