use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Outbound event-bus payload (spec.md §6: `{type, data, timestamp}` JSON
/// objects, delivered to subscribers grouped by user-room/account-room).
/// The WebSocket transport that actually fans these out to subscribers is
/// an out-of-scope external collaborator (§1); this is the shape it would
/// receive from [`crate`] consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Routing key: `None` broadcasts to every subscriber, `Some(id)` scopes
    /// to one account-room.
    pub account_room: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TransactionUpdated,
    TransactionDeleted,
    AdvertisementCreated,
    AdvertisementUpdated,
    AdvertisementDeleted,
    AccountStatusChange,
    InitializationProgress,
    StatsUpdate,
    OperatorAlert,
}
