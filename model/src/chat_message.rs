use crate::ids::{ChatMessageId, TransactionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    Us,
    Them,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatContentType {
    Text,
    Image,
    Pdf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: ChatMessageId,
    pub transaction_id: TransactionId,
    /// Unique per external system (spec.md §3); used to dedupe and to make
    /// outgoing sends idempotent across restarts (§4.8).
    pub external_message_id: String,
    pub sender: Sender,
    pub body: String,
    pub content_type: ChatContentType,
    pub sent_at: OffsetDateTime,
    pub processed: bool,
}
