use crate::ids::{ReceiptId, TransactionId};
use crate::money::Money;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Structured fields extracted from a bank-transfer PDF receipt, per
/// spec.md §4.9.1. All fields are required for a successful parse; a parser
/// that can't fill one of these reports a diagnostic instead of guessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptFields {
    pub datetime: OffsetDateTime,
    pub total: Money,
    pub amount: Money,
    /// Zero if the document says "без комиссии" (no commission).
    pub commission: Money,
    pub status: String,
    pub transfer_type: String,
    pub sender_name: String,
    pub sender_account: String,
    pub recipient_name: String,
    /// Starts with `+7`.
    pub recipient_phone: String,
    pub recipient_bank: String,
    pub recipient_card: String,
    pub operation_id: String,
    pub sbp_code: String,
    pub receipt_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub source_email_id: String,
    pub file_path: String,
    /// `None` until parsing succeeds.
    pub fields: Option<ReceiptFields>,
    pub processed: bool,
    pub linked_transaction_id: Option<TransactionId>,
    /// Hash of the source file, used to avoid re-parsing an unchanged
    /// attachment after a failed parse (§7: "retried only if the file
    /// changes").
    pub file_hash: String,
}
