use crate::ids::{AccountId, PayoutId};
use crate::money::Money;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A single fiat disbursement request surfaced by Platform-D.
///
/// Immutable after acceptance except for `external_status` updates (spec.md
/// §3). `amount`/`recipient_*` are only known once `accepted` is `true` --
/// Platform-D hides them until the accept call reveals them (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub account_id: AccountId,
    pub amount: Money,
    pub recipient_identifier: String,
    pub bank_name: String,
    pub recipient_name: String,
    pub external_status: i32,
    pub accepted_at: Option<OffsetDateTime>,
    pub decision: AcceptanceDecision,
    /// Fields Platform-D sent that we don't model explicitly, kept for
    /// diagnostics (Design Notes §9: "unknown fields are preserved in a raw
    /// blob").
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptanceDecision {
    Pending,
    Accepted,
    Rejected,
}

impl Payout {
    /// True once `accept()` has revealed amount/recipient detail and we
    /// persisted it (§4.4). A zero/missing revealed amount is still saved,
    /// per spec.md's "no silent substitution" -- callers must check this
    /// explicitly rather than assume a non-zero amount.
    pub fn is_accepted(&self) -> bool {
        self.decision == AcceptanceDecision::Accepted
    }
}
