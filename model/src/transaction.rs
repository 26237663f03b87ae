use crate::ids::{AdvertisementId, PayoutId, TransactionId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The unit of work: exactly one Payout, one Advertisement, and (after
/// discovery) one Platform-X order (spec.md §3, invariant I1).
///
/// `status` only ever moves forward through [`TransactionStatus`]'s allowed
/// edges (I4); the compare-and-swap enforcing that lives in
/// `daemon::transaction_fsm` because it needs the store, not because the
/// rule itself is anything but a property of this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub payout_id: PayoutId,
    pub advertisement_id: AdvertisementId,
    pub order_id: Option<String>,
    pub status: TransactionStatus,
    pub chat_step: u32,
    pub failure_reason: Option<FailureReason>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    ChatStarted,
    WaitingPayment,
    PaymentReceived,
    CheckReceived,
    Completed,
    CancelledByCounterparty,
    Failed,
    Stupid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    RetryBudgetExhausted,
    AmountMismatch,
    ReleaseApiError,
    OperatorForced,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed
                | TransactionStatus::Failed
                | TransactionStatus::CancelledByCounterparty
                | TransactionStatus::Stupid
        )
    }

    /// Allowed forward edges per spec.md §4.3's transition table. A
    /// transition not found here is rejected by the caller regardless of
    /// what the store's CAS would have allowed -- this is the single source
    /// of truth for "which edges exist", the CAS is only about concurrency.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, ChatStarted) => true,
            (Pending, WaitingPayment) => true,
            (ChatStarted, WaitingPayment) => true,
            (WaitingPayment, PaymentReceived) => true,
            (WaitingPayment, CheckReceived) => true,
            (PaymentReceived, CheckReceived) => true,
            (CheckReceived, Completed) => true,
            (_, CancelledByCounterparty) => true,
            (_, Failed) => true,
            (_, Stupid) => true,
            _ => false,
        }
    }
}
