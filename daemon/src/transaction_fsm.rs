//! Transaction state machine (core of C3-C9), per spec.md §4.3.
//!
//! A free function used by every component that moves a transaction
//! forward, rather than a method on an actor -- there's no owning actor,
//! the store is the single source of truth (§3's "Ownership").

use crate::event_bus::EventBus;
use crate::store::Store;
use model::{FailureReason, Money, TransactionId, TransactionStatus};
use tracing::warn;

/// Applies `expected -> next` under CAS. Returns `Ok(false)` -- not an error
/// -- when the transaction was not in `expected` status; per spec.md "A
/// transition that finds an unexpected status aborts without error".
///
/// Rejects transitions `TransactionStatus::can_transition_to` disallows
/// before ever touching the store, so a programming error never reaches the
/// database as a silently-ignored no-op.
pub async fn transition(
    store: &dyn Store,
    events: &EventBus,
    id: TransactionId,
    expected: TransactionStatus,
    next: TransactionStatus,
    failure_reason: Option<FailureReason>,
) -> crate::store::Result<bool> {
    if !expected.can_transition_to(next) {
        warn!(
            transaction_id = %id,
            ?expected,
            ?next,
            "rejected disallowed transition"
        );
        return Ok(false);
    }

    let applied = store
        .cas_transition(id, expected, next, failure_reason)
        .await?;

    if applied {
        events.publish(
            model::EventKind::TransactionUpdated,
            serde_json::json!({
                "transaction_id": id.to_string(),
                "status": format!("{next:?}"),
            }),
            None,
        );
    }

    Ok(applied)
}

/// Amount-mismatch guard (spec.md §4.7), shared by C5 and C6: any code path
/// that observes `order.amount` against `payout.amount` calls this before
/// trusting the order. A mismatch within one fiat unit is tolerated (I2);
/// beyond that it's an operator alert, not a silent transition.
pub fn check_amount_match(events: &EventBus, transaction_id: TransactionId, payout_amount: Money, order_amount: Money) -> bool {
    if payout_amount.abs_diff(order_amount) <= 1 {
        return true;
    }
    warn!(
        %transaction_id,
        payout_amount = %payout_amount,
        order_amount = %order_amount,
        "amount mismatch between payout and order"
    );
    events.publish(
        model::EventKind::OperatorAlert,
        serde_json::json!({
            "transaction_id": transaction_id.to_string(),
            "reason": "amount_mismatch",
            "payout_amount": payout_amount.minor_units(),
            "order_amount": order_amount.minor_units(),
        }),
        None,
    );
    false
}
