//! Cancellation / Reissue (C9), per spec.md §4.11.

use crate::account_registry::AccountRegistry;
use crate::event_bus::EventBus;
use crate::store::Store;
use crate::transaction_fsm;
use model::{FailureReason, Transaction, TransactionStatus};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

const INACTIVITY_TIMEOUT: Duration = Duration::minutes(30);
const ORDER_CANCELLED_STATUS: i32 = 40;

pub struct CancellationReissue {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    events: Arc<EventBus>,
}

impl CancellationReissue {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        for tx in self.store.list_non_terminal_transactions().await? {
            self.check(tx).await?;
        }
        Ok(())
    }

    async fn check(&self, tx: Transaction) -> anyhow::Result<()> {
        let Some(ad) = self.store.find_advertisement(tx.advertisement_id).await? else {
            return Ok(());
        };

        let cancelled_on_platform = match (&tx.order_id, self.registry.client_x(ad.account_id).await) {
            (Some(order_id), Some(client)) => match client.order_info(order_id).await {
                Ok(order) => order.status == ORDER_CANCELLED_STATUS,
                Err(err) => {
                    warn!(transaction_id = %tx.id, error = %err, "order_info failed while checking for cancellation");
                    false
                }
            },
            _ => false,
        };

        let target = if cancelled_on_platform {
            Some((TransactionStatus::CancelledByCounterparty, None))
        } else if OffsetDateTime::now_utc() - tx.updated_at > INACTIVITY_TIMEOUT {
            Some((TransactionStatus::Failed, Some(FailureReason::RetryBudgetExhausted)))
        } else {
            None
        };

        let Some((next_status, failure_reason)) = target else {
            return Ok(());
        };

        let applied = transaction_fsm::transition(
            self.store.as_ref(),
            &self.events,
            tx.id,
            tx.status,
            next_status,
            failure_reason,
        )
        .await?;
        if !applied {
            return Ok(());
        }

        if let Some(client) = self.registry.client_x(ad.account_id).await {
            if let Err(err) = client.cancel_ad(&ad.platform_ad_id).await {
                warn!(transaction_id = %tx.id, error = %err, "best-effort ad cancellation failed");
            }
        }

        // Foreign-key order: chat messages, then the transaction, then the
        // advertisement. Deleting the transaction row is what makes the
        // payout reappear in C4's queue.
        self.store.delete_chat_messages(tx.id).await?;
        self.store.delete_transaction(tx.id).await?;
        self.store.delete_advertisement(ad.id).await?;
        info!(transaction_id = %tx.id, ?next_status, "transaction cancelled and reissue queued");
        Ok(())
    }
}
