//! Release Engine (C8), per spec.md §4.10.

use crate::account_registry::AccountRegistry;
use crate::event_bus::EventBus;
use crate::store::Store;
use crate::transaction_fsm;
use model::{AdvertisementStatus, FailureReason, TransactionStatus};
use std::sync::Arc;
use tracing::{info, warn};

pub struct ReleaseEngine {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    events: Arc<EventBus>,
}

impl ReleaseEngine {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            registry,
            events,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        for tx in self.store.list_non_terminal_transactions().await? {
            if tx.status != TransactionStatus::CheckReceived {
                continue;
            }
            self.release(tx.id).await?;
        }
        Ok(())
    }

    async fn release(&self, transaction_id: model::TransactionId) -> anyhow::Result<()> {
        let Some(tx) = self.store.find_transaction(transaction_id).await? else {
            return Ok(());
        };
        let Some(order_id) = &tx.order_id else {
            warn!(%transaction_id, "check_received transaction has no order id; cannot release");
            return Ok(());
        };
        let Some(ad) = self.store.find_advertisement(tx.advertisement_id).await? else {
            return Ok(());
        };

        let (failure_reason, released) = match self.registry.client_x(ad.account_id).await {
            Some(client) => match client.release_order(order_id).await {
                Ok(()) => (None, true),
                Err(err) => {
                    warn!(%transaction_id, error = %err, "release call failed");
                    (Some(FailureReason::ReleaseApiError), false)
                }
            },
            None => (Some(FailureReason::ReleaseApiError), false),
        };

        // The fiat side is already settled from the operator's perspective
        // regardless of whether the release call itself succeeded -- only
        // the downstream advertisement cleanup depends on it.
        let applied = transaction_fsm::transition(
            self.store.as_ref(),
            &self.events,
            transaction_id,
            TransactionStatus::CheckReceived,
            TransactionStatus::Completed,
            failure_reason,
        )
        .await?;

        if applied && released {
            self.store
                .update_advertisement_status(ad.id, AdvertisementStatus::Deleted)
                .await?;
        }
        if applied {
            info!(%transaction_id, released, "transaction completed");
        }
        Ok(())
    }
}
