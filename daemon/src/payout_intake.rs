//! Payout Intake (C3), per spec.md §4.4.

use crate::account_registry::AccountRegistry;
use crate::platform::platform_d::RawPayout;
use crate::store::Store;
use async_trait::async_trait;
use model::{AcceptanceDecision, AccountId, Money, Payout, PayoutId, PlatformTag};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

const STATUS_PENDING: i32 = 4;
const STATUS_ACCEPTED_WAITING: i32 = 5;

/// Manual-mode prompt, injected so tests and auto mode don't need an
/// interactive terminal (Design Notes §9: "Manual-mode prompts are an
/// optional injected decision procedure; the default implementation
/// auto-approves").
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, payout: &RawPayout) -> bool;
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(&self, _payout: &RawPayout) -> bool {
        true
    }
}

pub struct PayoutIntake {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    gate: Arc<dyn ApprovalGate>,
}

impl PayoutIntake {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, gate: Arc<dyn ApprovalGate>) -> Self {
        Self {
            store,
            registry,
            gate,
        }
    }

    /// `work_acceptor` scheduler task: polls for new pending payouts and
    /// accepts them (spec.md §4.1's boot sequence names this separately
    /// from `payouts_sync`).
    pub async fn run(&self) -> anyhow::Result<()> {
        for account in self.store.list_accounts(PlatformTag::PlatformD).await? {
            let Some(client) = self.registry.client_d(account.id).await else {
                continue;
            };

            for raw in client.list_payouts(STATUS_PENDING, 1).await? {
                if self
                    .store
                    .find_payout(&PayoutId::new(raw.id.clone()))
                    .await?
                    .is_some()
                {
                    continue;
                }
                if !self.gate.approve(&raw).await {
                    info!(payout_id = %raw.id, "operator rejected payout");
                    continue;
                }
                match client.accept(&raw.id).await {
                    Ok(revealed) => self.persist_accepted(account.id, revealed).await?,
                    Err(err) => warn!(payout_id = %raw.id, error = %err, "accept call failed"),
                }
            }
        }
        Ok(())
    }

    /// `payouts_sync` scheduler task: resyncs already-accepted payouts so a
    /// restart does not lose context (spec.md §4.4: "so restarts do not
    /// lose context").
    pub async fn sync(&self) -> anyhow::Result<()> {
        for account in self.store.list_accounts(PlatformTag::PlatformD).await? {
            let Some(client) = self.registry.client_d(account.id).await else {
                continue;
            };
            for raw in client.list_payouts(STATUS_ACCEPTED_WAITING, 1).await? {
                self.persist_accepted(account.id, raw).await?;
            }
        }
        Ok(())
    }

    async fn persist_accepted(&self, account_id: AccountId, raw: RawPayout) -> anyhow::Result<()> {
        let amount = raw.amount.unwrap_or(0);
        if amount == 0 {
            warn!(payout_id = %raw.id, "accepted payout revealed a zero or missing amount; saving as-is");
        }
        let existing = self.store.find_payout(&PayoutId::new(raw.id.clone())).await?;
        let payout = Payout {
            id: PayoutId::new(raw.id.clone()),
            account_id,
            amount: Money::from_minor_units(amount),
            recipient_identifier: raw.wallet.unwrap_or_default(),
            bank_name: raw.bank.unwrap_or_default(),
            recipient_name: raw.recipient_name.unwrap_or_default(),
            external_status: raw.status,
            accepted_at: existing
                .and_then(|p| p.accepted_at)
                .or(Some(OffsetDateTime::now_utc())),
            decision: AcceptanceDecision::Accepted,
            raw: raw.raw,
        };
        self.store.upsert_payout(&payout).await?;
        Ok(())
    }
}
