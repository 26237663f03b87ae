//! Ad Placement (C4), per spec.md §4.5.

use crate::account_registry::AccountRegistry;
use crate::config::Config;
use crate::platform::platform_x::CreateAdRequest;
use crate::store::Store;
use model::{Advertisement, AdvertisementId, AdvertisementStatus, PlatformTag, Side, Transaction, TransactionId, TransactionStatus};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

pub struct AdPlacement {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    config: Config,
}

impl AdPlacement {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        for payout in self.store.list_accepted_payouts_without_transaction().await? {
            let Some(account) = self.pick_account_with_capacity().await? else {
                info!("no platform-x account with free ad slots; retrying next tick");
                return Ok(());
            };
            let Some(client) = self.registry.client_x(account).await else {
                continue;
            };

            let request = CreateAdRequest {
                side: "Sell",
                asset: "crypto".into(),
                fiat: "RUB".into(),
                price: self.config.bybit.ad_price.clone(),
                quantity: payout.amount.to_string(),
                min_amount: payout.amount.to_string(),
                max_amount: payout.amount.to_string(),
                payment_methods: self.config.bybit.payment_methods.clone(),
            };

            let platform_ad_id = match client.create_ad(&request).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(payout_id = %payout.id, error = %err, "ad creation failed");
                    continue;
                }
            };

            let ad = Advertisement {
                id: AdvertisementId::new(),
                platform_ad_id,
                account_id: account,
                side: Side::Sell,
                asset: "crypto".into(),
                fiat: "RUB".into(),
                unit_price: parse_price(&self.config.bybit.ad_price),
                quantity: payout.amount,
                min_amount: payout.amount,
                max_amount: payout.amount,
                payment_methods: self.config.bybit.payment_methods.iter().cloned().collect(),
                status: AdvertisementStatus::Online,
            };
            self.store.insert_advertisement(&ad).await?;

            let now = OffsetDateTime::now_utc();
            let tx = Transaction {
                id: TransactionId::new(),
                payout_id: payout.id.clone(),
                advertisement_id: ad.id,
                order_id: None,
                status: TransactionStatus::Pending,
                chat_step: 0,
                failure_reason: None,
                created_at: now,
                updated_at: now,
            };
            self.store.insert_transaction(&tx).await?;
            info!(payout_id = %payout.id, advertisement_id = %ad.id, "advertisement placed");
        }
        Ok(())
    }

    async fn pick_account_with_capacity(&self) -> anyhow::Result<Option<model::AccountId>> {
        for account in self.store.list_accounts(PlatformTag::PlatformX).await? {
            let count = self
                .store
                .count_active_advertisements_for_account(account.id)
                .await?;
            if count < self.config.bybit.max_ads_per_account as i64 {
                return Ok(Some(account.id));
            }
        }
        Ok(None)
    }
}

fn parse_price(raw: &str) -> model::Money {
    let minor = raw
        .parse::<f64>()
        .map(|v| (v * 100.0).round() as i64)
        .unwrap_or(0);
    model::Money::from_minor_units(minor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlatformXError;
    use crate::platform::platform_x::{PlatformX, RawChatMessage, RawOrder};
    use crate::store::SqliteStore;
    use async_trait::async_trait;
    use model::{Account, AccountId, AcceptanceDecision, Credentials, Money, Payout, PayoutId};
    type Result<T> = std::result::Result<T, PlatformXError>;

    struct FakePlatformX;

    #[async_trait]
    impl PlatformX for FakePlatformX {
        async fn list_orders(&self, _statuses: &[i32]) -> Result<Vec<RawOrder>> {
            Ok(vec![])
        }
        async fn order_info(&self, _order_id: &str) -> Result<RawOrder> {
            unimplemented!()
        }
        async fn list_chat_messages(&self, _order_id: &str, _limit: u32) -> Result<Vec<RawChatMessage>> {
            Ok(vec![])
        }
        async fn send_chat_message(&self, _order_id: &str, _text: &str) -> Result<String> {
            Ok("m1".into())
        }
        async fn create_ad(&self, _request: &CreateAdRequest) -> Result<String> {
            Ok("ad-external-1".into())
        }
        async fn cancel_ad(&self, _ad_id: &str) -> Result<()> {
            Ok(())
        }
        async fn release_order(&self, _order_id: &str) -> Result<()> {
            Ok(())
        }
        async fn wallet_balance(&self) -> Result<i64> {
            Ok(0)
        }
        async fn server_time_ms(&self) -> Result<i64> {
            Ok(0)
        }
    }

    async fn seed_accepted_payout(store: &dyn Store, account_id: AccountId) -> PayoutId {
        let payout = Payout {
            id: PayoutId::new("p1"),
            account_id,
            amount: Money::from_minor_units(1_500_000),
            recipient_identifier: "+79991234567".into(),
            bank_name: "Сбербанк".into(),
            recipient_name: "Petr P.".into(),
            external_status: 5,
            accepted_at: Some(OffsetDateTime::now_utc()),
            decision: AcceptanceDecision::Accepted,
            raw: serde_json::json!({}),
        };
        store.upsert_payout(&payout).await.unwrap();
        payout.id
    }

    #[tokio::test]
    async fn accepted_payout_without_transaction_is_picked_up_and_linked() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let account = Account {
            id: AccountId::new(),
            platform: PlatformTag::PlatformX,
            label: "x1".into(),
            status: model::AccountStatus::Active,
            error_message: None,
            next_refresh_at: None,
            credentials: Credentials::PlatformX {
                api_key: "k".into(),
                api_secret: "s".into(),
            },
            session_blob: None,
        };
        store.upsert_account(&account).await.unwrap();
        seed_accepted_payout(store.as_ref(), account.id).await;

        let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
        registry.inject_client_x(account.id, Arc::new(FakePlatformX)).await;
        let placement = AdPlacement::new(store.clone(), registry, Config::default());
        assert_eq!(
            placement.pick_account_with_capacity().await.unwrap(),
            Some(account.id)
        );

        placement.run().await.unwrap();

        assert!(store
            .list_accepted_payouts_without_transaction()
            .await
            .unwrap()
            .is_empty());
        let advertisements = store.count_active_advertisements_for_account(account.id).await.unwrap();
        assert_eq!(advertisements, 1);
    }

    #[tokio::test]
    async fn account_at_capacity_is_skipped() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let account = Account {
            id: AccountId::new(),
            platform: PlatformTag::PlatformX,
            label: "x1".into(),
            status: model::AccountStatus::Active,
            error_message: None,
            next_refresh_at: None,
            credentials: Credentials::PlatformX {
                api_key: "k".into(),
                api_secret: "s".into(),
            },
            session_blob: None,
        };
        store.upsert_account(&account).await.unwrap();
        let mut config = Config::default();
        config.bybit.max_ads_per_account = 1;
        let registry = Arc::new(AccountRegistry::new(store.clone(), config.clone()));
        let placement = AdPlacement::new(store.clone(), registry, config);

        store
            .insert_advertisement(&Advertisement {
                id: AdvertisementId::new(),
                platform_ad_id: "existing".into(),
                account_id: account.id,
                side: Side::Sell,
                asset: "crypto".into(),
                fiat: "RUB".into(),
                unit_price: Money::from_minor_units(100),
                quantity: Money::from_minor_units(100),
                min_amount: Money::from_minor_units(100),
                max_amount: Money::from_minor_units(100),
                payment_methods: Default::default(),
                status: AdvertisementStatus::Online,
            })
            .await
            .unwrap();

        assert_eq!(placement.pick_account_with_capacity().await.unwrap(), None);
    }
}
