//! Order Discovery (C5), per spec.md §4.6. The hardest loop: scheduled
//! every 1 s but self-rate-limited to one listing call per account every 5 s.

use crate::account_registry::AccountRegistry;
use crate::chat_automation::ChatAutomation;
use crate::platform::platform_x::{PlatformX, RawOrder};
use crate::rate_limiter::RateLimiter;
use crate::store::Store;
use crate::transaction_fsm;
use model::{
    Advertisement, AdvertisementId, AdvertisementStatus, ChatContentType, ChatMessage,
    ChatMessageId, Money, PlatformTag, Sender as ChatSender, Side, Transaction, TransactionId,
    TransactionStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::warn;

const ACCOUNT_RATE_LIMIT_SECS: u64 = 5;
/// Lookback window for the itemId-less fallback match (§4.6 step 2(c)).
const RECENT_AD_LOOKBACK_MINS: i64 = 10;
const CHAT_MESSAGE_FETCH_LIMIT: u32 = 10;

/// Recognized system-message prefixes (§4.6 step 5), alongside `msgType == 0`.
const SYSTEM_MESSAGE_PREFIXES: &[&str] = &["system:", "automatic message", "платформа:"];

pub struct OrderDiscovery {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    chat: Arc<ChatAutomation>,
    events: Arc<crate::event_bus::EventBus>,
    account_rate_limiter: RateLimiter,
    known_order_ids: Mutex<Option<HashSet<String>>>,
}

impl OrderDiscovery {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<AccountRegistry>,
        chat: Arc<ChatAutomation>,
        events: Arc<crate::event_bus::EventBus>,
    ) -> Self {
        Self {
            store,
            registry,
            chat,
            events,
            account_rate_limiter: RateLimiter::new(std::time::Duration::from_secs(
                ACCOUNT_RATE_LIMIT_SECS,
            )),
            known_order_ids: Mutex::new(None),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.ensure_known_order_ids_seeded().await?;

        for account in self.store.list_accounts(PlatformTag::PlatformX).await? {
            if !self.account_rate_limiter.try_acquire(&account.id.to_string()).await {
                continue;
            }
            let Some(client) = self.registry.client_x(account.id).await else {
                continue;
            };
            let orders = match client.list_orders(&[10, 20]).await {
                Ok(orders) => orders,
                Err(err) => {
                    warn!(account_id = %account.id, error = %err, "order listing failed");
                    continue;
                }
            };

            for order in orders {
                if let Err(err) = self.process_order(account.id, client.as_ref(), &order).await {
                    warn!(order_id = %order.order_id, error = %err, "order processing failed");
                }
            }
        }
        Ok(())
    }

    async fn ensure_known_order_ids_seeded(&self) -> anyhow::Result<()> {
        let mut guard = self.known_order_ids.lock().await;
        if guard.is_none() {
            *guard = Some(self.store.all_known_order_ids().await?);
        }
        Ok(())
    }

    async fn process_order(
        &self,
        account_id: model::AccountId,
        client: &dyn PlatformX,
        order: &RawOrder,
    ) -> anyhow::Result<()> {
        {
            let mut known = self.known_order_ids.lock().await;
            known.get_or_insert_with(HashSet::new).insert(order.order_id.clone());
        }

        let transaction = match self.store.find_transaction_by_order_id(&order.order_id).await? {
            Some(tx) => tx,
            None => self.link_order(account_id, client, order).await?,
        };

        let Some(payout) = self.store.find_payout(&transaction.payout_id).await? else {
            return Ok(());
        };

        if !transaction_fsm::check_amount_match(
            &self.events,
            transaction.id,
            Money::from_minor_units(order.amount),
            payout.amount,
        ) {
            return Ok(());
        }

        let transaction = self.sync_status_from_order(transaction, order.status).await?;
        self.sync_chat_messages(client, &transaction, order).await?;

        if transaction.status == TransactionStatus::ChatStarted
            && !self.store.has_message_from(transaction.id, ChatSender::Us).await?
        {
            self.chat.start(transaction.id).await?;
        }
        Ok(())
    }

    /// Resolves a not-yet-known order to an `Advertisement`+`Transaction`
    /// pair per §4.6 steps 2-4.
    async fn link_order(
        &self,
        account_id: model::AccountId,
        client: &dyn PlatformX,
        order: &RawOrder,
    ) -> anyhow::Result<Transaction> {
        let advertisement = self.resolve_advertisement(account_id, client, order).await?;

        let transaction = match self.store.find_transaction_by_advertisement(advertisement.id).await? {
            Some(tx) => tx,
            None => {
                let now = OffsetDateTime::now_utc();
                let tx = Transaction {
                    id: TransactionId::new(),
                    payout_id: model::PayoutId::new(format!("orphan_{}", order.order_id)),
                    advertisement_id: advertisement.id,
                    order_id: None,
                    status: TransactionStatus::Pending,
                    chat_step: 0,
                    failure_reason: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_transaction(&tx).await?;
                warn!(order_id = %order.order_id, "no advertisement could be resolved; flagged for operator review");
                self.events.publish(
                    model::EventKind::OperatorAlert,
                    serde_json::json!({
                        "order_id": order.order_id,
                        "reason": "unresolved_advertisement",
                    }),
                    None,
                );
                tx
            }
        };

        self.store.link_order_id(transaction.id, &order.order_id).await?;
        Ok(Transaction {
            order_id: Some(order.order_id.clone()),
            ..transaction
        })
    }

    async fn resolve_advertisement(
        &self,
        account_id: model::AccountId,
        client: &dyn PlatformX,
        order: &RawOrder,
    ) -> anyhow::Result<Advertisement> {
        if let Some(item_id) = &order.item_id {
            if let Some(ad) = self.store.find_advertisement_by_platform_ad_id(item_id).await? {
                return Ok(ad);
            }
        }

        if let Ok(info) = client.order_info(&order.order_id).await {
            if let Some(item_id) = info.item_id {
                if let Some(ad) = self.store.find_advertisement_by_platform_ad_id(&item_id).await? {
                    return Ok(ad);
                }
            }
        }

        let since = OffsetDateTime::now_utc() - TimeDuration::minutes(RECENT_AD_LOOKBACK_MINS);
        let candidates = self
            .store
            .recent_advertisements_for_account(account_id, since)
            .await?;
        let target = Money::from_minor_units(order.amount);
        if let Some(matched) = candidates.into_iter().find(|ad| ad.quantity == target) {
            return Ok(matched);
        }

        let placeholder = Advertisement {
            id: AdvertisementId::new(),
            platform_ad_id: Advertisement::placeholder_id(&order.order_id),
            account_id,
            side: Side::Sell,
            asset: "crypto".into(),
            fiat: "RUB".into(),
            unit_price: Money::ZERO,
            quantity: target,
            min_amount: target,
            max_amount: target,
            payment_methods: Default::default(),
            status: AdvertisementStatus::Online,
        };
        self.store.insert_advertisement(&placeholder).await?;
        Ok(placeholder)
    }

    /// Order-status-driven transitions (§4.3): discovering a brand-new
    /// order at status 10/20 lands it on `chat_started`/`waiting_payment`;
    /// seeing status 20 on a later tick for an already-`waiting_payment`
    /// transaction means the buyer has since paid.
    async fn sync_status_from_order(
        &self,
        tx: Transaction,
        order_status: i32,
    ) -> anyhow::Result<Transaction> {
        let target = match (tx.status, order_status) {
            (TransactionStatus::Pending, 10) => Some(TransactionStatus::ChatStarted),
            (TransactionStatus::Pending, 20) => Some(TransactionStatus::WaitingPayment),
            (TransactionStatus::WaitingPayment, 20) => Some(TransactionStatus::PaymentReceived),
            _ => None,
        };
        let Some(next) = target else {
            return Ok(tx);
        };
        let applied = transaction_fsm::transition(
            self.store.as_ref(),
            &self.events,
            tx.id,
            tx.status,
            next,
            None,
        )
        .await?;
        Ok(if applied { Transaction { status: next, ..tx } } else { tx })
    }

    async fn sync_chat_messages(
        &self,
        client: &dyn PlatformX,
        tx: &Transaction,
        order: &RawOrder,
    ) -> anyhow::Result<()> {
        let raw_messages = match client.list_chat_messages(&order.order_id, CHAT_MESSAGE_FETCH_LIMIT).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(order_id = %order.order_id, error = %err, "chat message fetch failed");
                return Ok(());
            }
        };

        for raw in raw_messages {
            let sender = classify_sender(&raw, &order.user_id);
            let content_type = match raw.content_type.as_str() {
                "image" => ChatContentType::Image,
                "pdf" | "file" => ChatContentType::Pdf,
                _ => ChatContentType::Text,
            };
            let message = ChatMessage {
                id: ChatMessageId::new(),
                transaction_id: tx.id,
                external_message_id: raw.message_id,
                sender,
                body: raw.message,
                content_type,
                sent_at: OffsetDateTime::now_utc(),
                processed: false,
            };
            self.store.upsert_chat_message(&message).await?;
        }
        Ok(())
    }
}

fn classify_sender(raw: &crate::platform::platform_x::RawChatMessage, order_user_id: &str) -> ChatSender {
    if raw.user_id == order_user_id {
        return ChatSender::Us;
    }
    if raw.msg_type == 0 {
        return ChatSender::System;
    }
    let lowered = raw.message.to_lowercase();
    if SYSTEM_MESSAGE_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
        return ChatSender::System;
    }
    ChatSender::Them
}
