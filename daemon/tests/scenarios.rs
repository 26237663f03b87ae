//! End-to-end scenarios driving multiple components together against an
//! in-memory store, the way `cfd_protocol/tests/*.rs` exercises
//! cross-cutting behavior from outside any single module instead of from
//! a `#[cfg(test)]` block next to the code under test.

use async_trait::async_trait;
use daemon::account_registry::AccountRegistry;
use daemon::ad_placement::AdPlacement;
use daemon::cancellation_reissue::CancellationReissue;
use daemon::chat_automation::ChatAutomation;
use daemon::config::Config;
use daemon::email_client::{EmailAttachment, EmailClient, EmailMessage, EmailSummary};
use daemon::errors::{EmailError, PlatformXError};
use daemon::event_bus::EventBus;
use daemon::order_discovery::OrderDiscovery;
use daemon::payout_intake::{AutoApprove, PayoutIntake};
use daemon::pdf_parser::PdfTextExtractor;
use daemon::platform::platform_x::{CreateAdRequest, PlatformX, RawChatMessage, RawOrder};
use daemon::receipt_processor::ReceiptProcessor;
use daemon::release_engine::ReleaseEngine;
use daemon::store::{SqliteStore, Store};
use model::{
    AcceptanceDecision, Account, AccountId, AccountStatus, AdvertisementStatus, ChatContentType,
    ChatMessage, ChatMessageId, Credentials, Money, Payout, PayoutId, PlatformTag, Sender,
    TransactionStatus,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

type XResult<T> = std::result::Result<T, PlatformXError>;

const SAMPLE_RECEIPT: &str = "\
Дата и время: 12.03.2024 14:33:01
Сумма: 15000.00 ₽
Сумма перевода: 15000.00 ₽
Комиссия: без комиссии
Статус: Успешно
Тип операции: Перевод по номеру телефона
ФИО отправителя: Иван И.
Счет списания: *1234
ФИО получателя: Петр П.
Телефон получателя: +79991234567
Банк получателя: Сбербанк
Карта получателя: *5678
Номер операции: 123456
Код СБП: 987654
Номер квитанции: 1";

async fn seed_x_account(store: &dyn Store) -> AccountId {
    let account = Account {
        id: AccountId::new(),
        platform: PlatformTag::PlatformX,
        label: "x1".into(),
        status: AccountStatus::Active,
        error_message: None,
        next_refresh_at: None,
        credentials: Credentials::PlatformX {
            api_key: "k".into(),
            api_secret: "s".into(),
        },
        session_blob: None,
    };
    store.upsert_account(&account).await.unwrap();
    account.id
}

async fn seed_accepted_payout(store: &dyn Store, account_id: AccountId, amount_minor: i64) -> PayoutId {
    let payout = Payout {
        id: PayoutId::new("p1"),
        account_id,
        amount: Money::from_minor_units(amount_minor),
        recipient_identifier: "+79991234567".into(),
        bank_name: "Сбербанк".into(),
        recipient_name: "Петр П.".into(),
        external_status: 5,
        // Predates SAMPLE_RECEIPT's 12.03.2024 timestamp so the
        // `fields.datetime >= accepted_at` matching guard doesn't reject it.
        accepted_at: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
        decision: AcceptanceDecision::Accepted,
        raw: serde_json::json!({}),
    };
    store.upsert_payout(&payout).await.unwrap();
    payout.id
}

/// A Platform-X fake whose order status/amount can be changed mid-scenario
/// (external state change between scheduler ticks), mirroring how the real
/// API's `order_info` reflects whatever the counterparty just did.
struct ScenarioPlatformX {
    order_id: String,
    item_id: String,
    amount: i64,
    user_id: String,
    status: Mutex<i32>,
    send_count: AtomicU32,
    release_count: AtomicU32,
    release_ok: bool,
    cancel_count: AtomicU32,
}

impl ScenarioPlatformX {
    fn new(order_id: &str, item_id: &str, amount: i64) -> Self {
        Self {
            order_id: order_id.into(),
            item_id: item_id.into(),
            amount,
            user_id: "buyer-1".into(),
            status: Mutex::new(10),
            send_count: AtomicU32::new(0),
            release_count: AtomicU32::new(0),
            release_ok: true,
            cancel_count: AtomicU32::new(0),
        }
    }

    fn set_status(&self, status: i32) {
        *self.status.lock().unwrap() = status;
    }

    fn raw_order(&self) -> RawOrder {
        RawOrder {
            order_id: self.order_id.clone(),
            status: *self.status.lock().unwrap(),
            amount: self.amount,
            user_id: self.user_id.clone(),
            item_id: Some(self.item_id.clone()),
            raw: serde_json::json!({}),
        }
    }
}

#[async_trait]
impl PlatformX for ScenarioPlatformX {
    async fn list_orders(&self, _statuses: &[i32]) -> XResult<Vec<RawOrder>> {
        Ok(vec![self.raw_order()])
    }
    async fn order_info(&self, _order_id: &str) -> XResult<RawOrder> {
        Ok(self.raw_order())
    }
    async fn list_chat_messages(&self, _order_id: &str, _limit: u32) -> XResult<Vec<RawChatMessage>> {
        Ok(vec![])
    }
    async fn send_chat_message(&self, _order_id: &str, _text: &str) -> XResult<String> {
        let n = self.send_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("msg-{n}"))
    }
    async fn create_ad(&self, _request: &CreateAdRequest) -> XResult<String> {
        Ok(self.item_id.clone())
    }
    async fn cancel_ad(&self, _ad_id: &str) -> XResult<()> {
        self.cancel_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    async fn release_order(&self, _order_id: &str) -> XResult<()> {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        if self.release_ok {
            Ok(())
        } else {
            Err(PlatformXError::Api { code: -1, msg: "release rejected".into() })
        }
    }
    async fn wallet_balance(&self) -> XResult<i64> {
        Ok(0)
    }
    async fn server_time_ms(&self) -> XResult<i64> {
        Ok(0)
    }
}

/// Delivers a fixed set of receipt PDFs once; each ingest pass re-lists the
/// same emails, the way a real inbox would until messages are archived.
struct FixedReceiptEmail {
    text: Arc<str>,
}

#[async_trait]
impl EmailClient for FixedReceiptEmail {
    async fn list_inboxes(&self) -> std::result::Result<Vec<String>, EmailError> {
        Ok(vec!["inbox1".into()])
    }
    async fn list_emails(&self, _inbox: &str, _since_id: Option<&str>) -> std::result::Result<Vec<EmailSummary>, EmailError> {
        Ok(vec![EmailSummary {
            id: "e1".into(),
            from_address: "noreply@sberbank.ru".into(),
            subject: "receipt".into(),
        }])
    }
    async fn fetch_email(&self, _inbox: &str, email_id: &str) -> std::result::Result<EmailMessage, EmailError> {
        Ok(EmailMessage {
            id: email_id.into(),
            from_address: "noreply@sberbank.ru".into(),
            attachments: vec![EmailAttachment {
                id: "a1".into(),
                file_name: "receipt.pdf".into(),
                bytes: self.text.as_bytes().to_vec(),
            }],
        })
    }
    async fn download_attachment(&self, _inbox: &str, _email_id: &str, _attachment_id: &str) -> std::result::Result<Vec<u8>, EmailError> {
        unimplemented!()
    }
}

struct EchoPdf;

#[async_trait]
impl PdfTextExtractor for EchoPdf {
    async fn extract(&self, bytes: Vec<u8>) -> anyhow::Result<String> {
        Ok(String::from_utf8(bytes).unwrap())
    }
}

async fn buyer_reply(store: &dyn Store, transaction_id: model::TransactionId, body: &str) {
    store
        .upsert_chat_message(&ChatMessage {
            id: ChatMessageId::new(),
            transaction_id,
            external_message_id: format!("reply-{body}"),
            sender: Sender::Them,
            body: body.into(),
            content_type: ChatContentType::Text,
            sent_at: OffsetDateTime::now_utc(),
            processed: false,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_completes_with_exactly_one_release() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-1", "ad-1", 1_500_000));
    registry.inject_client_x(account_id, platform.clone()).await;
    let events = Arc::new(EventBus::new());

    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();

    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx = store
        .find_transaction_by_order_id("order-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::ChatStarted);

    buyer_reply(store.as_ref(), tx.id, "да").await;
    chat.run().await.unwrap();
    buyer_reply(store.as_ref(), tx.id, "Сбербанк").await;
    chat.run().await.unwrap();

    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::WaitingPayment);

    let receipts = ReceiptProcessor::new(
        store.clone(),
        Arc::new(FixedReceiptEmail { text: SAMPLE_RECEIPT.into() }),
        Arc::new(EchoPdf),
        events.clone(),
        Config::default(),
    );
    receipts.run().await.unwrap();

    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::CheckReceived);

    let release = ReleaseEngine::new(store.clone(), registry.clone(), events.clone());
    release.run().await.unwrap();

    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(platform.release_count.load(Ordering::SeqCst), 1);
    let ad = store.find_advertisement(tx.advertisement_id).await.unwrap().unwrap();
    assert_eq!(ad.status, AdvertisementStatus::Deleted);
}

#[tokio::test]
async fn wrong_bank_becomes_stupid_and_payout_loops_back_without_release() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    let payout_id = seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-2", "ad-2", 1_500_000));
    registry.inject_client_x(account_id, platform.clone()).await;
    let events = Arc::new(EventBus::new());

    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();
    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx = store
        .find_transaction_by_order_id("order-2")
        .await
        .unwrap()
        .unwrap();
    let ad_id = tx.advertisement_id;

    buyer_reply(store.as_ref(), tx.id, "да").await;
    chat.run().await.unwrap();
    buyer_reply(store.as_ref(), tx.id, "Тинькофф").await;
    chat.run().await.unwrap();

    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Stupid);
    assert_eq!(platform.release_count.load(Ordering::SeqCst), 0);

    // Stupid is terminal but isn't cleaned up by the cancellation/reissue
    // path (that only handles still-open orders) -- deletion here plays
    // the same "drop the ad, free the payout" role the chat step itself
    // would trigger once the operator archives a junk conversation.
    store.delete_chat_messages(tx.id).await.unwrap();
    store.delete_transaction(tx.id).await.unwrap();
    store.delete_advertisement(ad_id).await.unwrap();

    let pending = store.list_accepted_payouts_without_transaction().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, payout_id);
}

#[tokio::test]
async fn amount_mismatch_blocks_progress_and_alerts_operator() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    // Payout revealed 15000 RUB; the order that links to its advertisement
    // reports 14999 -- spec.md's "amount mismatch" scenario.
    seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-3", "ad-3", 1_499_900));
    registry.inject_client_x(account_id, platform.clone()).await;
    let events = Arc::new(EventBus::new());
    let mut alerts = events.subscribe();

    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();
    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx = store
        .find_transaction_by_order_id("order-3")
        .await
        .unwrap()
        .unwrap();
    // The mismatch guard runs before any status sync, so the transaction
    // never leaves Pending and chat never starts.
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(platform.send_count.load(Ordering::SeqCst), 0);

    let event = alerts.recv().await.unwrap();
    assert_eq!(event.kind, model::EventKind::OperatorAlert);
    assert_eq!(event.data["reason"], "amount_mismatch");

    let release = ReleaseEngine::new(store.clone(), registry.clone(), events.clone());
    release.run().await.unwrap();
    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Pending);
    assert_eq!(platform.release_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn receipt_arriving_before_the_order_matches_once_discovery_catches_up() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;
    let events = Arc::new(EventBus::new());

    // The receipt lands before there's any advertisement or transaction at
    // all -- ingestion still stores it, unmatched, because matching only
    // looks at non-terminal transactions.
    let receipts = ReceiptProcessor::new(
        store.clone(),
        Arc::new(FixedReceiptEmail { text: SAMPLE_RECEIPT.into() }),
        Arc::new(EchoPdf),
        events.clone(),
        Config::default(),
    );
    receipts.run().await.unwrap();
    assert_eq!(store.list_unmatched_receipts().await.unwrap().len(), 1);

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-4", "ad-4", 1_500_000));
    registry.inject_client_x(account_id, platform.clone()).await;
    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();

    platform.set_status(20);
    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx = store
        .find_transaction_by_order_id("order-4")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::WaitingPayment);

    receipts.run().await.unwrap();
    let tx = store.find_transaction(tx.id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::CheckReceived);
    assert!(store.list_unmatched_receipts().await.unwrap().is_empty());
}

#[tokio::test]
async fn counterparty_cancellation_deletes_the_ad_and_requeues_a_new_one() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    let payout_id = seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-5", "ad-5", 1_500_000));
    registry.inject_client_x(account_id, platform.clone()).await;
    let events = Arc::new(EventBus::new());

    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();
    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx = store
        .find_transaction_by_order_id("order-5")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::ChatStarted);

    // Buyer cancels on the platform while we're still mid-chat.
    platform.set_status(40);
    let cancellation = CancellationReissue::new(store.clone(), registry.clone(), events.clone());
    cancellation.run().await.unwrap();

    assert!(store.find_transaction(tx.id).await.unwrap().is_none());
    assert!(store.find_advertisement(tx.advertisement_id).await.unwrap().is_none());
    assert_eq!(platform.cancel_count.load(Ordering::SeqCst), 1);

    let pending = store.list_accepted_payouts_without_transaction().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, payout_id);

    // Next ad_creator tick picks the freed payout right back up.
    placement.run().await.unwrap();
    assert!(store.list_accepted_payouts_without_transaction().await.unwrap().is_empty());
}

#[tokio::test]
async fn restart_mid_flight_resumes_without_duplicating_the_transaction_or_resending_chat() {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account_id = seed_x_account(store.as_ref()).await;
    seed_accepted_payout(store.as_ref(), account_id, 1_500_000).await;

    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    let platform = Arc::new(ScenarioPlatformX::new("order-6", "ad-6", 1_500_000));
    registry.inject_client_x(account_id, platform.clone()).await;
    let events = Arc::new(EventBus::new());

    let placement = AdPlacement::new(store.clone(), registry.clone(), Config::default());
    placement.run().await.unwrap();
    let chat = Arc::new(ChatAutomation::new(store.clone(), registry.clone(), events.clone()));
    let discovery = OrderDiscovery::new(store.clone(), registry.clone(), chat.clone(), events.clone());
    discovery.run().await.unwrap();

    let tx_id = store
        .find_transaction_by_order_id("order-6")
        .await
        .unwrap()
        .unwrap()
        .id;
    buyer_reply(store.as_ref(), tx_id, "да").await;
    chat.run().await.unwrap();
    buyer_reply(store.as_ref(), tx_id, "Сбербанк").await;
    chat.run().await.unwrap();

    let tx = store.find_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::WaitingPayment);
    assert_eq!(tx.chat_step, 2);
    let sends_before_restart = platform.send_count.load(Ordering::SeqCst);

    // "Process restart": fresh components sharing nothing but the store
    // and a freshly-injected client, exactly what `main.rs` builds at boot.
    let registry2 = Arc::new(AccountRegistry::new(store.clone(), Config::default()));
    registry2.inject_client_x(account_id, platform.clone()).await;
    let events2 = Arc::new(EventBus::new());
    let chat2 = Arc::new(ChatAutomation::new(store.clone(), registry2.clone(), events2.clone()));
    let discovery2 = OrderDiscovery::new(store.clone(), registry2.clone(), chat2.clone(), events2.clone());

    platform.set_status(20);
    discovery2.run().await.unwrap();

    let tx = store.find_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::PaymentReceived);
    assert_eq!(tx.chat_step, 2, "no chat message should be resent on rediscovery");
    assert_eq!(
        platform.send_count.load(Ordering::SeqCst),
        sends_before_restart,
        "order discovery alone must not trigger an outbound send"
    );

    // No duplicate transaction was created for the same order.
    assert!(store
        .list_non_terminal_transactions()
        .await
        .unwrap()
        .iter()
        .filter(|t| t.order_id.as_deref() == Some("order-6"))
        .count()
        == 1);

    chat2.run().await.unwrap();
    let tx = store.find_transaction(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.chat_step, 3, "payment-received handling should advance the step exactly once");
}

#[tokio::test]
async fn payout_intake_feeds_ad_placement_across_a_full_tick() {
    // Sanity-checks the boot-order split (work_acceptor vs payouts_sync)
    // feeds AdPlacement the same way main.rs wires it: accept, then place.
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let account = Account {
        id: AccountId::new(),
        platform: PlatformTag::PlatformD,
        label: "d1".into(),
        status: AccountStatus::Active,
        error_message: None,
        next_refresh_at: None,
        credentials: Credentials::PlatformD { login: "l".into(), password: "p".into() },
        session_blob: None,
    };
    store.upsert_account(&account).await.unwrap();
    let registry = Arc::new(AccountRegistry::new(store.clone(), Config::default()));

    struct FakeD;
    #[async_trait]
    impl daemon::platform::platform_d::PlatformD for FakeD {
        async fn login(&self, _l: &str, _p: &str) -> std::result::Result<String, daemon::errors::PlatformDError> {
            Ok("cookie".into())
        }
        async fn list_payouts(&self, status: i32, _page: u32) -> std::result::Result<Vec<daemon::platform::platform_d::RawPayout>, daemon::errors::PlatformDError> {
            if status == 4 {
                Ok(vec![daemon::platform::platform_d::RawPayout {
                    id: "p1".into(),
                    status,
                    amount: None,
                    wallet: None,
                    bank: None,
                    recipient_name: None,
                    raw: serde_json::json!({}),
                }])
            } else {
                Ok(vec![])
            }
        }
        async fn accept(&self, payout_id: &str) -> std::result::Result<daemon::platform::platform_d::RawPayout, daemon::errors::PlatformDError> {
            Ok(daemon::platform::platform_d::RawPayout {
                id: payout_id.into(),
                status: 5,
                amount: Some(1_500_000),
                wallet: Some("+79991234567".into()),
                bank: Some("Сбербанк".into()),
                recipient_name: Some("Петр П.".into()),
                raw: serde_json::json!({}),
            })
        }
        async fn action(&self, _id: &str, _action: daemon::platform::platform_d::PayoutAction) -> std::result::Result<(), daemon::errors::PlatformDError> {
            Ok(())
        }
        async fn set_balance(&self, _amount: i64) -> std::result::Result<(), daemon::errors::PlatformDError> {
            Ok(())
        }
    }
    registry.inject_client_d(account.id, Arc::new(FakeD)).await;

    let intake = PayoutIntake::new(store.clone(), registry.clone(), Arc::new(AutoApprove));
    intake.sync().await.unwrap();
    intake.run().await.unwrap();

    let accepted = store.list_accepted_payouts_without_transaction().await.unwrap();
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].id, PayoutId::new("p1"));
}
