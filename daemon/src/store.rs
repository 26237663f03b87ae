//! The relational store.
//!
//! spec.md treats the store itself as an out-of-scope external collaborator
//! ("assumed to expose transactional `upsert`/`find`/`update` primitives");
//! what's in scope is the shape of that contract, so every other component
//! can be written against [`Store`] and tested against
//! [`SqliteStore::in_memory`] instead of a live database -- the same split
//! Design Notes §9 asks for ("Global singletons... become explicit
//! collaborators passed through a context structure").

use crate::errors::StoreError;
use async_trait::async_trait;
use model::{
    Account, AccountId, AccountStatus, AcceptanceDecision, Advertisement, AdvertisementId,
    AdvertisementStatus, ChatContentType, ChatMessage, ChatMessageId, FailureReason,
    Money, PayoutId, PlatformTag, Receipt, ReceiptFields, ReceiptId, Sender as ChatSender, Side,
    Transaction, TransactionId, TransactionStatus,
};
use model::payout::Payout;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use time::OffsetDateTime;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_account(&self, account: &Account) -> Result<()>;
    async fn find_account(&self, id: AccountId) -> Result<Option<Account>>;
    async fn list_accounts(&self, platform: PlatformTag) -> Result<Vec<Account>>;

    async fn upsert_payout(&self, payout: &Payout) -> Result<()>;
    async fn find_payout(&self, id: &PayoutId) -> Result<Option<Payout>>;
    async fn list_accepted_payouts_without_transaction(&self) -> Result<Vec<Payout>>;
    async fn list_payouts_pending_review(&self) -> Result<Vec<Payout>>;

    async fn insert_advertisement(&self, ad: &Advertisement) -> Result<()>;
    async fn find_advertisement(&self, id: AdvertisementId) -> Result<Option<Advertisement>>;
    /// Resolves an order's `itemId` (the platform's own ad id) back to our
    /// internal `Advertisement`, per spec.md §4.6 step 2(a).
    async fn find_advertisement_by_platform_ad_id(
        &self,
        platform_ad_id: &str,
    ) -> Result<Option<Advertisement>>;
    async fn update_advertisement_status(
        &self,
        id: AdvertisementId,
        status: AdvertisementStatus,
    ) -> Result<()>;
    async fn delete_advertisement(&self, id: AdvertisementId) -> Result<()>;
    /// Count of non-deleted ads on `account_id`, used by Ad Placement to
    /// pick an account with free slots (spec.md §4.5).
    async fn count_active_advertisements_for_account(&self, account_id: AccountId) -> Result<i64>;
    /// Advertisements created on `account_id` within the lookback window,
    /// used by the order-discovery fallback match in spec.md §4.6 step 2(c).
    async fn recent_advertisements_for_account(
        &self,
        account_id: AccountId,
        since: OffsetDateTime,
    ) -> Result<Vec<Advertisement>>;

    async fn insert_transaction(&self, tx: &Transaction) -> Result<()>;
    async fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;
    async fn find_transaction_by_order_id(&self, order_id: &str) -> Result<Option<Transaction>>;
    async fn find_transaction_by_advertisement(
        &self,
        advertisement_id: AdvertisementId,
    ) -> Result<Option<Transaction>>;
    async fn list_non_terminal_transactions(&self) -> Result<Vec<Transaction>>;
    async fn all_known_order_ids(&self) -> Result<HashSet<String>>;
    /// Link an order id onto a transaction that doesn't have one yet, only
    /// if it's still unset (spec.md §4.6 step 3's CAS-link).
    async fn link_order_id(&self, id: TransactionId, order_id: &str) -> Result<bool>;
    /// Compare-and-swap status transition. `Ok(false)` on CAS miss is not an
    /// error (spec.md §4.3: "aborts without error").
    async fn cas_transition(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<bool>;
    async fn set_chat_step(&self, id: TransactionId, step: u32) -> Result<()>;
    async fn delete_transaction(&self, id: TransactionId) -> Result<()>;

    async fn upsert_chat_message(&self, message: &ChatMessage) -> Result<bool>;
    async fn list_recent_chat_messages(
        &self,
        transaction_id: TransactionId,
        limit: i64,
    ) -> Result<Vec<ChatMessage>>;
    async fn has_message_from(&self, transaction_id: TransactionId, sender: ChatSender) -> Result<bool>;
    async fn mark_chat_message_processed(&self, id: ChatMessageId) -> Result<()>;
    async fn delete_chat_messages(&self, transaction_id: TransactionId) -> Result<()>;
    /// Idempotent-send bookkeeping for chat automation (spec.md §4.8:
    /// "Outgoing sends are idempotent: each step records the message id it
    /// produced").
    async fn record_step_send(
        &self,
        transaction_id: TransactionId,
        step: u32,
        message_id: &str,
    ) -> Result<()>;
    async fn step_send(&self, transaction_id: TransactionId, step: u32) -> Result<Option<String>>;

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<()>;
    async fn find_receipt_by_hash(&self, hash: &str) -> Result<Option<Receipt>>;
    async fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>>;
    async fn mark_receipt_matched(&self, id: ReceiptId, transaction_id: TransactionId) -> Result<()>;

    async fn task_stats(&self, task_id: &str) -> Result<Option<TaskStatsRow>>;
    async fn upsert_task_stats(&self, stats: &TaskStatsRow) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct TaskStatsRow {
    pub task_id: String,
    pub run_count: u64,
    pub last_run_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub current_interval_ms: u64,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::query(include_str!("../migrations/0001_init.sql"))
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&time::format_description::well_known::Rfc3339)
        .expect("OffsetDateTime always formats as rfc3339")
}

fn parse_rfc3339(raw: &str) -> OffsetDateTime {
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
        .expect("stored timestamps are always rfc3339")
}

fn account_from_row(row: &SqliteRow) -> Account {
    let platform: String = row.get("platform");
    let status: String = row.get("status");
    let next_refresh_at: Option<String> = row.get("next_refresh_at");
    let credentials: String = row.get("credentials");
    Account {
        id: AccountId::from_str(&row.get::<String, _>("id")).expect("valid uuid"),
        platform: match platform.as_str() {
            "platform_d" => PlatformTag::PlatformD,
            _ => PlatformTag::PlatformX,
        },
        label: row.get("label"),
        status: match status.as_str() {
            "active" => AccountStatus::Active,
            "initializing" => AccountStatus::Initializing,
            "error" => AccountStatus::Error,
            _ => AccountStatus::Disabled,
        },
        error_message: row.get("error_message"),
        next_refresh_at: next_refresh_at.map(|s| parse_rfc3339(&s)),
        credentials: serde_json::from_str(&credentials).expect("stored credentials are valid json"),
        session_blob: row.get("session_blob"),
    }
}

fn platform_str(p: PlatformTag) -> &'static str {
    match p {
        PlatformTag::PlatformD => "platform_d",
        PlatformTag::PlatformX => "platform_x",
    }
}

fn account_status_str(s: AccountStatus) -> &'static str {
    match s {
        AccountStatus::Active => "active",
        AccountStatus::Initializing => "initializing",
        AccountStatus::Error => "error",
        AccountStatus::Disabled => "disabled",
    }
}

fn payout_from_row(row: &SqliteRow) -> Payout {
    let decision: String = row.get("decision");
    let accepted_at: Option<String> = row.get("accepted_at");
    let raw: String = row.get("raw");
    Payout {
        id: PayoutId::new(row.get::<String, _>("id")),
        account_id: AccountId::from_str(&row.get::<String, _>("account_id")).expect("valid uuid"),
        amount: Money::from_minor_units(row.get("amount")),
        recipient_identifier: row.get("recipient_identifier"),
        bank_name: row.get("bank_name"),
        recipient_name: row.get("recipient_name"),
        external_status: row.get("external_status"),
        accepted_at: accepted_at.map(|s| parse_rfc3339(&s)),
        decision: match decision.as_str() {
            "accepted" => AcceptanceDecision::Accepted,
            "rejected" => AcceptanceDecision::Rejected,
            _ => AcceptanceDecision::Pending,
        },
        raw: serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null),
    }
}

fn decision_str(d: AcceptanceDecision) -> &'static str {
    match d {
        AcceptanceDecision::Pending => "pending",
        AcceptanceDecision::Accepted => "accepted",
        AcceptanceDecision::Rejected => "rejected",
    }
}

fn ad_from_row(row: &SqliteRow) -> Advertisement {
    let payment_methods: String = row.get("payment_methods");
    let status: String = row.get("status");
    Advertisement {
        id: AdvertisementId::from_str(&row.get::<String, _>("id")).unwrap(),
        platform_ad_id: row.get("platform_ad_id"),
        account_id: AccountId::from_str(&row.get::<String, _>("account_id")).expect("valid uuid"),
        side: Side::Sell,
        asset: row.get("asset"),
        fiat: row.get("fiat"),
        unit_price: Money::from_minor_units(row.get("unit_price")),
        quantity: Money::from_minor_units(row.get("quantity")),
        min_amount: Money::from_minor_units(row.get("min_amount")),
        max_amount: Money::from_minor_units(row.get("max_amount")),
        payment_methods: serde_json::from_str::<BTreeSet<String>>(&payment_methods)
            .unwrap_or_default(),
        status: match status.as_str() {
            "online" => AdvertisementStatus::Online,
            "deleted" => AdvertisementStatus::Deleted,
            _ => AdvertisementStatus::Offline,
        },
    }
}

fn ad_status_str(s: AdvertisementStatus) -> &'static str {
    match s {
        AdvertisementStatus::Online => "online",
        AdvertisementStatus::Offline => "offline",
        AdvertisementStatus::Deleted => "deleted",
    }
}

fn tx_status_str(s: TransactionStatus) -> &'static str {
    match s {
        TransactionStatus::Pending => "pending",
        TransactionStatus::ChatStarted => "chat_started",
        TransactionStatus::WaitingPayment => "waiting_payment",
        TransactionStatus::PaymentReceived => "payment_received",
        TransactionStatus::CheckReceived => "check_received",
        TransactionStatus::Completed => "completed",
        TransactionStatus::CancelledByCounterparty => "cancelled_by_counterparty",
        TransactionStatus::Failed => "failed",
        TransactionStatus::Stupid => "stupid",
    }
}

fn tx_status_from_str(s: &str) -> TransactionStatus {
    match s {
        "chat_started" => TransactionStatus::ChatStarted,
        "waiting_payment" => TransactionStatus::WaitingPayment,
        "payment_received" => TransactionStatus::PaymentReceived,
        "check_received" => TransactionStatus::CheckReceived,
        "completed" => TransactionStatus::Completed,
        "cancelled_by_counterparty" => TransactionStatus::CancelledByCounterparty,
        "failed" => TransactionStatus::Failed,
        "stupid" => TransactionStatus::Stupid,
        _ => TransactionStatus::Pending,
    }
}

fn failure_reason_str(r: FailureReason) -> &'static str {
    match r {
        FailureReason::RetryBudgetExhausted => "retry_budget_exhausted",
        FailureReason::AmountMismatch => "amount_mismatch",
        FailureReason::ReleaseApiError => "release_api_error",
        FailureReason::OperatorForced => "operator_forced",
    }
}

fn failure_reason_from_str(s: &str) -> FailureReason {
    match s {
        "amount_mismatch" => FailureReason::AmountMismatch,
        "release_api_error" => FailureReason::ReleaseApiError,
        "operator_forced" => FailureReason::OperatorForced,
        _ => FailureReason::RetryBudgetExhausted,
    }
}

fn tx_from_row(row: &SqliteRow) -> Transaction {
    let status: String = row.get("status");
    let failure_reason: Option<String> = row.get("failure_reason");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Transaction {
        id: TransactionId::from_str(&row.get::<String, _>("id")).unwrap(),
        payout_id: PayoutId::new(row.get::<String, _>("payout_id")),
        advertisement_id: AdvertisementId::from_str(&row.get::<String, _>("advertisement_id"))
            .unwrap(),
        order_id: row.get("order_id"),
        status: tx_status_from_str(&status),
        chat_step: row.get::<i64, _>("chat_step") as u32,
        failure_reason: failure_reason.map(|s| failure_reason_from_str(&s)),
        created_at: parse_rfc3339(&created_at),
        updated_at: parse_rfc3339(&updated_at),
    }
}

fn sender_str(s: ChatSender) -> &'static str {
    match s {
        ChatSender::Us => "us",
        ChatSender::Them => "them",
        ChatSender::System => "system",
    }
}

fn sender_from_str(s: &str) -> ChatSender {
    match s {
        "us" => ChatSender::Us,
        "system" => ChatSender::System,
        _ => ChatSender::Them,
    }
}

fn content_type_str(c: ChatContentType) -> &'static str {
    match c {
        ChatContentType::Text => "text",
        ChatContentType::Image => "image",
        ChatContentType::Pdf => "pdf",
    }
}

fn content_type_from_str(s: &str) -> ChatContentType {
    match s {
        "image" => ChatContentType::Image,
        "pdf" => ChatContentType::Pdf,
        _ => ChatContentType::Text,
    }
}

fn chat_message_from_row(row: &SqliteRow) -> ChatMessage {
    let sender: String = row.get("sender");
    let content_type: String = row.get("content_type");
    let sent_at: String = row.get("sent_at");
    ChatMessage {
        id: ChatMessageId::from_str(&row.get::<String, _>("id")).unwrap(),
        transaction_id: TransactionId::from_str(&row.get::<String, _>("transaction_id")).unwrap(),
        external_message_id: row.get("external_message_id"),
        sender: sender_from_str(&sender),
        body: row.get("body"),
        content_type: content_type_from_str(&content_type),
        sent_at: parse_rfc3339(&sent_at),
        processed: row.get::<i64, _>("processed") != 0,
    }
}

fn receipt_from_row(row: &SqliteRow) -> Receipt {
    let fields: Option<String> = row.get("fields");
    let linked: Option<String> = row.get("linked_transaction_id");
    Receipt {
        id: ReceiptId::from_str(&row.get::<String, _>("id")).unwrap(),
        source_email_id: row.get("source_email_id"),
        file_path: row.get("file_path"),
        fields: fields.and_then(|s| serde_json::from_str::<ReceiptFields>(&s).ok()),
        processed: row.get::<i64, _>("processed") != 0,
        linked_transaction_id: linked.map(|s| TransactionId::from_str(&s).unwrap()),
        file_hash: row.get("file_hash"),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let credentials = serde_json::to_string(&account.credentials)
            .expect("Credentials always serializes");
        sqlx::query(
            "INSERT INTO accounts (id, platform, label, status, error_message, next_refresh_at, credentials, session_blob)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               label = excluded.label,
               status = excluded.status,
               error_message = excluded.error_message,
               next_refresh_at = excluded.next_refresh_at,
               credentials = excluded.credentials,
               session_blob = excluded.session_blob",
        )
        .bind(account.id.to_string())
        .bind(platform_str(account.platform))
        .bind(&account.label)
        .bind(account_status_str(account.status))
        .bind(&account.error_message)
        .bind(account.next_refresh_at.map(rfc3339))
        .bind(credentials)
        .bind(&account.session_blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn list_accounts(&self, platform: PlatformTag) -> Result<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE platform = ?")
            .bind(platform_str(platform))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn upsert_payout(&self, payout: &Payout) -> Result<()> {
        sqlx::query(
            "INSERT INTO payouts (id, account_id, amount, recipient_identifier, bank_name, recipient_name, external_status, accepted_at, decision, raw)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               amount = excluded.amount,
               recipient_identifier = excluded.recipient_identifier,
               bank_name = excluded.bank_name,
               recipient_name = excluded.recipient_name,
               external_status = excluded.external_status,
               accepted_at = excluded.accepted_at,
               decision = excluded.decision,
               raw = excluded.raw",
        )
        .bind(payout.id.as_str())
        .bind(payout.account_id.to_string())
        .bind(payout.amount.minor_units())
        .bind(&payout.recipient_identifier)
        .bind(&payout.bank_name)
        .bind(&payout.recipient_name)
        .bind(payout.external_status)
        .bind(payout.accepted_at.map(rfc3339))
        .bind(decision_str(payout.decision))
        .bind(payout.raw.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_payout(&self, id: &PayoutId) -> Result<Option<Payout>> {
        let row = sqlx::query("SELECT * FROM payouts WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(payout_from_row))
    }

    async fn list_accepted_payouts_without_transaction(&self) -> Result<Vec<Payout>> {
        let rows = sqlx::query(
            "SELECT p.* FROM payouts p
             LEFT JOIN transactions t ON t.payout_id = p.id
             WHERE p.decision = 'accepted' AND t.id IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(payout_from_row).collect())
    }

    async fn list_payouts_pending_review(&self) -> Result<Vec<Payout>> {
        let rows = sqlx::query("SELECT * FROM payouts WHERE decision = 'pending'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(payout_from_row).collect())
    }

    async fn insert_advertisement(&self, ad: &Advertisement) -> Result<()> {
        sqlx::query(
            "INSERT INTO advertisements (id, platform_ad_id, account_id, side, asset, fiat, unit_price, quantity, min_amount, max_amount, payment_methods, status, created_at)
             VALUES (?, ?, ?, 'sell', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(ad.id.to_string())
        .bind(&ad.platform_ad_id)
        .bind(ad.account_id.to_string())
        .bind(&ad.asset)
        .bind(&ad.fiat)
        .bind(ad.unit_price.minor_units())
        .bind(ad.quantity.minor_units())
        .bind(ad.min_amount.minor_units())
        .bind(ad.max_amount.minor_units())
        .bind(serde_json::to_string(&ad.payment_methods).unwrap())
        .bind(ad_status_str(ad.status))
        .bind(rfc3339(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_advertisement(&self, id: AdvertisementId) -> Result<Option<Advertisement>> {
        let row = sqlx::query("SELECT * FROM advertisements WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(ad_from_row))
    }

    async fn find_advertisement_by_platform_ad_id(
        &self,
        platform_ad_id: &str,
    ) -> Result<Option<Advertisement>> {
        let row = sqlx::query("SELECT * FROM advertisements WHERE platform_ad_id = ?")
            .bind(platform_ad_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(ad_from_row))
    }

    async fn update_advertisement_status(
        &self,
        id: AdvertisementId,
        status: AdvertisementStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE advertisements SET status = ? WHERE id = ?")
            .bind(ad_status_str(status))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_advertisement(&self, id: AdvertisementId) -> Result<()> {
        sqlx::query("DELETE FROM advertisements WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_active_advertisements_for_account(&self, account_id: AccountId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM advertisements WHERE account_id = ? AND status != 'deleted'",
        )
        .bind(account_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    async fn recent_advertisements_for_account(
        &self,
        account_id: AccountId,
        since: OffsetDateTime,
    ) -> Result<Vec<Advertisement>> {
        let rows = sqlx::query(
            "SELECT * FROM advertisements WHERE account_id = ? AND created_at >= ? ORDER BY created_at DESC",
        )
        .bind(account_id.to_string())
        .bind(rfc3339(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(ad_from_row).collect())
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        sqlx::query(
            "INSERT INTO transactions (id, payout_id, advertisement_id, order_id, status, chat_step, failure_reason, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tx.id.to_string())
        .bind(tx.payout_id.as_str())
        .bind(tx.advertisement_id.to_string())
        .bind(&tx.order_id)
        .bind(tx_status_str(tx.status))
        .bind(tx.chat_step as i64)
        .bind(tx.failure_reason.map(failure_reason_str))
        .bind(rfc3339(tx.created_at))
        .bind(rfc3339(tx.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tx_from_row))
    }

    async fn find_transaction_by_order_id(&self, order_id: &str) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tx_from_row))
    }

    async fn find_transaction_by_advertisement(
        &self,
        advertisement_id: AdvertisementId,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE advertisement_id = ?")
            .bind(advertisement_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(tx_from_row))
    }

    async fn list_non_terminal_transactions(&self) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE status NOT IN ('completed', 'failed', 'cancelled_by_counterparty', 'stupid')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tx_from_row).collect())
    }

    async fn all_known_order_ids(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT order_id FROM transactions WHERE order_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get::<Option<String>, _>("order_id"))
            .collect())
    }

    async fn link_order_id(&self, id: TransactionId, order_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET order_id = ?, updated_at = ? WHERE id = ? AND order_id IS NULL",
        )
        .bind(order_id)
        .bind(rfc3339(OffsetDateTime::now_utc()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cas_transition(
        &self,
        id: TransactionId,
        expected: TransactionStatus,
        next: TransactionStatus,
        failure_reason: Option<FailureReason>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transactions SET status = ?, failure_reason = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(tx_status_str(next))
        .bind(failure_reason.map(failure_reason_str))
        .bind(rfc3339(OffsetDateTime::now_utc()))
        .bind(id.to_string())
        .bind(tx_status_str(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_chat_step(&self, id: TransactionId, step: u32) -> Result<()> {
        sqlx::query("UPDATE transactions SET chat_step = ?, updated_at = ? WHERE id = ?")
            .bind(step as i64)
            .bind(rfc3339(OffsetDateTime::now_utc()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_transaction(&self, id: TransactionId) -> Result<()> {
        sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_chat_message(&self, message: &ChatMessage) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO chat_messages (id, transaction_id, external_message_id, sender, body, content_type, sent_at, processed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(external_message_id) DO NOTHING",
        )
        .bind(message.id.to_string())
        .bind(message.transaction_id.to_string())
        .bind(&message.external_message_id)
        .bind(sender_str(message.sender))
        .bind(&message.body)
        .bind(content_type_str(message.content_type))
        .bind(rfc3339(message.sent_at))
        .bind(message.processed as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_recent_chat_messages(
        &self,
        transaction_id: TransactionId,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE transaction_id = ? ORDER BY external_message_id DESC LIMIT ?",
        )
        .bind(transaction_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chat_message_from_row).collect())
    }

    async fn has_message_from(
        &self,
        transaction_id: TransactionId,
        sender: ChatSender,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM chat_messages WHERE transaction_id = ? AND sender = ?",
        )
        .bind(transaction_id.to_string())
        .bind(sender_str(sender))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn mark_chat_message_processed(&self, id: ChatMessageId) -> Result<()> {
        sqlx::query("UPDATE chat_messages SET processed = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_chat_messages(&self, transaction_id: TransactionId) -> Result<()> {
        sqlx::query("DELETE FROM chat_messages WHERE transaction_id = ?")
            .bind(transaction_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_step_send(
        &self,
        transaction_id: TransactionId,
        step: u32,
        message_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_step_sends (transaction_id, step, message_id) VALUES (?, ?, ?)
             ON CONFLICT(transaction_id, step) DO NOTHING",
        )
        .bind(transaction_id.to_string())
        .bind(step as i64)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn step_send(&self, transaction_id: TransactionId, step: u32) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT message_id FROM chat_step_sends WHERE transaction_id = ? AND step = ?",
        )
        .bind(transaction_id.to_string())
        .bind(step as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("message_id")))
    }

    async fn insert_receipt(&self, receipt: &Receipt) -> Result<()> {
        sqlx::query(
            "INSERT INTO receipts (id, source_email_id, file_path, fields, processed, linked_transaction_id, file_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(file_hash) DO NOTHING",
        )
        .bind(receipt.id.to_string())
        .bind(&receipt.source_email_id)
        .bind(&receipt.file_path)
        .bind(
            receipt
                .fields
                .as_ref()
                .map(|f| serde_json::to_string(f).unwrap()),
        )
        .bind(receipt.processed as i64)
        .bind(receipt.linked_transaction_id.map(|id| id.to_string()))
        .bind(&receipt.file_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_receipt_by_hash(&self, hash: &str) -> Result<Option<Receipt>> {
        let row = sqlx::query("SELECT * FROM receipts WHERE file_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(receipt_from_row))
    }

    async fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>> {
        let rows = sqlx::query(
            "SELECT * FROM receipts WHERE processed = 0 AND fields IS NOT NULL AND linked_transaction_id IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(receipt_from_row).collect())
    }

    async fn mark_receipt_matched(
        &self,
        id: ReceiptId,
        transaction_id: TransactionId,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE receipts SET processed = 1, linked_transaction_id = ? WHERE id = ?",
        )
        .bind(transaction_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_stats(&self, task_id: &str) -> Result<Option<TaskStatsRow>> {
        let row = sqlx::query("SELECT * FROM scheduler_task_stats WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let last_run_at: Option<String> = row.get("last_run_at");
            TaskStatsRow {
                task_id: row.get("task_id"),
                run_count: row.get::<i64, _>("run_count") as u64,
                last_run_at: last_run_at.map(|s| parse_rfc3339(&s)),
                last_error: row.get("last_error"),
                consecutive_failures: row.get::<i64, _>("consecutive_failures") as u32,
                current_interval_ms: row.get::<i64, _>("current_interval_ms") as u64,
            }
        }))
    }

    async fn upsert_task_stats(&self, stats: &TaskStatsRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduler_task_stats (task_id, run_count, last_run_at, last_error, consecutive_failures, current_interval_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(task_id) DO UPDATE SET
               run_count = excluded.run_count,
               last_run_at = excluded.last_run_at,
               last_error = excluded.last_error,
               consecutive_failures = excluded.consecutive_failures,
               current_interval_ms = excluded.current_interval_ms",
        )
        .bind(&stats.task_id)
        .bind(stats.run_count as i64)
        .bind(stats.last_run_at.map(rfc3339))
        .bind(&stats.last_error)
        .bind(stats.consecutive_failures as i64)
        .bind(stats.current_interval_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{AccountId, Advertisement, Money, Payout, Transaction};
    use std::collections::BTreeSet;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.unwrap()
    }

    fn sample_payout(account_id: AccountId) -> Payout {
        Payout {
            id: PayoutId::new("p1"),
            account_id,
            amount: Money::from_minor_units(1_500_000),
            recipient_identifier: "+79991234567".into(),
            bank_name: "Сбербанк".into(),
            recipient_name: "Ivan Ivanov".into(),
            external_status: 4,
            accepted_at: None,
            decision: AcceptanceDecision::Pending,
            raw: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn payout_round_trips() {
        let store = store().await;
        let account_id = AccountId::new();
        let payout = sample_payout(account_id);
        store.upsert_payout(&payout).await.unwrap();
        let fetched = store.find_payout(&payout.id).await.unwrap().unwrap();
        assert_eq!(fetched.amount, payout.amount);
        assert_eq!(fetched.bank_name, payout.bank_name);
    }

    #[tokio::test]
    async fn cas_transition_rejects_unexpected_status() {
        let store = store().await;
        let account_id = AccountId::new();
        let payout = sample_payout(account_id);
        store.upsert_payout(&payout).await.unwrap();
        let ad = Advertisement {
            id: AdvertisementId::new(),
            platform_ad_id: "A1".into(),
            account_id,
            side: Side::Sell,
            asset: "crypto".into(),
            fiat: "RUB".into(),
            unit_price: Money::from_minor_units(10_000),
            quantity: payout.amount,
            min_amount: payout.amount,
            max_amount: payout.amount,
            payment_methods: BTreeSet::new(),
            status: AdvertisementStatus::Online,
        };
        store.insert_advertisement(&ad).await.unwrap();
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
        store.insert_transaction(&tx).await.unwrap();

        let applied = store
            .cas_transition(
                tx.id,
                TransactionStatus::WaitingPayment,
                TransactionStatus::Completed,
                None,
            )
            .await
            .unwrap();
        assert!(!applied, "CAS must reject a stale expected status");

        let applied = store
            .cas_transition(
                tx.id,
                TransactionStatus::Pending,
                TransactionStatus::ChatStarted,
                None,
            )
            .await
            .unwrap();
        assert!(applied);

        let reloaded = store.find_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TransactionStatus::ChatStarted);
    }

    #[tokio::test]
    async fn chat_message_upsert_is_idempotent_on_external_id() {
        let store = store().await;
        let tx_id = TransactionId::new();
        let now = OffsetDateTime::now_utc();
        let msg = ChatMessage {
            id: ChatMessageId::new(),
            transaction_id: tx_id,
            external_message_id: "ext-1".into(),
            sender: ChatSender::Them,
            body: "да".into(),
            content_type: ChatContentType::Text,
            sent_at: now,
            processed: false,
        };
        assert!(store.upsert_chat_message(&msg).await.unwrap());
        assert!(!store.upsert_chat_message(&msg).await.unwrap());
        let all = store.list_recent_chat_messages(tx_id, 10).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
