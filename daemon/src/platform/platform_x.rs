//! Platform-X client: HMAC-signed REST, per spec.md §6.
//!
//! Signature = `HMAC-SHA256(apiSecret, timestamp||apiKey||recvWindow||sortedQueryString)`
//! sent in `X-BAPI-SIGN`, alongside `X-BAPI-API-KEY`, `X-BAPI-TIMESTAMP`,
//! `X-BAPI-RECV-WINDOW`.

use crate::errors::PlatformXError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::BTreeMap;

pub type Result<T> = std::result::Result<T, PlatformXError>;

/// Order status integers from spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    PaymentProcessing,
    WaitingCoinTransfer,
    Completed,
    Cancelled,
    Dispute,
    Other(i32),
}

impl From<i32> for OrderStatus {
    fn from(code: i32) -> Self {
        match code {
            10 => OrderStatus::PaymentProcessing,
            20 => OrderStatus::WaitingCoinTransfer,
            30 => OrderStatus::Completed,
            40 => OrderStatus::Cancelled,
            50 => OrderStatus::Dispute,
            other => OrderStatus::Other(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawOrder {
    #[serde(rename = "id")]
    pub order_id: String,
    pub status: i32,
    pub amount: i64,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "itemId", default)]
    pub item_id: Option<String>,
    #[serde(flatten)]
    pub raw: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChatMessage {
    #[serde(rename = "id")]
    pub message_id: String,
    #[serde(rename = "msgType", default)]
    pub msg_type: i32,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub message: String,
    #[serde(rename = "contentType", default)]
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAdRequest {
    pub side: &'static str,
    pub asset: String,
    pub fiat: String,
    pub price: String,
    pub quantity: String,
    #[serde(rename = "minAmount")]
    pub min_amount: String,
    #[serde(rename = "maxAmount")]
    pub max_amount: String,
    #[serde(rename = "paymentMethods")]
    pub payment_methods: Vec<String>,
}

#[async_trait]
pub trait PlatformX: Send + Sync {
    /// `POST /v5/p2p/order/pending/simplifyList`, statuses 10 and 20.
    async fn list_orders(&self, statuses: &[i32]) -> Result<Vec<RawOrder>>;
    async fn order_info(&self, order_id: &str) -> Result<RawOrder>;
    async fn list_chat_messages(&self, order_id: &str, limit: u32) -> Result<Vec<RawChatMessage>>;
    async fn send_chat_message(&self, order_id: &str, text: &str) -> Result<String>;
    async fn create_ad(&self, request: &CreateAdRequest) -> Result<String>;
    async fn cancel_ad(&self, ad_id: &str) -> Result<()>;
    async fn release_order(&self, order_id: &str) -> Result<()>;
    async fn wallet_balance(&self) -> Result<i64>;
    /// Server-time sync, used to compute the drift offset at boot and on
    /// any clock-skew error (spec.md §4.2).
    async fn server_time_ms(&self) -> Result<i64>;
    /// Records a freshly-measured clock drift (spec.md §4.2). A no-op for
    /// clients that don't sign requests, so fakes need not implement it.
    fn set_drift_offset_ms(&self, _offset_ms: i64) {}
}

pub struct HttpPlatformX {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window_ms: u64,
    /// `local_now_ms + drift_offset_ms == server_now_ms`. Re-measured on
    /// clock-skew errors (§4.2).
    drift_offset_ms: std::sync::atomic::AtomicI64,
}

impl HttpPlatformX {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            recv_window_ms: 5_000,
            drift_offset_ms: std::sync::atomic::AtomicI64::new(0),
        }
    }

    fn timestamp_ms(&self) -> i64 {
        let local = time::OffsetDateTime::now_utc().unix_timestamp() * 1000;
        local + self.drift_offset_ms.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Builds the signature over `timestamp||apiKey||recvWindow||sortedQueryString`
    /// (spec.md §6).
    fn sign(&self, timestamp: i64, sorted_query: &str) -> String {
        let payload = format!(
            "{}{}{}{}",
            timestamp, self.api_key, self.recv_window_ms, sorted_query
        );
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn sorted_query(params: &BTreeMap<&str, String>) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn post_signed<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        params: BTreeMap<&str, String>,
        body: &B,
    ) -> Result<T> {
        let timestamp = self.timestamp_ms();
        let sorted = Self::sorted_query(&params);
        let signature = self.sign(timestamp, &sorted);

        let resp = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature)
            .json(body)
            .send()
            .await?;

        let envelope: RetEnvelope<T> = resp.json().await?;
        check_ret_code(envelope.ret_code, &envelope.ret_msg)?;
        Ok(envelope.result)
    }
}

#[derive(Debug, Deserialize)]
struct RetEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

/// Known rate-limit codes surface as [`PlatformXError::RateLimited`] so the
/// scheduler can back off instead of retrying immediately (spec.md §7).
const RATE_LIMIT_CODES: &[i64] = &[10006, 10018];
const SIGNATURE_EXPIRED_CODES: &[i64] = &[10002, 10004];

fn check_ret_code(code: i64, msg: &str) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    if RATE_LIMIT_CODES.contains(&code) {
        return Err(PlatformXError::RateLimited(code));
    }
    if SIGNATURE_EXPIRED_CODES.contains(&code) {
        return Err(PlatformXError::ClockSkew);
    }
    Err(PlatformXError::Api {
        code,
        msg: msg.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct OrderList {
    #[serde(default)]
    items: Vec<RawOrder>,
}

#[derive(Debug, Deserialize)]
struct ChatList {
    #[serde(default)]
    result: Vec<RawChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AdCreated {
    #[serde(rename = "itemId")]
    item_id: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(rename = "id")]
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct WalletBalance {
    balance: String,
}

#[async_trait]
impl PlatformX for HttpPlatformX {
    async fn list_orders(&self, statuses: &[i32]) -> Result<Vec<RawOrder>> {
        let body = serde_json::json!({ "status": statuses });
        let list: OrderList = self
            .post_signed("/v5/p2p/order/pending/simplifyList", BTreeMap::new(), &body)
            .await?;
        Ok(list.items)
    }

    async fn order_info(&self, order_id: &str) -> Result<RawOrder> {
        let body = serde_json::json!({ "orderId": order_id });
        self.post_signed("/v5/p2p/order/info", BTreeMap::new(), &body)
            .await
    }

    async fn list_chat_messages(&self, order_id: &str, limit: u32) -> Result<Vec<RawChatMessage>> {
        let body = serde_json::json!({ "orderId": order_id, "size": limit });
        let list: ChatList = self
            .post_signed("/v5/p2p/order/message/listpage", BTreeMap::new(), &body)
            .await?;
        Ok(list.result)
    }

    async fn send_chat_message(&self, order_id: &str, text: &str) -> Result<String> {
        let body = serde_json::json!({ "orderId": order_id, "message": text, "contentType": "str" });
        let sent: SentMessage = self
            .post_signed("/v5/p2p/order/message/send", BTreeMap::new(), &body)
            .await?;
        Ok(sent.message_id)
    }

    async fn create_ad(&self, request: &CreateAdRequest) -> Result<String> {
        let created: AdCreated = self
            .post_signed("/v5/p2p/ad/create", BTreeMap::new(), request)
            .await?;
        Ok(created.item_id)
    }

    async fn cancel_ad(&self, ad_id: &str) -> Result<()> {
        let body = serde_json::json!({ "itemId": ad_id });
        let _: Value = self
            .post_signed("/v5/p2p/ad/cancel", BTreeMap::new(), &body)
            .await?;
        Ok(())
    }

    async fn release_order(&self, order_id: &str) -> Result<()> {
        let body = serde_json::json!({ "orderId": order_id });
        let _: Value = self
            .post_signed("/v5/p2p/order/release", BTreeMap::new(), &body)
            .await?;
        Ok(())
    }

    async fn wallet_balance(&self) -> Result<i64> {
        let balance: WalletBalance = self
            .post_signed("/v5/account/wallet-balance", BTreeMap::new(), &serde_json::json!({}))
            .await?;
        balance
            .balance
            .parse()
            .map_err(|_| PlatformXError::Api {
                code: -1,
                msg: "non-numeric wallet balance".into(),
            })
    }

    async fn server_time_ms(&self) -> Result<i64> {
        let resp = self
            .client
            .get(format!("{}/v5/market/time", self.base_url))
            .send()
            .await?;
        #[derive(Deserialize)]
        struct TimeResult {
            #[serde(rename = "timeSecond")]
            time_second: String,
        }
        let envelope: RetEnvelope<TimeResult> = resp.json().await?;
        check_ret_code(envelope.ret_code, &envelope.ret_msg)?;
        let seconds: i64 = envelope.result.time_second.parse().unwrap_or(0);
        Ok(seconds * 1000)
    }

    fn set_drift_offset_ms(&self, offset_ms: i64) {
        self.drift_offset_ms
            .store(offset_ms, std::sync::atomic::Ordering::SeqCst);
    }
}
