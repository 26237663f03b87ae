//! Platform-D client: session-cookie HTTP, per spec.md §6.

use crate::errors::PlatformDError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Result<T> = std::result::Result<T, PlatformDError>;

/// External status codes from spec.md §6. Config may remap these (Design
/// Notes §9's "take status codes from configuration"); this is just the
/// wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutStatusCode {
    Created,
    Accepted,
    Rejected,
    Pending,
    AcceptedWaiting,
    Completed,
    Other(i32),
}

impl From<i32> for PayoutStatusCode {
    fn from(code: i32) -> Self {
        match code {
            1 => PayoutStatusCode::Created,
            2 => PayoutStatusCode::Accepted,
            3 => PayoutStatusCode::Rejected,
            4 => PayoutStatusCode::Pending,
            5 => PayoutStatusCode::AcceptedWaiting,
            7 => PayoutStatusCode::Completed,
            other => PayoutStatusCode::Other(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPayout {
    pub id: String,
    pub status: i32,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub wallet: Option<String>,
    #[serde(default)]
    pub bank: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(flatten)]
    pub raw: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutAction {
    Accept,
    Reject,
    Approve,
}

impl PayoutAction {
    fn as_str(&self) -> &'static str {
        match self {
            PayoutAction::Accept => "accept",
            PayoutAction::Reject => "reject",
            PayoutAction::Approve => "approve",
        }
    }
}

#[async_trait]
pub trait PlatformD: Send + Sync {
    async fn login(&self, login: &str, password: &str) -> Result<String>;
    /// `GET /payments/payouts?page=&filters[status][]=`.
    async fn list_payouts(&self, status: i32, page: u32) -> Result<Vec<RawPayout>>;
    /// `POST /payments/payouts/{id}/accept`; reveals amount/recipient.
    async fn accept(&self, payout_id: &str) -> Result<RawPayout>;
    async fn action(&self, payout_id: &str, action: PayoutAction) -> Result<()>;
    /// The `POST /balance/set` quirk: set a fictitious balance, required
    /// every 4h per spec.md §6.
    async fn set_balance(&self, amount: i64) -> Result<()>;
}

pub struct HttpPlatformD {
    client: reqwest::Client,
    base_url: String,
    session_cookie: std::sync::Mutex<Option<String>>,
}

impl HttpPlatformD {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            session_cookie: std::sync::Mutex::new(None),
        }
    }

    pub fn with_session(base_url: impl Into<String>, session_cookie: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            session_cookie: std::sync::Mutex::new(Some(session_cookie)),
        }
    }

    fn cookie_header(&self) -> Option<String> {
        self.session_cookie.lock().unwrap().clone()
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    response: T,
}

#[derive(Debug, Deserialize)]
struct PayoutsPage {
    payouts: PayoutsData,
}

#[derive(Debug, Deserialize)]
struct PayoutsData {
    data: Vec<RawPayout>,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[async_trait]
impl PlatformD for HttpPlatformD {
    async fn login(&self, login: &str, password: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/auth/basic/login", self.base_url))
            .json(&LoginRequest { login, password })
            .send()
            .await?;
        let cookie = resp
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        let body: Envelope<Value> = resp.json().await?;
        if !body.success {
            return Err(PlatformDError::UnexpectedPayload(
                "login did not return success".into(),
            ));
        }
        *self.session_cookie.lock().unwrap() = Some(cookie.clone());
        Ok(cookie)
    }

    async fn list_payouts(&self, status: i32, page: u32) -> Result<Vec<RawPayout>> {
        let mut request = self.client.get(format!("{}/payments/payouts", self.base_url)).query(&[
            ("page", page.to_string()),
            ("filters[status][]", status.to_string()),
        ]);
        if let Some(cookie) = self.cookie_header() {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let resp = request.send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PlatformDError::SessionExpired);
        }
        let body: Envelope<PayoutsPage> = resp.json().await?;
        Ok(body.response.payouts.data)
    }

    async fn accept(&self, payout_id: &str) -> Result<RawPayout> {
        let mut request = self
            .client
            .post(format!("{}/payments/payouts/{}/accept", self.base_url, payout_id));
        if let Some(cookie) = self.cookie_header() {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let resp = request.send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PlatformDError::SessionExpired);
        }
        let body: Envelope<RawPayout> = resp.json().await?;
        Ok(body.response)
    }

    async fn action(&self, payout_id: &str, action: PayoutAction) -> Result<()> {
        let mut request = self
            .client
            .post(format!("{}/payments/payouts/{}/action", self.base_url, payout_id))
            .json(&serde_json::json!({ "action": action.as_str() }));
        if let Some(cookie) = self.cookie_header() {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let resp = request.send().await?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PlatformDError::SessionExpired);
        }
        Ok(())
    }

    async fn set_balance(&self, amount: i64) -> Result<()> {
        let mut request = self
            .client
            .post(format!("{}/balance/set", self.base_url))
            .json(&serde_json::json!({ "balance": amount }));
        if let Some(cookie) = self.cookie_header() {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        request.send().await?;
        Ok(())
    }
}
