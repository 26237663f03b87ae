use crate::ids::AccountId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum PlatformTag {
    PlatformD,
    PlatformX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Initializing,
    Error,
    Disabled,
}

/// Credential material, one variant per platform (§3's "credential
/// material"). Platform-D authenticates with a login/password pair and gets
/// a session cookie back; Platform-X signs every request with an API
/// key/secret pair and never holds a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    PlatformD { login: String, password: String },
    PlatformX { api_key: String, api_secret: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub platform: PlatformTag,
    pub label: String,
    pub status: AccountStatus,
    pub error_message: Option<String>,
    pub next_refresh_at: Option<OffsetDateTime>,
    pub credentials: Credentials,
    /// Platform-D's emailed session cookie, persisted across runs (§4.2).
    /// Opaque to everyone but the account registry and the Platform-D
    /// client.
    pub session_blob: Option<String>,
}
