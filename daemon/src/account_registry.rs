//! Account Registry (C2), per spec.md §4.2.
//!
//! Owns platform clients exclusively; everyone else borrows by
//! [`AccountId`] (§3's "Ownership"). The registry is the only writer of
//! `Account.status`/`session_blob`/`next_refresh_at`.

use crate::config::Config;
use crate::platform::platform_d::{HttpPlatformD, PlatformD};
use crate::platform::platform_x::{HttpPlatformX, PlatformX};
use crate::store::Store;
use model::{Account, AccountId, AccountStatus, Credentials, PlatformTag};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Sessions within this window of expiry are refreshed proactively (§4.2).
const REFRESH_LOOKAHEAD: TimeDuration = TimeDuration::minutes(1);
/// Normal re-check interval for a healthy or errored session (§4.2 default).
const REFRESH_INTERVAL: TimeDuration = TimeDuration::minutes(5);

#[derive(Clone)]
pub enum PlatformClient {
    D(Arc<dyn PlatformD>),
    X(Arc<dyn PlatformX>),
}

/// Per-account client map plus the background session-refresh contract.
pub struct AccountRegistry {
    store: Arc<dyn Store>,
    config: Config,
    clients: RwLock<HashMap<AccountId, PlatformClient>>,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self {
            store,
            config,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds any accounts from configuration that the store doesn't know
    /// about yet, then logs every configured account in. Run once at boot,
    /// before the periodic ticker starts (spec.md §4.1's "Initial sequence").
    pub async fn boot(&self) -> anyhow::Result<()> {
        self.seed_from_config().await?;
        for platform in [PlatformTag::PlatformD, PlatformTag::PlatformX] {
            for account in self.store.list_accounts(platform).await? {
                self.refresh_account(&account).await;
            }
        }
        Ok(())
    }

    async fn seed_from_config(&self) -> anyhow::Result<()> {
        for configured in &self.config.accounts {
            let platform = match configured.credentials {
                Credentials::PlatformD { .. } => PlatformTag::PlatformD,
                Credentials::PlatformX { .. } => PlatformTag::PlatformX,
            };
            let existing = self
                .store
                .list_accounts(platform)
                .await?
                .into_iter()
                .find(|a| a.label == configured.label);
            if existing.is_some() {
                continue;
            }
            let account = Account {
                id: AccountId::new(),
                platform,
                label: configured.label.clone(),
                status: AccountStatus::Initializing,
                error_message: None,
                next_refresh_at: None,
                credentials: configured.credentials.clone(),
                session_blob: None,
            };
            self.store.upsert_account(&account).await?;
        }
        Ok(())
    }

    /// Seeds the client map directly, bypassing `refresh_account`'s
    /// credential-based login. The only seam for handing the registry a
    /// fake `PlatformD` in tests, so components' real `run()` can be
    /// exercised end-to-end against a fake platform instead of one that
    /// hand-replays the component's logic.
    pub async fn inject_client_d(&self, id: AccountId, client: Arc<dyn PlatformD>) {
        self.clients.write().await.insert(id, PlatformClient::D(client));
    }

    /// Same seam as [`AccountRegistry::inject_client_d`], for Platform-X.
    pub async fn inject_client_x(&self, id: AccountId, client: Arc<dyn PlatformX>) {
        self.clients.write().await.insert(id, PlatformClient::X(client));
    }

    pub async fn client_d(&self, id: AccountId) -> Option<Arc<dyn PlatformD>> {
        match self.clients.read().await.get(&id) {
            Some(PlatformClient::D(client)) => Some(client.clone() as Arc<dyn PlatformD>),
            _ => None,
        }
    }

    pub async fn client_x(&self, id: AccountId) -> Option<Arc<dyn PlatformX>> {
        match self.clients.read().await.get(&id) {
            Some(PlatformClient::X(client)) => Some(client.clone() as Arc<dyn PlatformX>),
            _ => None,
        }
    }

    /// Scheduler task body: refreshes any account whose `next_refresh_at` is
    /// within [`REFRESH_LOOKAHEAD`], or has none yet.
    pub async fn refresh_due_sessions(&self) -> anyhow::Result<()> {
        let now = OffsetDateTime::now_utc();
        for platform in [PlatformTag::PlatformD, PlatformTag::PlatformX] {
            for account in self.store.list_accounts(platform).await? {
                let due = account
                    .next_refresh_at
                    .map(|at| at - now <= REFRESH_LOOKAHEAD)
                    .unwrap_or(true);
                if due {
                    self.refresh_account(&account).await;
                }
            }
        }
        Ok(())
    }

    /// Re-measures Platform-X clock drift for one account, called on a
    /// signature-expired error from that account's client (§4.2).
    pub async fn resync_time(&self, id: AccountId) -> anyhow::Result<()> {
        let client = match self.clients.read().await.get(&id) {
            Some(PlatformClient::X(client)) => client.clone(),
            _ => return Ok(()),
        };
        let server_ms = client.server_time_ms().await?;
        let local_ms = OffsetDateTime::now_utc().unix_timestamp() * 1000;
        client.set_drift_offset_ms(server_ms - local_ms);
        Ok(())
    }

    async fn refresh_account(&self, account: &Account) {
        match &account.credentials {
            Credentials::PlatformD { login, password } => {
                self.refresh_platform_d(account, login, password).await
            }
            Credentials::PlatformX {
                api_key,
                api_secret,
            } => self.refresh_platform_x(account, api_key, api_secret).await,
        }
    }

    async fn refresh_platform_d(&self, account: &Account, login: &str, password: &str) {
        let client = HttpPlatformD::new(self.config.gate.base_url.clone());
        match client.login(login, password).await {
            Ok(cookie) => {
                info!(account_id = %account.id, "platform-d session refreshed");
                self.mark_active(account, Some(cookie.clone())).await;
                self.clients.write().await.insert(
                    account.id,
                    PlatformClient::D(Arc::new(HttpPlatformD::with_session(
                        self.config.gate.base_url.clone(),
                        cookie,
                    ))),
                );
            }
            Err(err) => {
                warn!(account_id = %account.id, error = %err, "platform-d login failed");
                self.mark_error(account, err.to_string()).await;
            }
        }
    }

    async fn refresh_platform_x(&self, account: &Account, api_key: &str, api_secret: &str) {
        let client = HttpPlatformX::new(
            self.config.bybit.base_url.clone(),
            api_key.to_string(),
            api_secret.to_string(),
        );
        match client.server_time_ms().await {
            Ok(server_ms) => {
                let local_ms = OffsetDateTime::now_utc().unix_timestamp() * 1000;
                client.set_drift_offset_ms(server_ms - local_ms);
                info!(account_id = %account.id, "platform-x time sync complete");
                self.mark_active(account, None).await;
                self.clients
                    .write()
                    .await
                    .insert(account.id, PlatformClient::X(Arc::new(client)));
            }
            Err(err) => {
                error!(account_id = %account.id, error = %err, "platform-x time sync failed");
                self.mark_error(account, err.to_string()).await;
            }
        }
    }

    async fn mark_active(&self, account: &Account, session_blob: Option<String>) {
        let mut updated = account.clone();
        updated.status = AccountStatus::Active;
        updated.error_message = None;
        updated.next_refresh_at = Some(OffsetDateTime::now_utc() + REFRESH_INTERVAL);
        if session_blob.is_some() {
            updated.session_blob = session_blob;
        }
        if let Err(err) = self.store.upsert_account(&updated).await {
            error!(account_id = %account.id, error = %err, "failed to persist account refresh");
        }
    }

    async fn mark_error(&self, account: &Account, message: String) {
        let mut updated = account.clone();
        updated.status = AccountStatus::Error;
        updated.error_message = Some(message);
        updated.next_refresh_at = Some(OffsetDateTime::now_utc() + REFRESH_INTERVAL);
        if let Err(err) = self.store.upsert_account(&updated).await {
            error!(account_id = %account.id, error = %err, "failed to persist account error state");
        }
    }
}
