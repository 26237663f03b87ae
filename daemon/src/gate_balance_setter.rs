//! Gate Balance Setter, per spec.md §6's "a platform quirk required every
//! 4 h": Platform-D requires a fictitious balance to be (re-)set
//! periodically on every account or payouts stop flowing.

use crate::account_registry::AccountRegistry;
use crate::config::Config;
use crate::store::Store;
use model::PlatformTag;
use std::sync::Arc;
use tracing::{info, warn};

pub struct GateBalanceSetter {
    store: Arc<dyn Store>,
    registry: Arc<AccountRegistry>,
    config: Config,
}

impl GateBalanceSetter {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AccountRegistry>, config: Config) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        for account in self.store.list_accounts(PlatformTag::PlatformD).await? {
            let Some(client) = self.registry.client_d(account.id).await else {
                continue;
            };
            match client.set_balance(self.config.gate.default_balance).await {
                Ok(()) => info!(account_id = %account.id, "gate balance reset"),
                Err(err) => warn!(account_id = %account.id, error = %err, "gate balance reset failed"),
            }
        }
        Ok(())
    }
}
