//! Boot-time collaborator bundle, per Design Notes' "global singletons
//! become explicit collaborators passed through a context structure".
//!
//! Nothing reaches for these via a global; `main.rs` builds one
//! `AppContext` and hands each component the pieces it needs out of it.

use crate::account_registry::AccountRegistry;
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::store::Store;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn Store>,
    pub events: Arc<EventBus>,
    pub registry: Arc<AccountRegistry>,
    pub config: Config,
}

impl AppContext {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let events = Arc::new(EventBus::new());
        let registry = Arc::new(AccountRegistry::new(store.clone(), config.clone()));
        Self {
            store,
            events,
            registry,
            config,
        }
    }
}
