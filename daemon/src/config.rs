//! TOML configuration, per spec.md §6. Missing file falls back to
//! [`Config::default`]; environment variables are applied on top the same
//! way `taker.rs` layers `figment` merges over `rocket::Config::figment()`.

use model::Credentials;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub automation: AutomationConfig,
    pub bybit: BybitConfig,
    pub gate: GateConfig,
    pub email: EmailConfig,
    pub instant_monitor: InstantMonitorConfig,
    pub receipts: ReceiptsConfig,
    /// Accounts seeded into the store on first boot (§4.2's "for each
    /// configured account"); once persisted, the store is authoritative and
    /// these entries are only consulted for accounts not yet known to it.
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            automation: AutomationConfig::default(),
            bybit: BybitConfig::default(),
            gate: GateConfig::default(),
            email: EmailConfig::default(),
            instant_monitor: InstantMonitorConfig::default(),
            receipts: ReceiptsConfig::default(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub label: String,
    #[serde(flatten)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub start_paused: bool,
    pub intervals: Intervals,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_paused: false,
            intervals: Intervals::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub work_acceptor: u64,
    pub ad_creator: u64,
    pub receipt_processor: u64,
    pub chat_processor: u64,
    pub order_checker: u64,
    pub successer: u64,
    pub gate_balance_setter: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            work_acceptor: 300,
            ad_creator: 10,
            receipt_processor: 10,
            chat_processor: 1,
            order_checker: 1,
            successer: 5,
            gate_balance_setter: 14_400,
        }
    }
}

impl Intervals {
    pub fn work_acceptor(&self) -> Duration {
        Duration::from_secs(self.work_acceptor)
    }

    pub fn ad_creator(&self) -> Duration {
        Duration::from_secs(self.ad_creator)
    }

    pub fn receipt_processor(&self) -> Duration {
        Duration::from_secs(self.receipt_processor)
    }

    pub fn order_checker(&self) -> Duration {
        Duration::from_secs(self.order_checker)
    }

    pub fn gate_balance_setter(&self) -> Duration {
        Duration::from_secs(self.gate_balance_setter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationMode {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub mode: AutomationMode,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            mode: AutomationMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BybitConfig {
    pub base_url: String,
    pub polling_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub recv_window_ms: u64,
    pub ad_price: String,
    pub payment_methods: Vec<String>,
    pub max_ads_per_account: u32,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.platform-x.example".into(),
            polling_interval_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 1000,
            recv_window_ms: 5000,
            ad_price: "1.00".into(),
            payment_methods: Vec::new(),
            max_ads_per_account: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub base_url: String,
    pub default_balance: i64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_url: "https://platform-d.example".into(),
            default_balance: 10_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub base_url: String,
    pub api_key: String,
    pub trusted_senders: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            base_url: "https://email-vendor.example".into(),
            api_key: String::new(),
            trusted_senders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantMonitorConfig {
    pub enabled: bool,
}

impl Default for InstantMonitorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptsConfig {
    /// Bounds concurrent PDF text extractions (CPU-bound, run via
    /// `spawn_blocking`), per spec.md §5.
    pub max_concurrent_extractions: usize,
}

impl Default for ReceiptsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_extractions: 4,
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                toml::from_str(&raw)?
            }
            _ => Config::default(),
        };

        if std::env::var("MODE").as_deref() == Ok("auto") {
            config.automation.mode = AutomationMode::Auto;
        }

        Ok(config)
    }
}
