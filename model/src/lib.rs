//! Shared domain types for the trading agent.
//!
//! Kept dependency-light and serialization-ready, the same way the upstream
//! `model` crate separates wire-shaped domain types from the actors that
//! operate on them.

pub mod account;
pub mod advertisement;
pub mod chat_message;
pub mod event;
pub mod ids;
pub mod money;
pub mod payout;
pub mod receipt;
pub mod transaction;

pub use account::{Account, AccountStatus, Credentials, PlatformTag};
pub use advertisement::{Advertisement, AdvertisementStatus, Side};
pub use chat_message::{ChatContentType, ChatMessage, Sender};
pub use event::{Event, EventKind};
pub use ids::{AccountId, AdvertisementId, ChatMessageId, PayoutId, ReceiptId, TransactionId};
pub use money::Money;
pub use payout::{AcceptanceDecision, Payout};
pub use receipt::{Receipt, ReceiptFields};
pub use transaction::{FailureReason, Transaction, TransactionStatus};
