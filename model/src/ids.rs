//! Opaque identifiers.
//!
//! Internal entities (Transaction, Advertisement's internal id, ChatMessage,
//! Receipt, Account) get a `Uuid`-backed newtype. Ids assigned by the
//! external platforms (payout id, ad id, order id) are plain `String`s
//! wrapped the same way, so call sites never mix them up by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(TransactionId);
uuid_id!(ChatMessageId);
uuid_id!(ReceiptId);
uuid_id!(AccountId);

/// Platform-D's payout id. External, opaque, never generated by us.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayoutId(String);

impl PayoutId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Our internal `Advertisement.id`. Separate from the platform-X ad id,
/// which `Advertisement::platform_ad_id` carries (and which may be the
/// `"temp_<orderId>"` sentinel described in spec.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdvertisementId(Uuid);

impl AdvertisementId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AdvertisementId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AdvertisementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for AdvertisementId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}
