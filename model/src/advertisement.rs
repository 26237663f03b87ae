use crate::ids::{AccountId, AdvertisementId};
use crate::money::Money;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvertisementStatus {
    Online,
    Offline,
    Deleted,
}

/// A sell advertisement on Platform-X.
///
/// `platform_ad_id` carries the real ad id once Platform-X has accepted the
/// create call, or the `"temp_<orderId>"` sentinel when the ad record is
/// reconstructed around an orphan order (spec.md §4.6 step 4) -- see
/// [`Advertisement::placeholder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: AdvertisementId,
    pub platform_ad_id: String,
    pub account_id: AccountId,
    pub side: Side,
    pub asset: String,
    pub fiat: String,
    pub unit_price: Money,
    pub quantity: Money,
    pub min_amount: Money,
    pub max_amount: Money,
    pub payment_methods: BTreeSet<String>,
    pub status: AdvertisementStatus,
}

impl Advertisement {
    pub fn is_placeholder(&self) -> bool {
        self.platform_ad_id.starts_with("temp_")
    }

    pub fn placeholder_id(order_id: &str) -> String {
        format!("temp_{order_id}")
    }
}
