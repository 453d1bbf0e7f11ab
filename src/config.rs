//! Catalog configuration: the typed in-code form (`ItemConfig`) and the JSON
//! form fetched from a caller's server.
//!
//! JSON layout:
//!
//! ```json
//! {
//!   "identifiers": [
//!     { "identifier": "com.purchase.money", "type": "consumable" },
//!     { "identifier": "com.purchase.month", "type": "autoRenewableSubscription" },
//!     { "identifier": "com.purchase.week",  "type": "nonRenewingSubscriptionWeek" },
//!     {
//!       "identifier": "com.purchase.unlimited",
//!       "type": "nonConsumable",
//!       "asPurchasedForRanges": ["1.0", "2.0-2.9", "1/1/2020-12/31/2020"]
//!     }
//!   ]
//! }
//! ```
//!
//! A malformed or unknown `type` is a per-entry failure: the item is still
//! created but stays invalid; the rest of the load proceeds.

use serde::Deserialize;

use crate::error::{Result, StoreError};
use crate::item::{ItemKind, Period};

/// Fully-specified configuration for one catalog item, resolved before
/// insertion into the registry.
#[derive(Debug, Clone)]
pub struct ItemConfig {
    pub identifier: String,
    pub kind: ItemKind,
    pub period: Period,
    /// Units granted per completed consumable purchase; `None` keeps the
    /// store-wide default.
    pub default_consumable_count: Option<i64>,
    /// Grandfather range strings, applied during setup.
    pub purchased_ranges: Vec<String>,
}

impl ItemConfig {
    pub fn new(identifier: impl Into<String>, kind: ItemKind, period: Period) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            period,
            default_consumable_count: None,
            purchased_ranges: Vec::new(),
        }
    }

    pub fn consumable(identifier: impl Into<String>) -> Self {
        Self::new(identifier, ItemKind::Consumable, Period::None)
    }

    pub fn non_consumable(identifier: impl Into<String>) -> Self {
        Self::new(identifier, ItemKind::NonConsumable, Period::None)
    }

    pub fn auto_renewable_subscription(identifier: impl Into<String>) -> Self {
        Self::new(identifier, ItemKind::AutoRenewableSubscription, Period::None)
    }

    pub fn non_renewing_subscription(identifier: impl Into<String>, period: Period) -> Self {
        Self::new(identifier, ItemKind::NonRenewingSubscription, period)
    }

    pub fn with_purchased_ranges<S: Into<String>>(
        mut self,
        ranges: impl IntoIterator<Item = S>,
    ) -> Self {
        self.purchased_ranges = ranges.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_consumable_count(mut self, count: i64) -> Self {
        self.default_consumable_count = Some(count);
        self
    }
}

/// Root of the JSON configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub identifiers: Vec<ConfigEntry>,
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))
    }
}

/// One entry of the JSON configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEntry {
    pub identifier: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(rename = "asPurchasedForRanges", default)]
    pub as_purchased_for_ranges: Vec<String>,
    #[serde(rename = "defaultConsumableCount", default)]
    pub default_consumable_count: Option<i64>,
}

impl ConfigEntry {
    /// Resolve the stringly-typed entry into an `ItemConfig`.
    ///
    /// Fails with `Config` on an unknown `type`; the caller decides whether
    /// that is fatal (the store's loader keeps the item and marks it
    /// invalid).
    pub fn to_item_config(&self) -> Result<ItemConfig> {
        if self.identifier.trim().is_empty() {
            return Err(StoreError::Config("empty identifier".into()));
        }

        let (kind, mut period) = parse_kind(&self.kind)
            .ok_or_else(|| StoreError::Config(format!("unknown item type {:?}", self.kind)))?;

        if let Some(p) = self.period.as_deref() {
            period = parse_period(p)
                .ok_or_else(|| StoreError::Config(format!("unknown period {:?}", p)))?;
        }

        let mut config = ItemConfig::new(self.identifier.clone(), kind, period)
            .with_purchased_ranges(self.as_purchased_for_ranges.clone());
        config.default_consumable_count = self.default_consumable_count;
        Ok(config)
    }
}

fn parse_kind(s: &str) -> Option<(ItemKind, Period)> {
    match s {
        "consumable" => Some((ItemKind::Consumable, Period::None)),
        "nonConsumable" | "non_consumable" => Some((ItemKind::NonConsumable, Period::None)),
        "autoRenewableSubscription" | "auto_renewable_subscription" => {
            Some((ItemKind::AutoRenewableSubscription, Period::None))
        }
        "nonRenewingSubscription" | "non_renewing_subscription" => {
            Some((ItemKind::NonRenewingSubscription, Period::None))
        }
        "nonRenewingSubscriptionWeek" => Some((ItemKind::NonRenewingSubscription, Period::Week)),
        "nonRenewingSubscriptionMonth" => Some((ItemKind::NonRenewingSubscription, Period::Month)),
        "nonRenewingSubscriptionYear" => Some((ItemKind::NonRenewingSubscription, Period::Year)),
        _ => None,
    }
}

fn parse_period(s: &str) -> Option<Period> {
    match s {
        "none" => Some(Period::None),
        "week" => Some(Period::Week),
        "month" => Some(Period::Month),
        "year" => Some(Period::Year),
        _ => None,
    }
}
