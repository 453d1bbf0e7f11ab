//! Catalog items: a purchasable identifier plus its entitlement state.
//!
//! `StoreItem` instances are created by the registry and shared as
//! `Arc<StoreItem>`; all mutable state sits behind an internal mutex so the
//! same instance can be handed to UI code and the reconciler concurrently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::ranges::GrandfatherRange;

/// What kind of product an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Not classified yet (lazily created, awaiting configuration).
    Unknown,
    Consumable,
    NonConsumable,
    AutoRenewableSubscription,
    NonRenewingSubscription,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Consumable => "consumable",
            Self::NonConsumable => "non_consumable",
            Self::AutoRenewableSubscription => "auto_renewable_subscription",
            Self::NonRenewingSubscription => "non_renewing_subscription",
        }
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Renewal length for non-renewing subscriptions (used to compute a
/// synthetic expiry) and for per-week/month price math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    None,
    Week,
    Month,
    Year,
}

impl Period {
    /// Subscription length in seconds, or `None` for `Period::None`.
    pub fn seconds(&self) -> Option<i64> {
        match self {
            Self::None => None,
            Self::Week => Some(7 * 86_400),
            Self::Month => Some(30 * 86_400),
            Self::Year => Some(365 * 86_400),
        }
    }

    /// Approximate length in weeks, for price breakdowns.
    fn weeks(&self) -> Option<f64> {
        match self {
            Self::None => None,
            Self::Week => Some(1.0),
            Self::Month => Some(4.345),
            Self::Year => Some(52.143),
        }
    }

    /// Approximate length in months, for price breakdowns.
    fn months(&self) -> Option<f64> {
        match self {
            Self::None => None,
            Self::Week => Some(0.23),
            Self::Month => Some(1.0),
            Self::Year => Some(12.0),
        }
    }
}

/// State of the most recent transaction observed for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Purchasing,
    Purchased,
    Failed,
    Restored,
    Deferred,
}

/// A single transaction derived from the receipt, the transport, or the
/// remote validator. Dates are unix timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub identifier: String,
    pub transaction_id: String,
    pub state: TransactionState,
    pub purchase_date: i64,
    pub expiry_date: Option<i64>,
    /// The receipt marks introductory trial transactions per entry.
    pub is_trial: bool,
}

/// A closed date interval during which the item counts as purchased.
/// `end == None` means purchased forever (non-consumable / lifetime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseWindow {
    pub start: i64,
    pub end: Option<i64>,
    /// Whether the transaction this window came from was a trial period.
    #[serde(default)]
    pub is_trial: bool,
}

impl PurchaseWindow {
    pub fn contains(&self, now: i64) -> bool {
        self.start <= now && self.end.map_or(true, |end| now <= end)
    }
}

/// Receipt-level install metadata, shared between the store and every item
/// so version-based grandfathering can be evaluated per item.
#[derive(Debug, Default, Clone)]
pub struct InstallInfo {
    /// Unix timestamp of the first install (earliest receipt evidence).
    pub first_install_date: Option<i64>,
    /// App version at first install, from the receipt.
    pub first_install_version: Option<Version>,
    /// The version string exactly as the receipt carried it.
    pub first_install_version_raw: Option<String>,
}

#[derive(Debug, Default)]
struct ItemState {
    kind: ItemKind,
    period: Period,
    title: Option<String>,
    detail: Option<String>,
    price_cents: Option<i64>,
    currency_code: Option<String>,
    currency_symbol: Option<String>,
    is_invalid: bool,
    transaction_id: Option<String>,
    transaction_state: Option<TransactionState>,
    default_consumable_count: i64,
    consumable_balance: i64,
    windows: Vec<PurchaseWindow>,
    version_windows: Vec<(Version, Version)>,
    seen_transactions: HashSet<String>,
}

impl Default for ItemKind {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Default for Period {
    fn default() -> Self {
        Self::None
    }
}

/// A purchasable catalog entity.
///
/// `is_purchased` is always computed, never stored: an item is purchased iff
/// "now" falls inside at least one purchase window, the first-install app
/// version falls inside a version grandfather range, or the item is a
/// consumable with a positive balance.
pub struct StoreItem {
    identifier: String,
    install: Arc<RwLock<InstallInfo>>,
    state: Mutex<ItemState>,
}

impl StoreItem {
    pub(crate) fn new(
        identifier: impl Into<String>,
        install: Arc<RwLock<InstallInfo>>,
        default_consumable_count: i64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            install,
            state: Mutex::new(ItemState {
                // Lazily created items are invalid until a catalog lookup
                // recognizes the identifier.
                is_invalid: true,
                default_consumable_count,
                ..ItemState::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ItemState> {
        // A poisoned item mutex only ever means a panic mid-update in this
        // crate's own short critical sections; the state itself stays usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn install_version(&self) -> Option<Version> {
        self.install
            .read()
            .ok()
            .and_then(|info| info.first_install_version.clone())
    }

    // ==================== Identity & classification ====================

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn kind(&self) -> ItemKind {
        self.lock().kind
    }

    pub fn period(&self) -> Period {
        self.lock().period
    }

    pub(crate) fn classify(&self, kind: ItemKind, period: Period) {
        let mut st = self.lock();
        st.kind = kind;
        st.period = period;
    }

    /// True when the platform catalog lookup did not recognize this
    /// identifier (or has not run yet).
    pub fn is_invalid(&self) -> bool {
        self.lock().is_invalid
    }

    pub(crate) fn set_invalid(&self, invalid: bool) {
        self.lock().is_invalid = invalid;
    }

    pub(crate) fn set_catalog_info(
        &self,
        title: String,
        detail: String,
        price_cents: i64,
        currency_code: String,
        currency_symbol: String,
    ) {
        let mut st = self.lock();
        st.title = Some(title);
        st.detail = Some(detail);
        st.price_cents = Some(price_cents);
        st.currency_code = Some(currency_code);
        st.currency_symbol = Some(currency_symbol);
        st.is_invalid = false;
    }

    // ==================== Pricing ====================

    pub fn title(&self) -> Option<String> {
        self.lock().title.clone()
    }

    pub fn detail(&self) -> Option<String> {
        self.lock().detail.clone()
    }

    pub fn price_cents(&self) -> Option<i64> {
        self.lock().price_cents
    }

    pub fn currency_code(&self) -> Option<String> {
        self.lock().currency_code.clone()
    }

    pub fn currency_symbol(&self) -> Option<String> {
        self.lock().currency_symbol.clone()
    }

    /// Localized price like `$4.99`, once the catalog lookup completed.
    pub fn price_string(&self) -> Option<String> {
        let st = self.lock();
        let cents = st.price_cents?;
        let symbol = st.currency_symbol.clone()?;
        Some(format_price(cents, &symbol))
    }

    /// Title and price together, e.g. `Pro Monthly ($4.99)`.
    pub fn title_with_price(&self) -> Option<String> {
        let title = self.title()?;
        let price = self.price_string()?;
        Some(format!("{} ({})", title, price))
    }

    /// Approximate cost per week, for subscriptions with a known period.
    /// Returns `None` rather than guessing when price or period is unknown.
    pub fn price_per_week(&self) -> Option<String> {
        let st = self.lock();
        let cents = st.price_cents? as f64;
        let weeks = st.period.weeks()?;
        let symbol = st.currency_symbol.clone()?;
        Some(format_price((cents / weeks).round() as i64, &symbol))
    }

    /// Approximate cost per month, for subscriptions with a known period.
    pub fn price_per_month(&self) -> Option<String> {
        let st = self.lock();
        let cents = st.price_cents? as f64;
        let months = st.period.months()?;
        let symbol = st.currency_symbol.clone()?;
        Some(format_price((cents / months).round() as i64, &symbol))
    }

    // ==================== Entitlement ====================

    /// Whether the item counts as purchased right now.
    pub fn is_purchased(&self) -> bool {
        self.is_purchased_at(Utc::now().timestamp())
    }

    /// Entitlement check against an explicit moment (unix timestamp).
    /// Version grandfather ranges are evaluated against the first-install
    /// app version regardless of `now`.
    pub fn is_purchased_at(&self, now: i64) -> bool {
        let version = self.install_version();
        let st = self.lock();

        if st.kind == ItemKind::Consumable && st.consumable_balance > 0 {
            return true;
        }
        if st.windows.iter().any(|w| w.contains(now)) {
            return true;
        }
        if let Some(v) = version.as_ref() {
            if st
                .version_windows
                .iter()
                .any(|(min, max)| min <= v && v <= max)
            {
                return true;
            }
        }
        false
    }

    /// Start of the purchase window covering "now", if any.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.active_window().map(|w| timestamp_to_datetime(w.start))
    }

    /// End of the purchase window covering "now"; `None` for lifetime
    /// entitlements or when nothing covers "now".
    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.active_window()
            .and_then(|w| w.end)
            .map(timestamp_to_datetime)
    }

    /// Whether the entitlement covering "now" came from an introductory
    /// trial transaction. False when nothing covers "now" (consumable
    /// balances included; trials only exist for windowed purchases).
    pub fn is_trial(&self) -> bool {
        self.active_window().map(|w| w.is_trial).unwrap_or(false)
    }

    fn active_window(&self) -> Option<PurchaseWindow> {
        let now = Utc::now().timestamp();
        self.lock().windows.iter().copied().find(|w| w.contains(now))
    }

    pub fn purchase_windows(&self) -> Vec<PurchaseWindow> {
        self.lock().windows.clone()
    }

    // ==================== Transactions ====================

    pub fn transaction_id(&self) -> Option<String> {
        self.lock().transaction_id.clone()
    }

    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.lock().transaction_state
    }

    /// Merge one transaction into this item's entitlement state.
    ///
    /// Idempotent: a transaction id that was already merged is a no-op.
    /// Returns true when the record changed entitlement state.
    pub(crate) fn merge_transaction(&self, rec: &TransactionRecord) -> bool {
        let mut st = self.lock();

        st.transaction_id = Some(rec.transaction_id.clone());
        st.transaction_state = Some(rec.state);

        if !matches!(
            rec.state,
            TransactionState::Purchased | TransactionState::Restored
        ) {
            return false;
        }
        if st.seen_transactions.contains(&rec.transaction_id) {
            return false;
        }

        match st.kind {
            ItemKind::Consumable => {
                // Consumable entitlement lives in the balance, not windows.
                // Restores never re-grant units.
                if rec.state == TransactionState::Purchased {
                    st.consumable_balance += st.default_consumable_count;
                }
            }
            ItemKind::NonConsumable => {
                push_window(
                    &mut st.windows,
                    PurchaseWindow {
                        start: rec.purchase_date,
                        end: None,
                        is_trial: rec.is_trial,
                    },
                );
            }
            ItemKind::AutoRenewableSubscription | ItemKind::NonRenewingSubscription => {
                let end = rec
                    .expiry_date
                    .or_else(|| st.period.seconds().map(|s| rec.purchase_date + s));
                let Some(end) = end else {
                    // Not marked seen: a replay after the period is known
                    // can still derive the window.
                    tracing::warn!(
                        identifier = %self.identifier,
                        transaction_id = %rec.transaction_id,
                        "subscription transaction without expiry or period, skipping window"
                    );
                    return false;
                };
                push_window(
                    &mut st.windows,
                    PurchaseWindow {
                        start: rec.purchase_date,
                        end: Some(end),
                        is_trial: rec.is_trial,
                    },
                );
            }
            ItemKind::Unknown => {
                // Not marked seen: once the item is classified, replaying
                // the same record must grant the entitlement it carries.
                tracing::warn!(
                    identifier = %self.identifier,
                    "transaction for unclassified item, no entitlement derived"
                );
                return false;
            }
        }

        // Only transactions that actually derived state count as seen;
        // the bail-out paths above stay replayable.
        st.seen_transactions.insert(rec.transaction_id.clone());
        tracing::info!(
            identifier = %self.identifier,
            transaction_id = %rec.transaction_id,
            state = ?rec.state,
            "merged transaction"
        );
        true
    }

    // ==================== Consumables ====================

    /// Units granted each time a consumable purchase completes.
    pub fn default_consumable_count(&self) -> i64 {
        self.lock().default_consumable_count
    }

    pub fn set_default_consumable_count(&self, count: i64) {
        self.lock().default_consumable_count = count.max(0);
    }

    /// Remaining units of a consumable purchase.
    pub fn consumable_balance(&self) -> i64 {
        self.lock().consumable_balance
    }

    /// Spend `amount` units, clamped at zero: consuming 5 from a balance of
    /// 3 leaves 0 and reports 3 consumed. Over-consumption is not an error.
    ///
    /// Fails with `WrongItemType` on anything that is not a consumable.
    pub fn consume(&self, amount: i64) -> Result<i64> {
        let mut st = self.lock();
        if st.kind != ItemKind::Consumable {
            return Err(StoreError::WrongItemType {
                expected: ItemKind::Consumable,
                actual: st.kind,
            });
        }
        let consumed = amount.max(0).min(st.consumable_balance);
        st.consumable_balance -= consumed;
        Ok(consumed)
    }

    /// Spend a single unit.
    pub fn consume_one(&self) -> Result<i64> {
        self.consume(1)
    }

    // ==================== Grandfathering ====================

    /// Mark this item purchased for the given date/version ranges.
    ///
    /// Every string must parse; on any parse failure the whole call is
    /// rejected with `InvalidRange` and nothing is appended.
    pub fn set_purchased_for_ranges<S: AsRef<str>>(&self, ranges: &[S]) -> Result<()> {
        let parsed = ranges
            .iter()
            .map(|s| GrandfatherRange::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let mut st = self.lock();
        for range in parsed {
            match range {
                GrandfatherRange::Dates { start, end } => push_window(
                    &mut st.windows,
                    PurchaseWindow {
                        start,
                        end: Some(end),
                        is_trial: false,
                    },
                ),
                GrandfatherRange::Versions { min, max } => {
                    let pair = (min, max);
                    if !st.version_windows.contains(&pair) {
                        st.version_windows.push(pair);
                    }
                }
            }
        }
        Ok(())
    }

    // ==================== Persistence ====================

    pub(crate) fn snapshot(&self) -> ItemSnapshot {
        let st = self.lock();
        ItemSnapshot {
            identifier: self.identifier.clone(),
            kind: st.kind,
            period: st.period,
            windows: st.windows.clone(),
            version_windows: st
                .version_windows
                .iter()
                .map(|(min, max)| (min.to_string(), max.to_string()))
                .collect(),
            consumable_balance: st.consumable_balance,
            seen_transactions: st.seen_transactions.iter().cloned().collect(),
            transaction_id: st.transaction_id.clone(),
            transaction_state: st.transaction_state,
        }
    }

    pub(crate) fn restore_snapshot(&self, snap: &ItemSnapshot) {
        let mut st = self.lock();
        if st.kind == ItemKind::Unknown {
            st.kind = snap.kind;
            st.period = snap.period;
        }
        st.windows = snap.windows.clone();
        st.version_windows = snap
            .version_windows
            .iter()
            .filter_map(|(min, max)| {
                let min = Version::parse(min).ok()?;
                let max = Version::parse(max).ok()?;
                Some((min, max))
            })
            .collect();
        st.consumable_balance = snap.consumable_balance;
        st.seen_transactions = snap.seen_transactions.iter().cloned().collect();
        st.transaction_id = snap.transaction_id.clone();
        st.transaction_state = snap.transaction_state;
    }
}

impl std::fmt::Debug for StoreItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("StoreItem")
            .field("identifier", &self.identifier)
            .field("kind", &st.kind)
            .field("is_invalid", &st.is_invalid)
            .field("consumable_balance", &st.consumable_balance)
            .field("windows", &st.windows.len())
            .finish()
    }
}

/// Persisted per-item entitlement state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ItemSnapshot {
    pub identifier: String,
    pub kind: ItemKind,
    pub period: Period,
    pub windows: Vec<PurchaseWindow>,
    pub version_windows: Vec<(String, String)>,
    pub consumable_balance: i64,
    pub seen_transactions: Vec<String>,
    pub transaction_id: Option<String>,
    pub transaction_state: Option<TransactionState>,
}

/// Windows behave as a set: re-deriving one that already exists (repeated
/// setup, re-applied config ranges) is a no-op.
fn push_window(windows: &mut Vec<PurchaseWindow>, window: PurchaseWindow) {
    if !windows.contains(&window) {
        windows.push(window);
    }
}

fn format_price(cents: i64, symbol: &str) -> String {
    format!("{}{}.{:02}", symbol, cents / 100, (cents % 100).abs())
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
