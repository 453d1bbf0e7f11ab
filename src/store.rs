//! The store facade: composition root owning the registry, the
//! reconciliation lifecycle, lock rules, and persistence.
//!
//! `Store` is an explicit context object, not a global; it clones cheaply
//! and every clone shares the same state, so independent instances (tests,
//! multiple accounts) never interfere.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ItemConfig, StoreConfig};
use crate::error::{PurchaseFailure, Result, StoreError};
use crate::item::{
    InstallInfo, ItemKind, ItemSnapshot, StoreItem, TransactionState,
};
use crate::ranges::parse_version;
use crate::receipt::{parse_local_receipt, parse_receipt_json, ParsedReceipt, SetupPhase};
use crate::registry::Registry;
use crate::rules::{LockContext, LockRule, RuleSet, DEFAULT_RULE};
use crate::storage::{keys, MemoryStorage, StorageAdapter};
use crate::transport::{PurchaseTransport, RawReceiptHandler, ReceiptValidator};

/// Construction options for a [`Store`].
pub struct StoreOptions {
    /// The platform purchase transport (required).
    pub transport: Arc<dyn PurchaseTransport>,
    /// Remote receipt validation service, if any.
    pub validator: Option<Arc<dyn ReceiptValidator>>,
    /// Persistence for derived purchase state (default: in-memory).
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Units granted per completed consumable purchase unless an item
    /// configures its own count (default: 1).
    pub default_consumable_count: i64,
}

impl StoreOptions {
    pub fn new(transport: Arc<dyn PurchaseTransport>) -> Self {
        Self {
            transport,
            validator: None,
            storage: None,
            default_consumable_count: 1,
        }
    }
}

struct Lifecycle {
    phase: SetupPhase,
    is_sandbox: bool,
    raw_receipt: Option<Vec<u8>>,
    receipt_json: Option<Value>,
}

struct StoreInner {
    transport: Arc<dyn PurchaseTransport>,
    validator: Option<Arc<dyn ReceiptValidator>>,
    storage: Arc<dyn StorageAdapter>,
    install: Arc<RwLock<InstallInfo>>,
    registry: Registry,
    rules: RuleSet,
    raw_handler: Mutex<Option<Arc<RawReceiptHandler>>>,
    lifecycle: Mutex<Lifecycle>,
    // Serializes setup/restore passes: a restore arriving while a pass is
    // in flight waits for it instead of running in parallel.
    reconcile_gate: tokio::sync::Mutex<()>,
}

/// Client-side in-app-purchase manager.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn new(options: StoreOptions) -> Self {
        let install = Arc::new(RwLock::new(InstallInfo::default()));
        Self {
            inner: Arc::new(StoreInner {
                transport: options.transport,
                validator: options.validator,
                storage: options
                    .storage
                    .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
                install: Arc::clone(&install),
                registry: Registry::new(install, options.default_consumable_count.max(0)),
                rules: RuleSet::new(),
                raw_handler: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle {
                    phase: SetupPhase::Uninitialized,
                    is_sandbox: false,
                    raw_receipt: None,
                    receipt_json: None,
                }),
                reconcile_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ==================== Lifecycle ====================

    /// Run the full setup pipeline: load persisted state, register the
    /// configured items, look up the platform catalog, fetch and reconcile
    /// the receipt. On success the store becomes ready; on failure it stays
    /// not-ready and the caller retries via `setup` or `restore`.
    pub async fn setup(&self, items: Vec<ItemConfig>) -> Result<()> {
        let _gate = self.inner.reconcile_gate.lock().await;

        tracing::info!(items = items.len(), "store setup started");
        self.set_phase(SetupPhase::CatalogLoading);

        self.load_snapshot();
        self.apply_configs(&items);

        let identifiers: Vec<String> = items.iter().map(|c| c.identifier.clone()).collect();
        if let Err(e) = self.load_catalog(&identifiers).await {
            return Err(self.fail(e));
        }

        if let Err(e) = self.reconcile().await {
            return Err(self.fail(e));
        }

        self.set_phase(SetupPhase::Ready);
        self.save();
        tracing::info!("store setup complete");
        Ok(())
    }

    /// Setup from the JSON configuration document. Entries with an unknown
    /// `type` still create their item (left invalid) without failing the
    /// rest of the load.
    pub async fn setup_with_config_json(&self, json: &str) -> Result<()> {
        let config = StoreConfig::from_json(json)?;

        let mut items = Vec::new();
        for entry in &config.identifiers {
            match entry.to_item_config() {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::warn!(
                        identifier = %entry.identifier,
                        error = %e,
                        "rejecting config entry, item stays invalid"
                    );
                    self.inner.registry.resolve(&entry.identifier);
                }
            }
        }

        self.setup(items).await
    }

    /// Re-fetch and reconcile the receipt without rebuilding the catalog,
    /// and replay completed transactions from the platform. Merging an
    /// already-known transaction is a no-op.
    pub async fn restore(&self) -> Result<()> {
        let _gate = self.inner.reconcile_gate.lock().await;

        tracing::info!("restore started");
        self.set_phase(SetupPhase::ReceiptFetching);

        let restored = match self.inner.transport.restore_purchases().await {
            Ok(records) => records,
            Err(e) => return Err(self.fail(StoreError::Reconciliation(e.to_string()))),
        };
        for rec in &restored {
            self.inner.registry.resolve(&rec.identifier).merge_transaction(rec);
        }

        if let Err(e) = self.reconcile().await {
            return Err(self.fail(e));
        }

        self.set_phase(SetupPhase::Ready);
        self.save();
        tracing::info!(restored = restored.len(), "restore complete");
        Ok(())
    }

    /// Substitute the remote validation step with a caller-supplied handler
    /// that produces the raw receipt JSON (sandbox or production). The
    /// handler may block its thread; it is run on a blocking-safe task.
    pub fn check_raw_receipt<F>(&self, handler: F)
    where
        F: Fn(bool) -> Result<Value> + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .raw_handler
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(Box::new(handler)));
    }

    /// Clear all derived state: registry, purchase windows, balances,
    /// readiness, cached receipt, persisted snapshot. Registered lock rules
    /// and collaborators are configuration, not derived state, and survive.
    pub fn reset(&self) {
        self.inner.registry.clear();
        if let Ok(mut info) = self.inner.install.write() {
            *info = InstallInfo::default();
        }
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.phase = SetupPhase::Uninitialized;
            lifecycle.is_sandbox = false;
            lifecycle.raw_receipt = None;
            lifecycle.receipt_json = None;
        }
        self.inner.storage.remove(keys::SNAPSHOT);
        tracing::info!("store reset");
    }

    // ==================== State queries ====================

    /// True once an initial reconciliation pass has completed.
    pub fn is_ready(&self) -> bool {
        self.lifecycle().phase == SetupPhase::Ready
    }

    pub fn is_sandbox(&self) -> bool {
        self.lifecycle().is_sandbox
    }

    pub fn phase(&self) -> SetupPhase {
        self.lifecycle().phase.clone()
    }

    /// The raw device receipt, as last fetched.
    pub fn receipt(&self) -> Option<Vec<u8>> {
        self.lifecycle().raw_receipt.clone()
    }

    /// The server-validated receipt JSON, when remote validation ran.
    pub fn receipt_json(&self) -> Option<Value> {
        self.lifecycle().receipt_json.clone()
    }

    pub fn first_install_date(&self) -> Option<DateTime<Utc>> {
        let ts = self.inner.install.read().ok()?.first_install_date?;
        DateTime::<Utc>::from_timestamp(ts, 0)
    }

    pub fn first_install_app_version(&self) -> Option<String> {
        self.inner
            .install
            .read()
            .ok()?
            .first_install_version_raw
            .clone()
    }

    /// Whether the first install predates the given moment. False when the
    /// install date is unknown.
    pub fn first_install_is_older_date(&self, date: DateTime<Utc>) -> bool {
        self.inner
            .install
            .read()
            .ok()
            .and_then(|info| info.first_install_date)
            .map(|ts| ts < date.timestamp())
            .unwrap_or(false)
    }

    /// Whether the first-install app version predates `version`. False when
    /// either side is unknown or unparseable.
    pub fn first_install_is_older_version(&self, version: &str) -> bool {
        let threshold = match parse_version(version) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(version, error = %e, "bad version in comparison");
                return false;
            }
        };
        self.inner
            .install
            .read()
            .ok()
            .and_then(|info| info.first_install_version.clone())
            .map(|installed| installed < threshold)
            .unwrap_or(false)
    }

    // ==================== Registry queries ====================

    /// The item for `identifier`, created unclassified on first reference.
    pub fn resolve(&self, identifier: &str) -> Arc<StoreItem> {
        self.inner.registry.resolve(identifier)
    }

    /// Every known item, including invalid ones.
    pub fn items_all(&self) -> Vec<Arc<StoreItem>> {
        self.inner.registry.all()
    }

    /// Items the platform catalog recognized.
    pub fn items(&self) -> Vec<Arc<StoreItem>> {
        self.inner.registry.valid()
    }

    pub fn items_purchased(&self) -> Vec<Arc<StoreItem>> {
        self.inner.registry.purchased()
    }

    pub fn items_with_kind(&self, kind: ItemKind) -> Vec<Arc<StoreItem>> {
        self.inner.registry.with_kind(kind)
    }

    pub fn items_purchased_with_kind(&self, kind: ItemKind) -> Vec<Arc<StoreItem>> {
        self.inner.registry.purchased_with_kind(kind)
    }

    // ==================== Purchasing ====================

    /// Submit a purchase (or platform-side restore for an already-entitled
    /// subscription) for `identifier` and merge the resulting transaction.
    ///
    /// Fails with `NotReady` before the first reconciliation completes and
    /// with `Purchase` when the transport reports a failure.
    pub async fn purchase(&self, identifier: &str) -> Result<()> {
        if !self.is_ready() {
            return Err(StoreError::NotReady);
        }

        let item = self.resolve(identifier);
        if item.is_invalid() {
            return Err(StoreError::Purchase(PurchaseFailure::Ineligible(format!(
                "catalog does not recognize {identifier:?}"
            ))));
        }

        let rec = self.inner.transport.purchase(identifier).await?;
        item.merge_transaction(&rec);
        self.save();

        match rec.state {
            TransactionState::Failed => Err(StoreError::Purchase(PurchaseFailure::Transport(
                format!("transaction {} failed", rec.transaction_id),
            ))),
            // Purchasing/Deferred record state without entitlement; the
            // caller observes the outcome through `is_purchased`.
            _ => Ok(()),
        }
    }

    /// Spend consumable units through the store so the new balance is
    /// persisted. Same clamp-to-zero policy as [`StoreItem::consume`].
    pub fn consume(&self, identifier: &str, amount: i64) -> Result<i64> {
        let consumed = self.resolve(identifier).consume(amount)?;
        self.save();
        Ok(consumed)
    }

    // ==================== Lock rules ====================

    /// Register (or replace) the predicate for a rule index.
    pub fn set_lock_rule<F>(&self, index: u32, rule: F)
    where
        F: Fn(&LockContext<'_>) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        self.inner.rules.set(index, Box::new(rule) as LockRule);
    }

    /// Register the default rule (index 0).
    pub fn set_lock_rules<F>(&self, rule: F)
    where
        F: Fn(&LockContext<'_>) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        self.set_lock_rule(DEFAULT_RULE, rule);
    }

    /// Run a rule predicate exactly once and return its decision.
    pub fn evaluate_rule(&self, screen: &str, index: u32) -> Result<bool> {
        let ctx = LockContext {
            store: self,
            screen,
        };
        let decision = self.inner.rules.evaluate(&ctx, index);
        // Predicates may spend consumable balances as a side effect.
        self.save();
        decision
    }

    /// Lock check against the default rule. No registered rule means
    /// nothing to enforce (unlocked); a failing predicate fails safe to
    /// locked.
    pub fn is_locked(&self, screen: &str) -> bool {
        self.is_locked_with_rule(screen, DEFAULT_RULE)
    }

    /// Lock check against a specific rule index.
    pub fn is_locked_with_rule(&self, screen: &str, index: u32) -> bool {
        match self.evaluate_rule(screen, index) {
            Ok(locked) => locked,
            Err(StoreError::RuleNotRegistered(_)) => false,
            Err(e) => {
                tracing::error!(screen, index, error = %e, "lock rule failed, failing safe");
                true
            }
        }
    }

    // ==================== Persistence ====================

    /// Persist the current entitlement snapshot. Called automatically after
    /// setup, restore, purchase, consume, and rule evaluation.
    pub fn save(&self) {
        let (date, version_raw) = {
            match self.inner.install.read() {
                Ok(info) => (info.first_install_date, info.first_install_version_raw.clone()),
                Err(_) => (None, None),
            }
        };
        let snapshot = Snapshot {
            first_install_date: date,
            first_install_version: version_raw,
            items: self
                .inner
                .registry
                .all()
                .iter()
                .map(|item| item.snapshot())
                .collect(),
        };
        match serde_json::to_string(&snapshot) {
            Ok(json) => self.inner.storage.set(keys::SNAPSHOT, &json),
            Err(e) => tracing::error!(error = %e, "failed to serialize snapshot"),
        }
    }

    fn load_snapshot(&self) {
        let Some(json) = self.inner.storage.get(keys::SNAPSHOT) else {
            return;
        };
        let snapshot: Snapshot = match serde_json::from_str(&json) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable snapshot");
                return;
            }
        };

        if let Ok(mut info) = self.inner.install.write() {
            info.first_install_date = snapshot.first_install_date;
            if let Some(raw) = snapshot.first_install_version.clone() {
                info.first_install_version = parse_version(&raw).ok();
                info.first_install_version_raw = Some(raw);
            }
        }
        for snap in &snapshot.items {
            self.inner.registry.resolve(&snap.identifier).restore_snapshot(snap);
        }
        tracing::info!(items = snapshot.items.len(), "loaded persisted purchase state");
    }

    // ==================== Pipeline internals ====================

    fn apply_configs(&self, items: &[ItemConfig]) {
        for config in items {
            let item = self.inner.registry.resolve(&config.identifier);
            item.classify(config.kind, config.period);
            if let Some(count) = config.default_consumable_count {
                item.set_default_consumable_count(count);
            }
            // Config-supplied ranges are tolerant per entry; the direct
            // `set_purchased_for_ranges` API stays atomic.
            for range in &config.purchased_ranges {
                if let Err(e) = item.set_purchased_for_ranges(&[range.as_str()]) {
                    tracing::warn!(
                        identifier = %config.identifier,
                        range = %range,
                        error = %e,
                        "skipping bad grandfather range"
                    );
                }
            }
        }
    }

    async fn load_catalog(&self, identifiers: &[String]) -> Result<()> {
        if identifiers.is_empty() {
            return Ok(());
        }

        let products = self
            .inner
            .transport
            .fetch_products(identifiers)
            .await
            .map_err(|e| StoreError::Setup(format!("catalog lookup failed: {e}")))?;

        for product in &products {
            self.inner.registry.resolve(&product.identifier).set_catalog_info(
                product.title.clone(),
                product.detail.clone(),
                product.price_cents,
                product.currency_code.clone(),
                product.currency_symbol.clone(),
            );
        }

        // Partial catalogs are expected: unrecognized identifiers stay
        // invalid without failing setup.
        for identifier in identifiers {
            let item = self.inner.registry.resolve(identifier);
            if !products.iter().any(|p| &p.identifier == identifier) {
                item.set_invalid(true);
                tracing::warn!(identifier = %identifier, "catalog does not recognize identifier");
            }
        }

        tracing::info!(
            requested = identifiers.len(),
            recognized = products.len(),
            "catalog loaded"
        );
        Ok(())
    }

    async fn reconcile(&self) -> Result<()> {
        self.set_phase(SetupPhase::ReceiptFetching);

        let raw = self
            .inner
            .transport
            .read_receipt()
            .await
            .map_err(|e| StoreError::Reconciliation(format!("receipt fetch failed: {e}")))?;
        {
            self.lifecycle().raw_receipt = raw.clone();
        }

        let server_json = self.fetch_server_json(raw.as_deref()).await;

        self.set_phase(SetupPhase::Reconciling);

        let parsed = match (&server_json, &raw) {
            (Some(json), local) => match parse_receipt_json(json) {
                Ok(parsed) => parsed,
                // Local receipt is kept as a fallback when the server form
                // turns out unusable.
                Err(e) => match local {
                    Some(bytes) => {
                        tracing::warn!(error = %e, "server receipt unusable, parsing local receipt");
                        parse_local_receipt(bytes)?
                    }
                    None => return Err(e),
                },
            },
            (None, Some(bytes)) => parse_local_receipt(bytes)?,
            // Fresh install: no receipt, nothing purchased.
            (None, None) => ParsedReceipt::default(),
        };

        {
            let mut lifecycle = self.lifecycle();
            lifecycle.receipt_json = server_json;
            lifecycle.is_sandbox = parsed.sandbox;
        }
        self.update_install_info(&parsed);

        for rec in &parsed.transactions {
            self.inner.registry.resolve(&rec.identifier).merge_transaction(rec);
        }

        tracing::info!(
            transactions = parsed.transactions.len(),
            sandbox = parsed.sandbox,
            "reconciliation merged receipt"
        );
        Ok(())
    }

    /// Obtain the server-validated receipt JSON, preferring the caller's
    /// raw-receipt handler over the configured validator. Failures fall
    /// back to local parsing rather than aborting.
    async fn fetch_server_json(&self, raw: Option<&[u8]>) -> Option<Value> {
        let handler = {
            let slot = self
                .inner
                .raw_handler
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            slot.clone()
        };
        // The environment of the receipt under validation, not the one from
        // the previous pass.
        let sandbox = raw
            .and_then(|bytes| parse_local_receipt(bytes).ok())
            .map(|parsed| parsed.sandbox)
            .unwrap_or(false);

        if let Some(handler) = handler {
            // The handler may block (semaphore waits on SDK callbacks), so
            // it runs off the async pipeline thread.
            let result = tokio::task::spawn_blocking(move || (*handler)(sandbox)).await;
            return match result {
                Ok(Ok(json)) => Some(json),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "raw receipt handler failed, falling back");
                    None
                }
                Err(e) => {
                    tracing::warn!(error = %e, "raw receipt handler panicked, falling back");
                    None
                }
            };
        }

        if let (Some(validator), Some(bytes)) = (self.inner.validator.as_ref(), raw) {
            return match validator.validate(bytes, sandbox).await {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!(error = %e, "remote validation failed, falling back");
                    None
                }
            };
        }

        None
    }

    fn update_install_info(&self, parsed: &ParsedReceipt) {
        let earliest_transaction = parsed.transactions.iter().map(|t| t.purchase_date).min();
        if let Ok(mut info) = self.inner.install.write() {
            if let Some(date) = parsed.first_install_date.or(earliest_transaction) {
                info.first_install_date = Some(date);
            }
            if let Some(raw) = parsed.first_install_version.clone() {
                match parse_version(&raw) {
                    Ok(version) => {
                        info.first_install_version = Some(version);
                        info.first_install_version_raw = Some(raw);
                    }
                    Err(e) => {
                        tracing::warn!(version = %raw, error = %e, "unparseable install version");
                    }
                }
            }
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: SetupPhase) {
        tracing::debug!(phase = %phase, "setup phase");
        self.lifecycle().phase = phase;
    }

    fn fail(&self, error: StoreError) -> StoreError {
        tracing::error!(error = %error, "reconciliation pipeline failed");
        self.set_phase(SetupPhase::Failed(error.to_string()));
        error
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("phase", &self.phase())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Persisted store-level state.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    first_install_date: Option<i64>,
    first_install_version: Option<String>,
    items: Vec<ItemSnapshot>,
}
