//! Test utilities and fixtures for storefront integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

pub use storefront::{
    ItemConfig, ItemKind, Period, ProductInfo, PurchaseFailure, PurchaseTransport,
    ReceiptValidator, Result, SetupPhase, Store, StoreError, StoreOptions, TransactionRecord,
    TransactionState,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-memory platform transport with programmable catalog, receipt, and
/// transaction responses.
#[derive(Default)]
pub struct FakeTransport {
    products: Mutex<Vec<ProductInfo>>,
    receipt: Mutex<Option<Vec<u8>>>,
    restored: Mutex<Vec<TransactionRecord>>,
    staged_purchases: Mutex<HashMap<String, TransactionRecord>>,
    purchase_failure: Mutex<Option<PurchaseFailure>>,
    fail_catalog: AtomicBool,
    pub purchase_calls: AtomicUsize,
    txn_counter: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_product(&self, identifier: &str, price_cents: i64) {
        self.products.lock().unwrap().push(product(identifier, price_cents));
    }

    /// Install a JSON-encoded device receipt (the best-effort local form).
    pub fn set_receipt_json(&self, receipt: &Value) {
        *self.receipt.lock().unwrap() = Some(serde_json::to_vec(receipt).unwrap());
    }

    pub fn set_receipt_bytes(&self, bytes: Vec<u8>) {
        *self.receipt.lock().unwrap() = Some(bytes);
    }

    pub fn add_restored(&self, record: TransactionRecord) {
        self.restored.lock().unwrap().push(record);
    }

    /// Fix the transaction the next purchase of `identifier` resolves to.
    pub fn stage_purchase(&self, record: TransactionRecord) {
        self.staged_purchases
            .lock()
            .unwrap()
            .insert(record.identifier.clone(), record);
    }

    pub fn fail_next_purchase(&self, failure: PurchaseFailure) {
        *self.purchase_failure.lock().unwrap() = Some(failure);
    }

    pub fn fail_catalog(&self) {
        self.fail_catalog.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PurchaseTransport for FakeTransport {
    async fn fetch_products(&self, identifiers: &[String]) -> Result<Vec<ProductInfo>> {
        if self.fail_catalog.load(Ordering::SeqCst) {
            return Err(StoreError::Setup("network unavailable".into()));
        }
        Ok(self
            .products
            .lock()
            .unwrap()
            .iter()
            .filter(|p| identifiers.contains(&p.identifier))
            .cloned()
            .collect())
    }

    async fn purchase(&self, identifier: &str) -> Result<TransactionRecord> {
        self.purchase_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(failure) = self.purchase_failure.lock().unwrap().take() {
            return Err(StoreError::Purchase(failure));
        }
        if let Some(staged) = self.staged_purchases.lock().unwrap().get(identifier) {
            return Ok(staged.clone());
        }

        let n = self.txn_counter.fetch_add(1, Ordering::SeqCst);
        Ok(TransactionRecord {
            identifier: identifier.to_string(),
            transaction_id: format!("fake-txn-{n}"),
            state: TransactionState::Purchased,
            purchase_date: now(),
            expiry_date: None,
            is_trial: false,
        })
    }

    async fn restore_purchases(&self) -> Result<Vec<TransactionRecord>> {
        Ok(self.restored.lock().unwrap().clone())
    }

    async fn read_receipt(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.receipt.lock().unwrap().clone())
    }
}

/// Remote validation fake: returns a fixed JSON document, counting calls.
#[derive(Default)]
pub struct FakeValidator {
    response: Mutex<Option<Value>>,
    pub calls: AtomicUsize,
    pub last_sandbox: Mutex<Option<bool>>,
}

impl FakeValidator {
    pub fn new(response: Value) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Some(response)),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ReceiptValidator for FakeValidator {
    async fn validate(&self, _raw_receipt: &[u8], sandbox: bool) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sandbox.lock().unwrap() = Some(sandbox);
        self.response
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StoreError::Reconciliation("validator unavailable".into()))
    }
}

pub fn product(identifier: &str, price_cents: i64) -> ProductInfo {
    ProductInfo {
        identifier: identifier.to_string(),
        title: format!("Title for {identifier}"),
        detail: format!("Detail for {identifier}"),
        price_cents,
        currency_code: "USD".to_string(),
        currency_symbol: "$".to_string(),
    }
}

pub fn txn(
    identifier: &str,
    transaction_id: &str,
    purchase_date: i64,
    expiry_date: Option<i64>,
) -> TransactionRecord {
    TransactionRecord {
        identifier: identifier.to_string(),
        transaction_id: transaction_id.to_string(),
        state: TransactionState::Purchased,
        purchase_date,
        expiry_date,
        is_trial: false,
    }
}

/// A validator-style receipt document wrapping the given `in_app` entries.
/// First install: 2020-01-01, app version 2.0.
pub fn receipt_with(in_app: Vec<Value>) -> Value {
    json!({
        "environment": "Production",
        "receipt": {
            "original_purchase_date_ms": "1577836800000",
            "original_application_version": "2.0",
            "in_app": in_app,
        }
    })
}

pub fn in_app(product_id: &str, transaction_id: &str, purchase: i64, expires: Option<i64>) -> Value {
    let mut entry = json!({
        "product_id": product_id,
        "transaction_id": transaction_id,
        "purchase_date_ms": purchase * 1000,
    });
    if let Some(expires) = expires {
        entry["expires_date_ms"] = json!(expires * 1000);
    }
    entry
}

pub fn trial_in_app(
    product_id: &str,
    transaction_id: &str,
    purchase: i64,
    expires: i64,
) -> Value {
    let mut entry = in_app(product_id, transaction_id, purchase, Some(expires));
    entry["is_trial_period"] = json!("true");
    entry
}

/// Build a store over the fake transport and run setup to readiness.
pub async fn ready_store(transport: Arc<FakeTransport>, items: Vec<ItemConfig>) -> Store {
    init_tracing();
    let store = Store::new(StoreOptions::new(transport));
    store.setup(items).await.expect("setup should succeed");
    assert!(store.is_ready());
    store
}
