//! Collaborator seams: the platform purchase transport and the remote
//! receipt validation service.
//!
//! The engine never talks to a network or a store frontend itself; callers
//! supply implementations of these traits (tests supply fakes).

use async_trait::async_trait;

use crate::error::Result;
use crate::item::TransactionRecord;

/// Product metadata returned by the platform catalog lookup.
#[derive(Debug, Clone)]
pub struct ProductInfo {
    pub identifier: String,
    pub title: String,
    pub detail: String,
    /// Canonical price in cents.
    pub price_cents: i64,
    /// ISO 4217 code, e.g. "USD".
    pub currency_code: String,
    /// Display symbol, e.g. "$".
    pub currency_symbol: String,
}

/// The platform purchase transport: catalog lookup, payment submission,
/// restore, and access to the locally stored receipt.
///
/// Submitting a purchase cannot be cancelled from this layer; timeouts are
/// the transport's responsibility. "No response" must eventually surface as
/// an `Err`, never a hang.
#[async_trait]
pub trait PurchaseTransport: Send + Sync {
    /// Look up product metadata for a set of identifiers. Identifiers the
    /// platform does not recognize are simply absent from the result; that
    /// is not an error.
    async fn fetch_products(&self, identifiers: &[String]) -> Result<Vec<ProductInfo>>;

    /// Submit a payment (or platform-side restore for an already-entitled
    /// subscription) and wait for the terminal transaction event.
    async fn purchase(&self, identifier: &str) -> Result<TransactionRecord>;

    /// Ask the platform to replay completed transactions.
    async fn restore_purchases(&self) -> Result<Vec<TransactionRecord>>;

    /// Read the signed receipt stored on the device. `None` when the device
    /// has no receipt yet (fresh install, nothing purchased).
    async fn read_receipt(&self) -> Result<Option<Vec<u8>>>;
}

/// Remote receipt validation: accepts the raw receipt and returns the
/// server-parsed transaction JSON. The server result is authoritative over
/// local parsing because it reflects refunds and revocations.
#[async_trait]
pub trait ReceiptValidator: Send + Sync {
    async fn validate(&self, raw_receipt: &[u8], sandbox: bool) -> Result<serde_json::Value>;
}

/// Caller-supplied substitute for the remote validation step.
///
/// Receives the sandbox flag and returns the raw receipt JSON. The handler
/// may block its thread (e.g. wait on a semaphore for an SDK callback); the
/// reconciler runs it on a blocking-safe task, never on the async pipeline
/// thread.
pub type RawReceiptHandler =
    Box<dyn Fn(bool) -> Result<serde_json::Value> + Send + Sync + 'static>;
