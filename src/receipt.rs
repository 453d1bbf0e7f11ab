//! Receipt parsing: turning the server-validated JSON (or a best-effort
//! local parse of the device receipt) into transaction records.
//!
//! The JSON shape follows the validation-service convention: an
//! `environment` marker, receipt metadata with the original purchase date
//! and app version, and an `in_app` array of transactions with
//! millisecond-precision date fields (string or number). Entries carrying a
//! cancellation date are revoked and produce no record — the server form is
//! preferred over local parsing precisely because it sees those.

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::item::{TransactionRecord, TransactionState};

/// Lifecycle of the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupPhase {
    Uninitialized,
    CatalogLoading,
    ReceiptFetching,
    Reconciling,
    Ready,
    Failed(String),
}

impl std::fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::CatalogLoading => write!(f, "catalog_loading"),
            Self::ReceiptFetching => write!(f, "receipt_fetching"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Ready => write!(f, "ready"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything reconciliation needs out of a receipt representation.
#[derive(Debug, Clone, Default)]
pub struct ParsedReceipt {
    pub sandbox: bool,
    /// Unix timestamp of the original app purchase/install.
    pub first_install_date: Option<i64>,
    /// App version at the original install.
    pub first_install_version: Option<String>,
    pub transactions: Vec<TransactionRecord>,
}

/// Parse server-validated receipt JSON.
///
/// Tolerant by design: a receipt without transactions is a fresh install,
/// not an error. Only a document that is not an object at all is rejected.
pub fn parse_receipt_json(value: &Value) -> Result<ParsedReceipt> {
    let root = value
        .as_object()
        .ok_or_else(|| StoreError::Reconciliation("receipt JSON is not an object".into()))?;

    let sandbox = root
        .get("environment")
        .and_then(Value::as_str)
        .map(|e| e.eq_ignore_ascii_case("sandbox"))
        .unwrap_or(false);

    // Some validators wrap the receipt body, some return it flat.
    let body = root.get("receipt").and_then(Value::as_object).unwrap_or(root);

    let first_install_date = ms_field(body, "original_purchase_date_ms");
    let first_install_version = body
        .get("original_application_version")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut transactions = Vec::new();
    if let Some(in_app) = body.get("in_app").and_then(Value::as_array) {
        for entry in in_app {
            let Some(entry) = entry.as_object() else {
                continue;
            };
            if ms_field(entry, "cancellation_date_ms").is_some() {
                let product_id = entry
                    .get("product_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("");
                tracing::info!(product_id, "skipping revoked transaction");
                continue;
            }
            let (Some(identifier), Some(transaction_id), Some(purchase_date)) = (
                entry.get("product_id").and_then(Value::as_str),
                entry.get("transaction_id").and_then(Value::as_str),
                ms_field(entry, "purchase_date_ms"),
            ) else {
                tracing::warn!("receipt transaction missing required fields, skipping");
                continue;
            };

            transactions.push(TransactionRecord {
                identifier: identifier.to_string(),
                transaction_id: transaction_id.to_string(),
                state: TransactionState::Purchased,
                purchase_date,
                expiry_date: ms_field(entry, "expires_date_ms"),
                is_trial: bool_field(entry, "is_trial_period"),
            });
        }
    }

    Ok(ParsedReceipt {
        sandbox,
        first_install_date,
        first_install_version,
        transactions,
    })
}

/// Best-effort parse of the raw device receipt.
///
/// Signature verification is out of scope here; the bytes are accepted when
/// they decode as the same JSON schema the validator returns. Anything else
/// is an opaque blob only useful for forwarding to the remote validator.
pub fn parse_local_receipt(bytes: &[u8]) -> Result<ParsedReceipt> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|_| StoreError::Reconciliation("device receipt is not locally parseable".into()))?;
    parse_receipt_json(&value)
}

// Boolean receipt fields arrive as strings ("true") or JSON booleans.
fn bool_field(obj: &serde_json::Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn ms_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    let value = obj.get(key)?;
    let ms = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(ms / 1000)
}
