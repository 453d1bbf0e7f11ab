use thiserror::Error;

use crate::item::ItemKind;

/// Why a purchase attempt did not produce an entitlement.
///
/// All variants surface through the same completion channel
/// (`StoreError::Purchase`); callers that care which one occurred match on
/// the inner value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PurchaseFailure {
    #[error("cancelled by user")]
    Cancelled,

    #[error("billing unavailable")]
    BillingUnavailable,

    #[error("product not eligible: {0}")]
    Ineligible(String),

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("setup failed: {0}")]
    Setup(String),

    /// The reconciler has not completed an initial pass yet.
    #[error("store is not ready")]
    NotReady,

    #[error("purchase failed: {0}")]
    Purchase(#[from] PurchaseFailure),

    #[error("reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("wrong item type: expected {expected}, got {actual}")]
    WrongItemType { expected: ItemKind, actual: ItemKind },

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("no lock rule registered for index {0}")]
    RuleNotRegistered(u32),

    #[error("lock rule evaluation failed: {0}")]
    RuleEvaluationFailed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
