//! # Storefront
//!
//! Client-side in-app-purchase management: catalog items, receipt
//! reconciliation, entitlements, consumable balances, and rule-based access
//! locks — without duplicating purchase checks across screens.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use storefront::{ItemConfig, ItemKind, Store, StoreOptions};
//! # use storefront::PurchaseTransport;
//!
//! # async fn run(transport: Arc<dyn PurchaseTransport>) -> storefront::Result<()> {
//! let store = Store::new(StoreOptions::new(transport));
//!
//! // Register the catalog and reconcile the receipt.
//! store
//!     .setup(vec![
//!         ItemConfig::consumable("com.purchase.money").with_default_consumable_count(100),
//!         ItemConfig::auto_renewable_subscription("com.purchase.month"),
//!     ])
//!     .await?;
//!
//! // Feature gating without per-screen validation logic.
//! store.set_lock_rules(|ctx| {
//!     let consumables = ctx.store.items_purchased_with_kind(ItemKind::Consumable);
//!     match consumables.first() {
//!         Some(item) => {
//!             item.consume_one().map_err(|e| e.to_string())?;
//!             Ok(false) // unlocked, one unit spent
//!         }
//!         None => Ok(true), // locked: show the paywall
//!     }
//! });
//!
//! if !store.is_locked("premium-screen") {
//!     // proceed with the navigation
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - The [`Store`] is an explicit context object with a clear init/reset
//!   lifecycle; independent instances never share state.
//! - `is_purchased` is always derived from purchase windows, grandfather
//!   ranges, and consumable balances — never stored.
//! - The platform transport, the remote receipt validator, and persistence
//!   are collaborator traits; tests run against fakes.

pub mod config;
pub mod error;
pub mod item;
pub mod ranges;
pub mod receipt;
pub mod registry;
pub mod rules;
pub mod storage;
pub mod store;
pub mod transport;

// Facade
pub use store::{Store, StoreOptions};

// Entity model
pub use item::{
    InstallInfo, ItemKind, Period, PurchaseWindow, StoreItem, TransactionRecord, TransactionState,
};

// Configuration
pub use config::{ConfigEntry, ItemConfig, StoreConfig};

// Errors
pub use error::{PurchaseFailure, Result, StoreError};

// Reconciliation
pub use receipt::{parse_receipt_json, ParsedReceipt, SetupPhase};

// Ranges
pub use ranges::GrandfatherRange;

// Lock rules
pub use rules::{LockContext, LockRule, DEFAULT_RULE};

// Collaborator seams
pub use transport::{ProductInfo, PurchaseTransport, RawReceiptHandler, ReceiptValidator};

// Storage
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

// Registry
pub use registry::Registry;
