//! Lock rules: caller-defined predicates deciding whether a navigation
//! action should be blocked pending purchase.
//!
//! Rules keep purchase-gating logic in one place instead of scattering
//! checks across screens. A predicate may have side effects (typically
//! spending a consumable unit when it decides "unlocked"); the evaluator
//! runs it exactly once per call and never retries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Result, StoreError};
use crate::store::Store;

/// Rule index used by the plain `is_locked` check.
pub const DEFAULT_RULE: u32 = 0;

/// What a lock-rule predicate gets to look at.
pub struct LockContext<'a> {
    /// The store, for registry queries and consumable spending.
    pub store: &'a Store,
    /// Opaque navigation tag supplied by the caller (screen or segue name).
    pub screen: &'a str,
}

/// A lock decision: `Ok(true)` blocks the transition, `Ok(false)` lets it
/// through. An `Err` is reported as `RuleEvaluationFailed` and the boolean
/// helpers treat it as locked.
pub type LockRule =
    Box<dyn Fn(&LockContext<'_>) -> std::result::Result<bool, String> + Send + Sync + 'static>;

#[derive(Default)]
pub(crate) struct RuleSet {
    rules: RwLock<HashMap<u32, Arc<LockRule>>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the predicate for a rule index.
    pub fn set(&self, index: u32, rule: LockRule) {
        if let Ok(mut rules) = self.rules.write() {
            rules.insert(index, Arc::new(rule));
        }
    }

    /// Run the predicate for `index` exactly once.
    ///
    /// The map lock is released before the predicate runs, so a predicate
    /// is free to re-enter the store: register or replace rules, run nested
    /// lock checks, spend balances.
    pub fn evaluate(&self, ctx: &LockContext<'_>, index: u32) -> Result<bool> {
        let rule = {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            rules.get(&index).cloned()
        };
        let rule = rule.ok_or(StoreError::RuleNotRegistered(index))?;
        (*rule)(ctx).map_err(StoreError::RuleEvaluationFailed)
    }

    pub fn is_registered(&self, index: u32) -> bool {
        self.rules
            .read()
            .map(|rules| rules.contains_key(&index))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.rules.read().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("RuleSet").field("rules", &len).finish()
    }
}
