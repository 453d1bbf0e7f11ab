//! Process-wide catalog item registry: identifier-keyed, create-on-first-
//! reference, de-duplicated.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::item::{InstallInfo, ItemKind, StoreItem};

pub struct Registry {
    install: Arc<RwLock<InstallInfo>>,
    default_consumable_count: i64,
    items: RwLock<HashMap<String, Arc<StoreItem>>>,
}

impl Registry {
    pub(crate) fn new(install: Arc<RwLock<InstallInfo>>, default_consumable_count: i64) -> Self {
        Self {
            install,
            default_consumable_count,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Return the item for `identifier`, creating an unclassified one on
    /// first reference. Concurrent resolves of the same identifier always
    /// yield the same instance.
    pub fn resolve(&self, identifier: &str) -> Arc<StoreItem> {
        if let Ok(items) = self.items.read() {
            if let Some(item) = items.get(identifier) {
                return Arc::clone(item);
            }
        }

        let mut items = self.items.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(items.entry(identifier.to_string()).or_insert_with(|| {
            Arc::new(StoreItem::new(
                identifier,
                Arc::clone(&self.install),
                self.default_consumable_count,
            ))
        }))
    }

    /// Every known item, including ones the catalog did not recognize.
    pub fn all(&self) -> Vec<Arc<StoreItem>> {
        let items = self.items.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = items.values().cloned().collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        all
    }

    /// Items the platform catalog recognized.
    pub fn valid(&self) -> Vec<Arc<StoreItem>> {
        self.all().into_iter().filter(|i| !i.is_invalid()).collect()
    }

    pub fn purchased(&self) -> Vec<Arc<StoreItem>> {
        self.all().into_iter().filter(|i| i.is_purchased()).collect()
    }

    pub fn with_kind(&self, kind: ItemKind) -> Vec<Arc<StoreItem>> {
        self.all().into_iter().filter(|i| i.kind() == kind).collect()
    }

    pub fn purchased_with_kind(&self, kind: ItemKind) -> Vec<Arc<StoreItem>> {
        self.with_kind(kind)
            .into_iter()
            .filter(|i| i.is_purchased())
            .collect()
    }

    /// Drop every item. Only reachable through the store's global reset.
    pub(crate) fn clear(&self) {
        self.items.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.items.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Registry").field("items", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> Registry {
        Registry::new(Arc::new(RwLock::new(InstallInfo::default())), 1)
    }

    #[test]
    fn test_resolve_returns_same_instance() {
        let registry = test_registry();
        let a = registry.resolve("com.app.coins");
        let b = registry.resolve("com.app.coins");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn test_lazy_items_start_invalid_and_unknown() {
        let registry = test_registry();
        let item = registry.resolve("com.app.coins");
        assert!(item.is_invalid());
        assert_eq!(item.kind(), ItemKind::Unknown);
        assert!(registry.valid().is_empty());
    }

    #[test]
    fn test_with_kind_filters() {
        let registry = test_registry();
        registry
            .resolve("com.app.coins")
            .classify(ItemKind::Consumable, crate::item::Period::None);
        registry
            .resolve("com.app.pro")
            .classify(ItemKind::NonConsumable, crate::item::Period::None);

        let consumables = registry.with_kind(ItemKind::Consumable);
        assert_eq!(consumables.len(), 1);
        assert_eq!(consumables[0].identifier(), "com.app.coins");
    }

    #[test]
    fn test_concurrent_resolve_no_duplicates() {
        let registry = Arc::new(test_registry());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.resolve("com.app.coins"))
            })
            .collect();

        let items: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for item in &items[1..] {
            assert!(Arc::ptr_eq(&items[0], item));
        }
        assert_eq!(registry.all().len(), 1);
    }
}
