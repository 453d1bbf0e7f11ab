//! Snapshot persistence: purchase state survives a process restart through
//! the storage adapter.

mod common;

use std::sync::Arc;

use common::*;
use storefront::{FileStorage, MemoryStorage, StorageAdapter};

fn fresh_store(storage: Arc<dyn StorageAdapter>, transport: Arc<FakeTransport>) -> Store {
    let mut options = StoreOptions::new(transport);
    options.storage = Some(storage);
    Store::new(options)
}

#[tokio::test]
async fn snapshot_round_trips_through_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let configs = || {
        vec![
            ItemConfig::consumable("com.app.coins").with_default_consumable_count(5),
            ItemConfig::non_consumable("com.app.pro"),
        ]
    };

    {
        let transport = FakeTransport::new();
        transport.add_product("com.app.coins", 199);
        transport.add_product("com.app.pro", 4_999);

        let storage: Arc<dyn StorageAdapter> =
            Arc::new(FileStorage::new(dir.path()).expect("dir exists"));
        let store = fresh_store(storage, transport);
        store.setup(configs()).await.unwrap();

        store.purchase("com.app.coins").await.unwrap();
        store.consume("com.app.coins", 2).unwrap();
        store.purchase("com.app.pro").await.unwrap();
    }

    // A second process: same directory, transport with no receipt at all.
    let transport = FakeTransport::new();
    transport.add_product("com.app.coins", 199);
    transport.add_product("com.app.pro", 4_999);

    let storage: Arc<dyn StorageAdapter> =
        Arc::new(FileStorage::new(dir.path()).expect("dir exists"));
    let store = fresh_store(storage, transport);
    store.setup(configs()).await.unwrap();

    assert_eq!(store.resolve("com.app.coins").consumable_balance(), 3);
    assert!(store.resolve("com.app.coins").is_purchased());
    assert!(store.resolve("com.app.pro").is_purchased());
}

#[tokio::test]
async fn restored_snapshot_keeps_merges_idempotent() {
    // The same receipt transaction seen again after a restart must not
    // double-grant consumable units.
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let receipt = receipt_with(vec![in_app("com.app.coins", "txn-1", now() - 86_400, None)]);

    let make_transport = || {
        let transport = FakeTransport::new();
        transport.add_product("com.app.coins", 199);
        transport.set_receipt_json(&receipt);
        transport
    };
    let configs =
        || vec![ItemConfig::consumable("com.app.coins").with_default_consumable_count(10)];

    let store = fresh_store(Arc::clone(&storage), make_transport());
    store.setup(configs()).await.unwrap();
    assert_eq!(store.resolve("com.app.coins").consumable_balance(), 10);
    store.consume("com.app.coins", 4).unwrap();

    let store = fresh_store(storage, make_transport());
    store.setup(configs()).await.unwrap();
    assert_eq!(store.resolve("com.app.coins").consumable_balance(), 6);
}

#[tokio::test]
async fn grandfather_ranges_do_not_duplicate_across_restarts() {
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
    let configs = || {
        vec![ItemConfig::non_consumable("com.app.early")
            .with_purchased_ranges(["1/1/2020-12/31/2020"])]
    };

    let store = fresh_store(Arc::clone(&storage), FakeTransport::new());
    store.setup(configs()).await.unwrap();
    let windows = store.resolve("com.app.early").purchase_windows();
    assert_eq!(windows.len(), 1);

    // Restart re-applies the same config over the restored snapshot.
    let store = fresh_store(storage, FakeTransport::new());
    store.setup(configs()).await.unwrap();
    assert_eq!(store.resolve("com.app.early").purchase_windows(), windows);
}

#[tokio::test]
async fn install_metadata_survives_restart() {
    let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());

    let transport = FakeTransport::new();
    transport.set_receipt_json(&receipt_with(vec![]));
    let store = fresh_store(Arc::clone(&storage), transport);
    store.setup(vec![]).await.unwrap();
    assert_eq!(store.first_install_app_version().as_deref(), Some("2.0"));

    // Second run: the device no longer surfaces a receipt.
    let store = fresh_store(storage, FakeTransport::new());
    store.setup(vec![]).await.unwrap();
    assert_eq!(store.first_install_app_version().as_deref(), Some("2.0"));
    assert_eq!(
        store.first_install_date().map(|d| d.timestamp()),
        Some(1_577_836_800)
    );
    assert!(store.first_install_is_older_version("2.1"));
}
