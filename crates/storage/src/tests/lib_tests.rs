use super::*;

#[tokio::test]
async fn saves_and_loads_snapshot_by_key() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save("identity:alice", 1, r#"{"messages":[]}"#)
        .await
        .expect("save");

    let loaded = storage
        .load("identity:alice")
        .await
        .expect("load")
        .expect("snapshot present");
    assert_eq!(loaded.key, "identity:alice");
    assert_eq!(loaded.schema_version, 1);
    assert_eq!(loaded.body, r#"{"messages":[]}"#);
}

#[tokio::test]
async fn save_overwrites_existing_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.save("k", 1, "first").await.expect("first");
    storage.save("k", 2, "second").await.expect("second");

    let loaded = storage.load("k").await.expect("load").expect("present");
    assert_eq!(loaded.body, "second");
    assert_eq!(loaded.schema_version, 2);
    assert_eq!(storage.list_snapshot_keys().await.expect("keys"), vec!["k"]);
}

#[tokio::test]
async fn missing_snapshot_loads_as_none() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.load("nobody").await.expect("load").is_none());
}

#[tokio::test]
async fn clear_removes_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.save("k", 1, "body").await.expect("save");
    storage.clear("k").await.expect("clear");
    assert!(storage.load("k").await.expect("load").is_none());
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("chat_cache_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("snapshots.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn memory_store_round_trips_and_clears() {
    let store = MemorySnapshotStore::new();
    assert!(store.is_empty());
    store.save("k", 3, "body").await.expect("save");
    assert_eq!(store.len(), 1);
    assert_eq!(
        store.load("k").await.expect("load").map(|s| s.body),
        Some("body".to_string())
    );
    store.clear("k").await.expect("clear");
    assert!(store.load("k").await.expect("load").is_none());
}

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/cache.db"),
        "sqlite://./data/cache.db"
    );
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}
