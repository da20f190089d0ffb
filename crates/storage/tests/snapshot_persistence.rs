use storage::{SnapshotStore, Storage};

#[tokio::test]
async fn snapshot_survives_reopening_the_database() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("chat_cache_reopen_test_{suffix}"));
    let db_path = temp_root.join("cache.db");
    let database_url = storage::normalize_database_url(db_path.to_string_lossy().as_ref());

    {
        let storage = Storage::new(&database_url).await.expect("open");
        storage
            .save("identity:bob", 1, r#"{"profiles":[]}"#)
            .await
            .expect("save");
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let snapshot = reopened
        .load("identity:bob")
        .await
        .expect("load")
        .expect("snapshot survives restart");
    assert_eq!(snapshot.body, r#"{"profiles":[]}"#);

    drop(reopened);
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}
