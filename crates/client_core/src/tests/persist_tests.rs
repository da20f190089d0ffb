use async_trait::async_trait;
use shared::domain::Profile;
use storage::{MemorySnapshotStore, StoredSnapshot};

use super::*;
use crate::test_support::{channel, notification, server, user};

struct RejectingStore;

#[async_trait]
impl SnapshotStore for RejectingStore {
    async fn load(&self, _key: &str) -> anyhow::Result<Option<StoredSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _key: &str, _schema_version: i64, _body: &str) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    async fn clear(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

fn populated_store(identity: &str) -> Arc<EntityStore> {
    let store = Arc::new(EntityStore::new(500));
    store.set_identity(Some(user(identity)));
    store.set_joined_servers(vec![server("S1")], 1);
    store.ingest_notifications(vec![notification(42, identity, &channel("S1", "5"), 10)]);
    store.upsert_profiles(vec![Profile::empty(user("carol"), 5)]);
    store
}

#[tokio::test]
async fn flush_then_restore_round_trips_the_cache() -> anyhow::Result<()> {
    let backend = Arc::new(MemorySnapshotStore::new());
    let source = populated_store("bob");
    let writer = SnapshotPersistence::new(source, backend.clone(), Duration::from_millis(10));

    assert!(writer.flush().await?);
    assert!(!writer.flush().await?);
    assert_eq!(backend.len(), 1);

    let target = Arc::new(EntityStore::new(500));
    target.set_identity(Some(user("bob")));
    let reader = SnapshotPersistence::new(target.clone(), backend, Duration::from_millis(10));
    assert!(reader.restore(&user("bob")).await?);

    assert_eq!(target.unread_total(), 1);
    assert!(target.get_profile(&user("carol")).is_some());
    assert!(!target.is_dirty());
    Ok(())
}

#[tokio::test]
async fn restore_without_snapshot_is_a_no_op() -> anyhow::Result<()> {
    let store = Arc::new(EntityStore::new(500));
    let persistence =
        SnapshotPersistence::new(store, Arc::new(MemorySnapshotStore::new()), Duration::ZERO);
    assert!(!persistence.restore(&user("bob")).await?);
    Ok(())
}

#[tokio::test]
async fn incompatible_snapshots_are_discarded() -> anyhow::Result<()> {
    let backend = Arc::new(MemorySnapshotStore::new());
    let body = serde_json::to_string(&populated_store("bob").export_snapshot(SNAPSHOT_SCHEMA_VERSION))?;
    backend.save(&snapshot_key(&user("bob")), 99, &body).await?;
    backend.save(&snapshot_key(&user("carol")), 1, &body).await?;

    let store = Arc::new(EntityStore::new(500));
    let persistence = SnapshotPersistence::new(store.clone(), backend, Duration::ZERO);

    assert!(!persistence.restore(&user("bob")).await?);
    assert!(!persistence.restore(&user("carol")).await?);
    assert!(store.notifications().is_empty());
    Ok(())
}

#[test]
fn decode_reports_why_a_snapshot_was_rejected() {
    let body = serde_json::to_string(&populated_store("bob").export_snapshot(1)).expect("encode");

    assert!(matches!(
        decode_snapshot(&user("bob"), 2, &body),
        Err(SnapshotError::SchemaMismatch { found: 2, expected: 1 })
    ));
    assert!(matches!(
        decode_snapshot(&user("carol"), 1, &body),
        Err(SnapshotError::IdentityMismatch { .. })
    ));
    assert!(matches!(
        decode_snapshot(&user("bob"), 1, "{not json"),
        Err(SnapshotError::Decode(_))
    ));
    assert!(decode_snapshot(&user("bob"), 1, &body).is_ok());
}

#[tokio::test]
async fn failed_save_leaves_the_store_dirty() {
    let store = populated_store("bob");
    let persistence = SnapshotPersistence::new(store.clone(), Arc::new(RejectingStore), Duration::ZERO);

    assert!(persistence.flush().await.is_err());
    assert!(store.is_dirty());
}

#[tokio::test]
async fn flush_without_identity_writes_nothing() -> anyhow::Result<()> {
    let backend = Arc::new(MemorySnapshotStore::new());
    let store = Arc::new(EntityStore::new(500));
    store.mark_dirty();
    let persistence = SnapshotPersistence::new(store, backend.clone(), Duration::ZERO);

    assert!(!persistence.flush().await?);
    assert!(backend.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn flusher_debounces_bursts_of_mutations() {
    let backend = Arc::new(MemorySnapshotStore::new());
    let store = Arc::new(EntityStore::new(500));
    store.set_identity(Some(user("bob")));
    let persistence = SnapshotPersistence::new(store.clone(), backend.clone(), Duration::from_millis(1_500));
    let flusher = persistence.start();
    assert_eq!(flusher.name(), "snapshot-flusher");

    store.upsert_profiles(vec![Profile::empty(user("carol"), 1)]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    store.upsert_profiles(vec![Profile::empty(user("dave"), 1)]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(backend.is_empty());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(backend.len(), 1);
    assert!(!store.is_dirty());

    flusher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stopping_the_flusher_writes_pending_changes() -> anyhow::Result<()> {
    let backend = Arc::new(MemorySnapshotStore::new());
    let store = Arc::new(EntityStore::new(500));
    store.set_identity(Some(user("bob")));
    let persistence = SnapshotPersistence::new(store.clone(), backend.clone(), Duration::from_secs(60));
    let flusher = persistence.start();

    store.upsert_profiles(vec![Profile::empty(user("carol"), 1)]);
    tokio::task::yield_now().await;
    flusher.stop().await;

    let saved = backend
        .load(&snapshot_key(&user("bob")))
        .await?
        .expect("final flush saved a snapshot");
    assert_eq!(saved.schema_version, 1);
    assert!(saved.body.contains("carol"));
    Ok(())
}
