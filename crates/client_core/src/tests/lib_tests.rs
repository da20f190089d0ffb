use std::time::Duration;

use serde_json::json;
use shared::{
    domain::{FriendEdge, NotificationId},
    error::{ErrorCode, ValidationError},
    protocol::Endpoint,
};
use storage::MemorySnapshotStore;

use super::*;
use crate::test_support::{
    channel, clock, notification, server, user, FakeRemote, Reply,
};

fn engine_with(
    remote: &Arc<FakeRemote>,
    clock: &Arc<ManualClock>,
    settings: EngineSettings,
    snapshots: Option<Arc<dyn SnapshotStore>>,
) -> SyncEngine {
    SyncEngine::new_with_dependencies(
        remote.clone(),
        settings,
        EngineDependencies {
            clock: clock.clone(),
            hooks: Arc::new(SilentHooks),
            snapshots,
        },
    )
}

fn engine(remote: &Arc<FakeRemote>, clock: &Arc<ManualClock>) -> SyncEngine {
    engine_with(remote, clock, EngineSettings::default(), None)
}

fn members_reply(members: &[(&str, Option<&str>)]) -> Reply {
    let members: Vec<_> = members
        .iter()
        .map(|(id, nickname)| json!({"user_id": id, "nickname": nickname}))
        .collect();
    Reply::Json(json!({ "members": members }))
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn failed_send_is_visible_then_rolled_back_with_one_error() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    engine.login("alice").await.expect("login");
    let mut events = engine.events();
    remote.always(Endpoint::SendMessage, Reply::Transport("connection reset"));
    let c1 = channel("S1", "C1");

    let pending = engine.begin_send("S1", "C1", "hello").expect("valid send");
    let hello = |engine: &SyncEngine| {
        engine
            .get_messages(&c1)
            .into_iter()
            .filter(|m| m.content == "hello")
            .count()
    };
    assert_eq!(hello(&engine), 1);

    assert!(engine.complete_send(pending).await.is_err());
    assert_eq!(hello(&engine), 0);

    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::MutationFailed { .. }) {
            failures += 1;
        }
    }
    assert_eq!(failures, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn back_to_back_forced_member_fetches_trip_the_circuit() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::GetServerMembers, Reply::Transport("timeout"));

    let mut results = Vec::new();
    for _ in 0..4 {
        results.push(engine.fetch_server_members("S1", true).await);
    }

    assert!(results[..3]
        .iter()
        .all(|r| matches!(r, Err(FetchError::Network(_)))));
    assert!(matches!(
        results[3],
        Err(FetchError::InvalidResource { .. } | FetchError::RateLimited { .. })
    ));
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 3);
    assert!(engine
        .coordinator()
        .is_circuit_open(&ResourceKey::members(&server("S1"))));
}

#[tokio::test]
async fn repeated_forced_member_fetches_trip_the_circuit() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::GetServerMembers, Reply::Transport("timeout"));

    for _ in 0..3 {
        let result = engine.fetch_server_members("S1", true).await;
        assert!(matches!(result, Err(FetchError::Network(_))));
        clock.advance(Duration::from_secs(2));
    }
    let fourth = engine.fetch_server_members("S1", true).await;

    assert!(matches!(
        fourth,
        Err(FetchError::InvalidResource { .. } | FetchError::RateLimited { .. })
    ));
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 3);
    assert!(engine
        .coordinator()
        .is_circuit_open(&ResourceKey::members(&server("S1"))));
}

#[tokio::test]
async fn marking_a_channel_read_is_exact_and_idempotent() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::MarkNotificationsRead, Reply::Json(json!({})));
    engine.login("bob").await.expect("login");

    let c5 = channel("S1", "5");
    let other = channel("S1", "6");
    engine.store().set_joined_servers(vec![server("S1")], 1);
    engine.store().ingest_notifications(vec![
        notification(1, "bob", &c5, 1),
        notification(2, "bob", &c5, 2),
        notification(3, "bob", &c5, 3),
        notification(4, "bob", &other, 4),
    ]);
    assert_eq!(engine.get_unread_count(), 4);

    assert_eq!(engine.mark_notifications_read("S1", "5"), Ok(3));
    assert_eq!(engine.get_unread_count(), 1);
    assert_eq!(engine.mark_notifications_read("S1", "5"), Ok(0));
    assert_eq!(engine.get_unread_count(), 1);
    assert_eq!(engine.get_unread_counts_by_server().get(&server("S1")), Some(&1));
    assert_eq!(engine.get_unread_counts_by_channel().get(&other), Some(&1));
    engine.shutdown().await;
}

#[tokio::test]
async fn cached_members_are_served_until_stale_then_refreshed_in_background() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(
        Endpoint::GetServerMembers,
        members_reply(&[("alice", Some("Al")), ("bob", None)]),
    );

    let first = engine.fetch_server_members("S1", false).await.expect("fetched");
    assert_eq!(first.len(), 2);
    engine.fetch_server_members("S1", false).await.expect("cached");
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 1);

    remote.always(Endpoint::GetServerMembers, members_reply(&[("carol", None)]));
    clock.advance(Duration::from_secs(6 * 60));
    let stale = engine.fetch_server_members("S1", false).await.expect("stale copy");
    assert_eq!(stale.len(), 2);

    assert!(eventually(|| engine.get_server_members(&server("S1")).len() == 1).await);
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 2);
}

#[tokio::test]
async fn forced_refresh_failure_falls_back_to_cached_copy() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::GetServerMembers, members_reply(&[("alice", None)]));
    engine.fetch_server_members("S1", false).await.expect("fetched");

    remote.always(Endpoint::GetServerMembers, Reply::Transport("offline"));
    clock.advance(Duration::from_secs(31));
    let members = engine
        .fetch_server_members("S1", true)
        .await
        .expect("cached copy served");

    assert_eq!(members.len(), 1);
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 2);
}

#[tokio::test]
async fn invalid_server_stays_blocked_until_reset() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.once(
        Endpoint::GetServer,
        Reply::Status(404, ErrorCode::NotFound, "no such server"),
    );
    remote.always(
        Endpoint::GetServer,
        Reply::Json(json!({"server_id": "S2", "name": "two", "owner_id": "alice"})),
    );

    assert!(matches!(
        engine.get_server("S2", false).await,
        Err(FetchError::InvalidResource { .. })
    ));
    assert!(matches!(
        engine.get_server("S2", true).await,
        Err(FetchError::InvalidResource { .. })
    ));
    assert_eq!(remote.calls(Endpoint::GetServer), 1);

    assert!(engine.reset_server("S2").expect("valid id") >= 1);
    clock.advance(Duration::from_secs(6));
    let snapshot = engine.get_server("S2", true).await.expect("fetched after reset");
    assert_eq!(snapshot.name, "two");
    assert_eq!(remote.calls(Endpoint::GetServer), 2);
}

#[tokio::test]
async fn marking_a_server_invalid_blocks_its_reads() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::GetServerMembers, members_reply(&[]));

    engine.mark_server_invalid("S9").expect("valid id");
    assert!(matches!(
        engine.fetch_server_members("S9", false).await,
        Err(FetchError::InvalidResource { .. })
    ));
    assert_eq!(remote.total_calls(), 0);

    engine.reset_server("S9").expect("valid id");
    engine.fetch_server_members("S9", false).await.expect("fetched");
}

#[tokio::test]
async fn bulk_profiles_deduplicate_skip_fresh_and_batch() {
    let remote = FakeRemote::new();
    let clock = clock();
    let settings = EngineSettings {
        profile_batch_size: 2,
        ..EngineSettings::default()
    };
    let engine = engine_with(&remote, &clock, settings, None);
    remote.once(
        Endpoint::GetProfiles,
        Reply::Json(json!({"profiles": [
            {"user_id": "alice", "primary_name": "Alice"},
            {"user_id": "bob", "username": "bobby"}
        ]})),
    );
    remote.once(Endpoint::GetProfiles, Reply::Json(json!({"profiles": []})));

    let profiles = engine
        .fetch_bulk_profiles(&["bob", "alice", "bob", "carol"])
        .await
        .expect("fetched");

    assert_eq!(profiles.len(), 3);
    assert_eq!(remote.calls(Endpoint::GetProfiles), 2);
    let carol = engine.get_profile(&user("carol")).expect("placeholder profile");
    assert_eq!(carol.display_name(), "carol");

    engine
        .fetch_bulk_profiles(&["alice", "carol"])
        .await
        .expect("served fresh");
    assert_eq!(remote.calls(Endpoint::GetProfiles), 2);
}

#[tokio::test]
async fn bulk_profiles_report_first_batch_failure_after_trying_all() {
    let remote = FakeRemote::new();
    let clock = clock();
    let settings = EngineSettings {
        profile_batch_size: 1,
        ..EngineSettings::default()
    };
    let engine = engine_with(&remote, &clock, settings, None);
    remote.once(
        Endpoint::GetProfiles,
        Reply::Status(422, ErrorCode::Validation, "bad batch"),
    );
    remote.once(
        Endpoint::GetProfiles,
        Reply::Json(json!({"profiles": [{"user_id": "bob"}]})),
    );

    let result = engine.fetch_bulk_profiles(&["alice", "bob"]).await;

    assert!(matches!(result, Err(FetchError::Validation(_))));
    assert_eq!(remote.calls(Endpoint::GetProfiles), 2);
    assert!(engine.get_profile(&user("bob")).is_some());
}

#[tokio::test]
async fn display_name_and_friend_status_read_from_cache() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    engine.login("alice").await.expect("login");
    let s1 = server("S1");

    engine.store().upsert_members(
        &s1,
        vec![Member {
            user_id: user("carol"),
            nickname: Some("cc".into()),
        }],
        1,
    );
    let mut dave = Profile::empty(user("dave"), 1);
    dave.primary_name = Some("Dave D.".into());
    let mut alice = Profile::empty(user("alice"), 1);
    alice.friends = vec![
        FriendEdge::new(user("alice"), true, user("bob"), false),
        FriendEdge::new(user("alice"), true, user("dave"), true),
    ];
    engine.store().upsert_profiles(vec![dave, alice]);

    assert_eq!(engine.display_name(&s1, &user("carol")), "cc");
    assert_eq!(engine.display_name(&s1, &user("dave")), "Dave D.");
    assert_eq!(engine.display_name(&s1, &user("erin")), "erin");
    assert_eq!(engine.friend_status(&user("bob")), FriendStatus::PendingSent);
    assert_eq!(engine.friend_status(&user("dave")), FriendStatus::Friends);
    assert_eq!(engine.friend_status(&user("erin")), FriendStatus::None);
    engine.shutdown().await;
}

#[tokio::test]
async fn invalid_input_fails_before_any_network_call() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);

    assert!(matches!(
        engine.fetch_server_members("", false).await,
        Err(FetchError::Validation(_))
    ));
    assert_eq!(
        engine.send_message("S1", "C1", "hi").await,
        Err(FetchError::NoIdentity)
    );
    assert_eq!(
        engine.mark_notifications_read("S1", "5"),
        Err(FetchError::NoIdentity)
    );
    assert_eq!(engine.fetch_joined_servers(false).await, Err(FetchError::NoIdentity));

    engine.login("alice").await.expect("login");
    assert_eq!(
        engine.send_message("S1", "C1", "  ").await,
        Err(FetchError::Validation(ValidationError::EmptyContent))
    );
    assert_eq!(remote.calls(Endpoint::SendMessage), 0);
    assert_eq!(remote.calls(Endpoint::GetServerMembers), 0);
    assert!(engine.login("").await.is_err());
    engine.shutdown().await;
}

#[tokio::test]
async fn switching_identity_drops_the_previous_cache() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    let mut events = engine.events();

    engine.login("bob").await.expect("login");
    engine.store().set_joined_servers(vec![server("S1")], 1);
    engine
        .store()
        .ingest_notifications(vec![notification(42, "bob", &channel("S1", "5"), 1)]);
    assert_eq!(engine.get_unread_count(), 1);

    engine.login("carol").await.expect("login");
    assert_eq!(engine.current_identity(), Some(user("carol")));
    assert_eq!(engine.get_unread_count(), 0);
    assert!(engine.store().get_notification(NotificationId(42)).is_none());

    engine.logout().await;
    assert_eq!(engine.current_identity(), None);
    assert_eq!(
        events.try_recv().ok(),
        Some(EngineEvent::IdentityChanged(Some(user("bob"))))
    );
    assert_eq!(
        events.try_recv().ok(),
        Some(EngineEvent::IdentityChanged(Some(user("carol"))))
    );
    assert_eq!(events.try_recv().ok(), Some(EngineEvent::IdentityChanged(None)));
}

#[tokio::test]
async fn logging_back_in_restores_the_persisted_cache() {
    let remote = FakeRemote::new();
    let clock = clock();
    let backend = Arc::new(MemorySnapshotStore::new());
    let engine = engine_with(
        &remote,
        &clock,
        EngineSettings::default(),
        Some(backend.clone() as Arc<dyn SnapshotStore>),
    );

    engine.login("bob").await.expect("login");
    engine.store().set_joined_servers(vec![server("S1")], 1);
    engine
        .store()
        .ingest_notifications(vec![notification(42, "bob", &channel("S1", "5"), 1)]);
    engine.logout().await;
    assert_eq!(backend.len(), 1);
    assert_eq!(engine.get_unread_count(), 0);

    engine.login("bob").await.expect("login");
    assert_eq!(engine.get_unread_count(), 1);
    assert!(!engine.store().is_dirty());
    engine.shutdown().await;
}

#[tokio::test]
async fn opening_channels_swaps_the_poller() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = engine(&remote, &clock);
    remote.always(Endpoint::GetMessages, Reply::Json(json!({"messages": []})));
    engine.login("alice").await.expect("login");

    engine.open_channel("S1", "C1").await.expect("open");
    assert_eq!(engine.open_channel_key().await, Some(channel("S1", "C1")));
    assert!(eventually(|| remote.calls(Endpoint::GetMessages) >= 1).await);

    engine.open_channel("S1", "C1").await.expect("reopen");
    engine.open_channel("S2", "C7").await.expect("switch");
    assert_eq!(engine.open_channel_key().await, Some(channel("S2", "C7")));

    engine.close_channel().await;
    assert_eq!(engine.open_channel_key().await, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn engine_follows_an_external_identity_source() {
    let remote = FakeRemote::new();
    let clock = clock();
    let engine = Arc::new(engine(&remote, &clock));
    let source = IdentitySource::default();
    let follower = engine.follow_identity(source.subscribe());

    assert!(source.set(Some(user("bob"))));
    assert!(eventually(|| engine.current_identity() == Some(user("bob"))).await);
    assert!(!source.set(Some(user("bob"))));

    source.set(None);
    assert!(eventually(|| engine.current_identity().is_none()).await);

    follower.stop().await;
    engine.shutdown().await;
}
