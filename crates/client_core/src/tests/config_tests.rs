use std::collections::HashMap;

use super::*;

#[test]
fn default_table_matches_documented_member_and_snapshot_policies() {
    let table = PolicyTable::default();

    let members = table.get(ResourceClass::MemberList);
    assert_eq!(members.min_interval_ms, 0);
    assert_eq!(members.window_ms, 60_000);
    assert_eq!(members.max_attempts_per_window, 3);
    assert_eq!(members.failure_threshold, 3);
    assert_eq!(members.ttl_ms, 5 * 60_000);
    assert_eq!(members.force_cooldown_ms, 30_000);

    let snapshot = table.get(ResourceClass::ServerSnapshot);
    assert_eq!(snapshot.min_interval_ms, 5_000);
    assert_eq!(snapshot.max_attempts_per_window, 10);
    assert_eq!(snapshot.failure_threshold, 5);
    assert_eq!(snapshot.ttl_ms, 60 * 60_000);

    assert_eq!(table.get(ResourceClass::JoinedServers).ttl_ms, 10 * 60_000);
    assert_eq!(table.get(ResourceClass::Notifications).failure_threshold, 0);
    assert_eq!(table.get(ResourceClass::MarkRead).failure_threshold, 0);

    let reconcile = table.get(ResourceClass::ReconcileMessages);
    assert_eq!(reconcile.min_interval_ms, 0);
    assert!(ResourceClass::ReconcileMessages.is_mutation());
}

#[test]
fn toml_patches_only_named_fields() {
    let mut settings = EngineSettings::default();
    apply_toml(
        &mut settings,
        r#"
            notification_retention = 25
            notice_threshold = 2

            [policies.member_list]
            failure_threshold = 7

            [notification_poll]
            base_interval_ms = 1000
            max_interval_ms = 8000
        "#,
    )
    .expect("valid settings");

    let members = settings.policies.get(ResourceClass::MemberList);
    assert_eq!(members.failure_threshold, 7);
    assert_eq!(members.max_attempts_per_window, 3);
    assert_eq!(settings.notification_retention, 25);
    assert_eq!(settings.notice_threshold, 2);
    assert_eq!(settings.notification_poll.base_interval_ms, 1_000);
    assert_eq!(settings.notification_poll.backoff_multiplier, 2.0);
    assert_eq!(settings.persist_debounce_ms, 1_500);
}

#[test]
fn malformed_toml_is_an_error() {
    let mut settings = EngineSettings::default();
    assert!(apply_toml(&mut settings, "notice_threshold = \"many\"").is_err());
    assert_eq!(settings, EngineSettings::default());
}

#[test]
fn env_overrides_apply_and_skip_garbage() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__NOTIFICATION_POLL_BASE_MS", "2500"),
        ("APP__NOTIFICATION_RETENTION", "not-a-number"),
        ("APP__PERSIST_DEBOUNCE_MS", "10"),
    ]);
    let mut settings = EngineSettings::default();
    apply_env_overrides(&mut settings, |name| vars.get(name).map(|v| v.to_string()));

    assert_eq!(settings.notification_poll.base_interval_ms, 2_500);
    assert_eq!(settings.notification_retention, 500);
    assert_eq!(settings.persist_debounce_ms, 10);
}

#[test]
fn missing_settings_file_yields_defaults() {
    let settings = load_settings_from(Path::new("/definitely/not/here/client.toml"));
    assert_eq!(settings.policies, PolicyTable::default());
}

#[test]
fn poll_backoff_doubles_to_ceiling() {
    let poll = PollSettings::default();
    let mut interval = poll.base_interval();
    let mut seen = Vec::new();
    for _ in 0..5 {
        interval = poll.next_backoff(interval);
        seen.push(interval.as_millis());
    }
    assert_eq!(seen, vec![8_000, 16_000, 30_000, 30_000, 30_000]);
}

#[test]
fn retry_backoff_is_capped() {
    let policy = ResourcePolicy {
        retry_initial_backoff_ms: 500,
        retry_max_backoff_ms: 1_500,
        ..ResourcePolicy::default()
    };
    let first = policy.retry_initial_backoff();
    let second = policy.next_retry_backoff(first);
    let third = policy.next_retry_backoff(second);
    assert_eq!(second, Duration::from_millis(1_000));
    assert_eq!(third, Duration::from_millis(1_500));
}
