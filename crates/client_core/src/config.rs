use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    Messages,
    ReconcileMessages,
    SendMessage,
    EditMessage,
    Profiles,
    ServerSnapshot,
    MemberList,
    JoinedServers,
    Notifications,
    MarkRead,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 10] = [
        Self::Messages,
        Self::ReconcileMessages,
        Self::SendMessage,
        Self::EditMessage,
        Self::Profiles,
        Self::ServerSnapshot,
        Self::MemberList,
        Self::JoinedServers,
        Self::Notifications,
        Self::MarkRead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::ReconcileMessages => "reconcile_messages",
            Self::SendMessage => "send_message",
            Self::EditMessage => "edit_message",
            Self::Profiles => "profiles",
            Self::ServerSnapshot => "server_snapshot",
            Self::MemberList => "member_list",
            Self::JoinedServers => "joined_servers",
            Self::Notifications => "notifications",
            Self::MarkRead => "mark_read",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == name)
    }

    /// Writes, and the refetch that settles an id-less send, get a fresh
    /// ledger per mutation and drop it once settled.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Self::SendMessage | Self::EditMessage | Self::MarkRead | Self::ReconcileMessages
        )
    }
}

/// Traffic-shaping and freshness rules for one resource class. All
/// durations are milliseconds; a zero disables the corresponding check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub min_interval_ms: u64,
    pub window_ms: u64,
    pub max_attempts_per_window: u32,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub ttl_ms: u64,
    pub force_cooldown_ms: u64,
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_multiplier: f64,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            min_interval_ms: 0,
            window_ms: 60_000,
            max_attempts_per_window: 30,
            failure_threshold: 5,
            ttl_ms: 60_000,
            force_cooldown_ms: 30_000,
            max_retries: 0,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 8_000,
            retry_multiplier: 2.0,
        }
    }
}

impl ResourcePolicy {
    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn next_retry_backoff(&self, current: Duration) -> Duration {
        scale_duration(current, self.retry_multiplier).min(self.retry_max_backoff())
    }

    fn apply(&mut self, patch: &ResourcePolicyPatch) {
        macro_rules! patch {
            ($($field:ident),*) => {
                $(if let Some(v) = patch.$field { self.$field = v; })*
            };
        }
        patch!(
            min_interval_ms,
            window_ms,
            max_attempts_per_window,
            failure_threshold,
            ttl_ms,
            force_cooldown_ms,
            max_retries,
            retry_initial_backoff_ms,
            retry_max_backoff_ms,
            retry_multiplier
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    classes: BTreeMap<ResourceClass, ResourcePolicy>,
}

impl PolicyTable {
    pub fn get(&self, class: ResourceClass) -> ResourcePolicy {
        self.classes.get(&class).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, class: ResourceClass, policy: ResourcePolicy) {
        self.classes.insert(class, policy);
    }

    pub fn update(&mut self, class: ResourceClass, f: impl FnOnce(&mut ResourcePolicy)) {
        let mut policy = self.get(class);
        f(&mut policy);
        self.classes.insert(class, policy);
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        classes.insert(
            ResourceClass::Messages,
            ResourcePolicy {
                min_interval_ms: 1_000,
                ttl_ms: 30_000,
                force_cooldown_ms: 5_000,
                max_retries: 1,
                ..ResourcePolicy::default()
            },
        );
        let mutation = ResourcePolicy {
            ttl_ms: 0,
            force_cooldown_ms: 0,
            ..ResourcePolicy::default()
        };
        classes.insert(ResourceClass::SendMessage, mutation.clone());
        classes.insert(
            ResourceClass::ReconcileMessages,
            ResourcePolicy {
                max_retries: 1,
                ..mutation.clone()
            },
        );
        classes.insert(ResourceClass::EditMessage, mutation.clone());
        classes.insert(
            ResourceClass::MarkRead,
            ResourcePolicy {
                failure_threshold: 0,
                ..mutation
            },
        );
        classes.insert(
            ResourceClass::Profiles,
            ResourcePolicy {
                min_interval_ms: 2_000,
                max_attempts_per_window: 10,
                failure_threshold: 3,
                ttl_ms: 15 * 60_000,
                max_retries: 2,
                retry_initial_backoff_ms: 1_000,
                ..ResourcePolicy::default()
            },
        );
        classes.insert(
            ResourceClass::ServerSnapshot,
            ResourcePolicy {
                min_interval_ms: 5_000,
                max_attempts_per_window: 10,
                failure_threshold: 5,
                ttl_ms: 60 * 60_000,
                max_retries: 2,
                retry_initial_backoff_ms: 1_000,
                ..ResourcePolicy::default()
            },
        );
        classes.insert(
            ResourceClass::MemberList,
            ResourcePolicy {
                max_attempts_per_window: 3,
                failure_threshold: 3,
                ttl_ms: 5 * 60_000,
                ..ResourcePolicy::default()
            },
        );
        classes.insert(
            ResourceClass::JoinedServers,
            ResourcePolicy {
                min_interval_ms: 5_000,
                max_attempts_per_window: 6,
                ttl_ms: 10 * 60_000,
                max_retries: 2,
                retry_initial_backoff_ms: 1_000,
                ..ResourcePolicy::default()
            },
        );
        // The poll loop owns notification cadence; its circuit never opens.
        classes.insert(
            ResourceClass::Notifications,
            ResourcePolicy {
                max_attempts_per_window: 60,
                failure_threshold: 0,
                ttl_ms: 0,
                force_cooldown_ms: 0,
                ..ResourcePolicy::default()
            },
        );
        Self { classes }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub backoff_multiplier: f64,
    pub batch_limit: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            base_interval_ms: 4_000,
            max_interval_ms: 30_000,
            backoff_multiplier: 2.0,
            batch_limit: 100,
        }
    }
}

impl PollSettings {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Interval after one more consecutive failure.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        scale_duration(current, self.backoff_multiplier).min(self.max_interval())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub policies: PolicyTable,
    pub notification_poll: PollSettings,
    pub message_refresh_interval_ms: u64,
    pub message_page_size: u32,
    pub profile_batch_size: usize,
    pub notification_retention: usize,
    pub persist_debounce_ms: u64,
    pub notice_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policies: PolicyTable::default(),
            notification_poll: PollSettings::default(),
            message_refresh_interval_ms: 10_000,
            message_page_size: 50,
            profile_batch_size: 50,
            notification_retention: 500,
            persist_debounce_ms: 1_500,
            notice_threshold: 3,
        }
    }
}

impl EngineSettings {
    pub fn message_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.message_refresh_interval_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ResourcePolicyPatch {
    min_interval_ms: Option<u64>,
    window_ms: Option<u64>,
    max_attempts_per_window: Option<u32>,
    failure_threshold: Option<u32>,
    ttl_ms: Option<u64>,
    force_cooldown_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_initial_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    retry_multiplier: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    policies: BTreeMap<String, ResourcePolicyPatch>,
    notification_poll: Option<PollSettings>,
    message_refresh_interval_ms: Option<u64>,
    message_page_size: Option<u32>,
    profile_batch_size: Option<usize>,
    notification_retention: Option<usize>,
    persist_debounce_ms: Option<u64>,
    notice_threshold: Option<u32>,
}

/// Defaults, then `client.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> EngineSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> EngineSettings {
    let mut settings = EngineSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Err(err) = apply_toml(&mut settings, &raw) {
            warn!(path = %path.display(), "ignoring unreadable settings file: {err:#}");
        }
    }

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

pub fn apply_toml(settings: &mut EngineSettings, raw: &str) -> anyhow::Result<()> {
    let file: SettingsFile = toml::from_str(raw).context("invalid client settings toml")?;

    for (name, patch) in &file.policies {
        match ResourceClass::from_name(name) {
            Some(class) => settings.policies.update(class, |policy| policy.apply(patch)),
            None => warn!(class = %name, "ignoring policy for unknown resource class"),
        }
    }
    if let Some(v) = file.notification_poll {
        settings.notification_poll = v;
    }
    if let Some(v) = file.message_refresh_interval_ms {
        settings.message_refresh_interval_ms = v;
    }
    if let Some(v) = file.message_page_size {
        settings.message_page_size = v;
    }
    if let Some(v) = file.profile_batch_size {
        settings.profile_batch_size = v.max(1);
    }
    if let Some(v) = file.notification_retention {
        settings.notification_retention = v;
    }
    if let Some(v) = file.persist_debounce_ms {
        settings.persist_debounce_ms = v;
    }
    if let Some(v) = file.notice_threshold {
        settings.notice_threshold = v;
    }
    Ok(())
}

pub fn apply_env_overrides(
    settings: &mut EngineSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        name: &str,
    ) -> Option<T> {
        let raw = lookup(name)?;
        match raw.parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring unparsable override");
                None
            }
        }
    }

    if let Some(v) = parsed(&lookup, "APP__NOTIFICATION_POLL_BASE_MS") {
        settings.notification_poll.base_interval_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__NOTIFICATION_POLL_MAX_MS") {
        settings.notification_poll.max_interval_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__MESSAGE_REFRESH_INTERVAL_MS") {
        settings.message_refresh_interval_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__NOTIFICATION_RETENTION") {
        settings.notification_retention = v;
    }
    if let Some(v) = parsed(&lookup, "APP__PERSIST_DEBOUNCE_MS") {
        settings.persist_debounce_ms = v;
    }
    if let Some(v) = parsed(&lookup, "APP__NOTICE_THRESHOLD") {
        settings.notice_threshold = v;
    }
}

fn scale_duration(current: Duration, multiplier: f64) -> Duration {
    let millis = current.as_millis() as f64 * multiplier.max(1.0);
    Duration::from_millis(millis.min(u64::MAX as f64) as u64)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
