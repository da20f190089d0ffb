//! The single gateway to the remote.
//!
//! Every network call is admitted against a per-key [`ResourceLedger`]:
//! open circuits short-circuit, identical in-flight keys share one result,
//! and the per-class interval and window budgets reject bursts locally.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use serde_json::Value;
use shared::domain::{ChannelId, ChannelKey, ServerId, UserId};
use tokio::{sync::broadcast, task::AbortHandle};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::{PolicyTable, ResourceClass, ResourcePolicy},
    error::FetchError,
    events::EngineEvent,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub class: ResourceClass,
    pub id: String,
    pub server: Option<ServerId>,
    pub channel: Option<ChannelId>,
}

impl ResourceKey {
    pub fn new(class: ResourceClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
            server: None,
            channel: None,
        }
    }

    pub fn messages(channel: &ChannelKey) -> Self {
        Self::channel_scoped(ResourceClass::Messages, channel.to_string(), channel)
    }

    /// Refetch that settles one id-less send; never joins or waits behind
    /// an ordinary channel read.
    pub fn reconcile(channel: &ChannelKey, mutation_id: u64) -> Self {
        Self::channel_scoped(
            ResourceClass::ReconcileMessages,
            format!("{channel}#{mutation_id}"),
            channel,
        )
    }

    pub fn send(channel: &ChannelKey, mutation_id: u64) -> Self {
        Self::channel_scoped(
            ResourceClass::SendMessage,
            format!("{channel}#{mutation_id}"),
            channel,
        )
    }

    pub fn edit(channel: &ChannelKey, mutation_id: u64) -> Self {
        Self::channel_scoped(
            ResourceClass::EditMessage,
            format!("{channel}#{mutation_id}"),
            channel,
        )
    }

    pub fn mark_read(channel: &ChannelKey, sequence: u64) -> Self {
        Self::channel_scoped(ResourceClass::MarkRead, format!("{channel}#{sequence}"), channel)
    }

    pub fn server(server: &ServerId) -> Self {
        Self::server_scoped(ResourceClass::ServerSnapshot, server)
    }

    pub fn members(server: &ServerId) -> Self {
        Self::server_scoped(ResourceClass::MemberList, server)
    }

    pub fn profiles(batch: &[UserId]) -> Self {
        let id = batch
            .iter()
            .map(UserId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Self::new(ResourceClass::Profiles, id)
    }

    pub fn joined_servers(user: &UserId) -> Self {
        Self::new(ResourceClass::JoinedServers, user.as_str())
    }

    pub fn notifications(user: &UserId) -> Self {
        Self::new(ResourceClass::Notifications, user.as_str())
    }

    fn server_scoped(class: ResourceClass, server: &ServerId) -> Self {
        Self {
            class,
            id: server.to_string(),
            server: Some(server.clone()),
            channel: None,
        }
    }

    fn channel_scoped(class: ResourceClass, id: String, channel: &ChannelKey) -> Self {
        Self {
            class,
            id,
            server: Some(channel.server_id.clone()),
            channel: Some(channel.channel_id.clone()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class.as_str(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortScope {
    Server(ServerId),
    Channel(ChannelKey),
}

impl AbortScope {
    /// Writes are never aborted by navigation.
    fn covers(&self, key: &ResourceKey) -> bool {
        if key.class.is_mutation() {
            return false;
        }
        match self {
            Self::Server(server) => key.server.as_ref() == Some(server),
            Self::Channel(channel) => {
                key.server.as_ref() == Some(&channel.server_id)
                    && key.channel.as_ref() == Some(&channel.channel_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LedgerState {
    #[default]
    Fresh,
    RateLimited,
    CircuitOpen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    /// Consecutive failures; reset by a success.
    pub attempt_count: u32,
    pub last_attempt_millis: Option<i64>,
    pub state: LedgerState,
    pub window_started_millis: i64,
    pub window_attempts: u32,
    pub latest_seq: u64,
    pub notice_raised: bool,
}

impl ResourceLedger {
    fn admit(&mut self, policy: &ResourcePolicy, now: i64) -> Result<(), u64> {
        if policy.min_interval_ms > 0 {
            if let Some(last) = self.last_attempt_millis {
                let elapsed = now.saturating_sub(last).max(0) as u64;
                if elapsed < policy.min_interval_ms {
                    return Err(policy.min_interval_ms - elapsed);
                }
            }
        }
        if policy.window_ms > 0 && policy.max_attempts_per_window > 0 {
            self.roll_window(policy, now);
            if self.window_attempts >= policy.max_attempts_per_window {
                let reopens_at = self.window_started_millis + policy.window_ms as i64;
                return Err(reopens_at.saturating_sub(now).max(0) as u64);
            }
        }
        Ok(())
    }

    fn roll_window(&mut self, policy: &ResourcePolicy, now: i64) {
        if self.window_attempts == 0
            || now.saturating_sub(self.window_started_millis) >= policy.window_ms as i64
        {
            self.window_started_millis = now;
            self.window_attempts = 0;
        }
    }

    fn record_attempt(&mut self, policy: &ResourcePolicy, now: i64) {
        self.roll_window(policy, now);
        self.window_attempts += 1;
        self.last_attempt_millis = Some(now);
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Value, FetchError>>>;

struct InFlight {
    seq: u64,
    future: SharedFetch,
    abort: AbortHandle,
}

#[derive(Default)]
struct CoordinatorState {
    ledgers: HashMap<ResourceKey, ResourceLedger>,
    inflight: HashMap<ResourceKey, InFlight>,
    next_seq: u64,
}

impl CoordinatorState {
    fn allocate_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

enum FailureVerdict {
    Counted,
    CircuitOpened,
    Superseded,
}

struct CoordinatorInner {
    state: Mutex<CoordinatorState>,
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<EngineEvent>,
    notice_threshold: u32,
}

impl CoordinatorInner {
    fn finish(&self, state: &mut CoordinatorState, key: &ResourceKey, seq: u64) {
        if state.inflight.get(key).is_some_and(|f| f.seq == seq) {
            state.inflight.remove(key);
        }
        if key.class.is_mutation() {
            state.ledgers.remove(key);
        }
    }

    fn commit_success(&self, key: &ResourceKey, seq: u64) -> bool {
        let mut state = self.state.lock();
        let current = match state.ledgers.get_mut(key) {
            Some(ledger) if ledger.latest_seq != seq => false,
            Some(ledger) => {
                ledger.attempt_count = 0;
                ledger.state = LedgerState::Fresh;
                ledger.notice_raised = false;
                true
            }
            None => true,
        };
        self.finish(&mut state, key, seq);
        current
    }

    fn commit_failure(&self, key: &ResourceKey, seq: u64, err: &FetchError) -> FailureVerdict {
        let policy = self.policies.get(key.class);
        let mut notice = None;
        let verdict = {
            let mut state = self.state.lock();
            let Some(ledger) = state.ledgers.get_mut(key) else {
                return FailureVerdict::Counted;
            };
            if ledger.latest_seq != seq {
                return FailureVerdict::Superseded;
            }
            ledger.attempt_count += 1;
            let remote_invalid = matches!(err, FetchError::InvalidResource { .. });
            let tripped = policy.failure_threshold > 0
                && ledger.attempt_count >= policy.failure_threshold;
            if self.notice_threshold > 0
                && !ledger.notice_raised
                && ledger.attempt_count >= self.notice_threshold
                && err.is_transient()
            {
                ledger.notice_raised = true;
                notice = Some(ledger.attempt_count);
            }
            if remote_invalid || tripped {
                ledger.state = LedgerState::CircuitOpen;
                FailureVerdict::CircuitOpened
            } else {
                ledger.state = LedgerState::RateLimited;
                FailureVerdict::Counted
            }
        };

        let resource = key.to_string();
        if let Some(failures) = notice {
            warn!(resource = %resource, failures, "resource keeps failing: {err}");
            let _ = self.events.send(EngineEvent::Notice {
                resource: resource.clone(),
                message: format!("{resource} is unavailable after {failures} attempts: {err}"),
            });
        }
        if matches!(verdict, FailureVerdict::CircuitOpened) {
            warn!(resource = %resource, "circuit opened: {err}");
            let _ = self.events.send(EngineEvent::CircuitOpened { resource });
        }
        verdict
    }

    fn finish_failure(&self, key: &ResourceKey, seq: u64) {
        let mut state = self.state.lock();
        self.finish(&mut state, key, seq);
    }

    /// Counts a retry as a fresh attempt. Refused once the circuit is open or
    /// the fetch was superseded.
    fn record_retry(&self, key: &ResourceKey, seq: u64) -> bool {
        let policy = self.policies.get(key.class);
        let now = self.clock.now_millis();
        let mut state = self.state.lock();
        match state.ledgers.get_mut(key) {
            Some(ledger) if ledger.latest_seq == seq && ledger.state != LedgerState::CircuitOpen => {
                ledger.record_attempt(&policy, now);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    fn is_current(&self, key: &ResourceKey, seq: u64) -> bool {
        self.state
            .lock()
            .ledgers
            .get(key)
            .map_or(true, |ledger| ledger.latest_seq == seq)
    }
}

/// Shared handle; clones address the same ledgers.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl FetchCoordinator {
    pub fn new(
        policies: PolicyTable,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<EngineEvent>,
        notice_threshold: u32,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(CoordinatorState::default()),
                policies,
                clock,
                events,
                notice_threshold,
            }),
        }
    }

    pub fn policy(&self, class: ResourceClass) -> ResourcePolicy {
        self.inner.policies.get(class)
    }

    /// Runs `fetch` for `key` under the ledger rules. `fetch` may be invoked
    /// more than once when the class allows retries.
    pub async fn request<F>(&self, key: ResourceKey, fetch: F) -> Result<Value, FetchError>
    where
        F: FnMut() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static,
    {
        let (seq, shared) = self.admit(&key, fetch)?;
        let result = shared.await;
        if result.is_ok() && !self.inner.is_current(&key, seq) {
            return Err(FetchError::Aborted {
                resource: key.to_string(),
            });
        }
        result
    }

    fn admit<F>(&self, key: &ResourceKey, fetch: F) -> Result<(u64, SharedFetch), FetchError>
    where
        F: FnMut() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static,
    {
        let policy = self.inner.policies.get(key.class);
        let now = self.inner.clock.now_millis();
        let mut state = self.inner.state.lock();

        if state
            .ledgers
            .get(key)
            .is_some_and(|ledger| ledger.state == LedgerState::CircuitOpen)
        {
            return Err(FetchError::InvalidResource {
                resource: key.to_string(),
                reason: "circuit open until reset".to_string(),
            });
        }

        if let Some(inflight) = state.inflight.get(key) {
            debug!(resource = %key, "joining in-flight fetch");
            return Ok((inflight.seq, inflight.future.clone()));
        }

        let seq = state.allocate_seq();
        let ledger = state.ledgers.entry(key.clone()).or_default();
        if let Err(retry_after_ms) = ledger.admit(&policy, now) {
            debug!(resource = %key, retry_after_ms, "fetch rejected by local rate limit");
            if key.class.is_mutation() {
                state.ledgers.remove(key);
            }
            return Err(FetchError::RateLimited {
                resource: key.to_string(),
                retry_after_ms,
            });
        }
        ledger.record_attempt(&policy, now);
        ledger.latest_seq = seq;

        let task = tokio::spawn(run_fetch(
            self.inner.clone(),
            key.clone(),
            seq,
            policy,
            fetch,
        ));
        let abort = task.abort_handle();
        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let task_key = key.clone();
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.finish_failure(&task_key, seq);
                    }
                    if err.is_cancelled() {
                        Err(FetchError::Aborted {
                            resource: task_key.to_string(),
                        })
                    } else {
                        Err(FetchError::Network(format!("fetch task failed: {err}")))
                    }
                }
            }
        }
        .boxed()
        .shared();

        state.inflight.insert(
            key.clone(),
            InFlight {
                seq,
                future: future.clone(),
                abort,
            },
        );
        Ok((seq, future))
    }

    /// Cancels in-flight reads under `scope`; their results are never
    /// committed. Returns how many fetches were cancelled.
    pub fn abort_scope(&self, scope: &AbortScope) -> usize {
        let mut state = self.inner.state.lock();
        let keys: Vec<ResourceKey> = state
            .inflight
            .keys()
            .filter(|key| scope.covers(key))
            .cloned()
            .collect();
        for key in &keys {
            if let Some(inflight) = state.inflight.remove(key) {
                inflight.abort.abort();
            }
            let seq = state.allocate_seq();
            if let Some(ledger) = state.ledgers.get_mut(key) {
                ledger.latest_seq = seq;
            }
        }
        if !keys.is_empty() {
            debug!(?scope, aborted = keys.len(), "aborted scoped fetches");
        }
        keys.len()
    }

    /// Manual reset: forgets the key's history, closing an open circuit.
    pub fn reset(&self, key: &ResourceKey) {
        if self.inner.state.lock().ledgers.remove(key).is_some() {
            info!(resource = %key, "resource ledger reset");
        }
    }

    pub fn reset_server(&self, server: &ServerId) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.ledgers.len();
        state
            .ledgers
            .retain(|key, _| key.server.as_ref() != Some(server));
        let removed = before - state.ledgers.len();
        info!(server_id = %server, removed, "server ledgers reset");
        removed
    }

    /// Override: opens every circuit scoped to `server`, including the
    /// snapshot and member list even if they were never fetched.
    pub fn mark_server_invalid(&self, server: &ServerId) {
        let opened: Vec<String> = {
            let mut state = self.inner.state.lock();
            let mut keys: Vec<ResourceKey> = state
                .ledgers
                .keys()
                .filter(|key| key.server.as_ref() == Some(server) && !key.class.is_mutation())
                .cloned()
                .collect();
            for key in [ResourceKey::server(server), ResourceKey::members(server)] {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            let mut opened = Vec::new();
            for key in keys {
                if let Some(inflight) = state.inflight.remove(&key) {
                    inflight.abort.abort();
                }
                let seq = state.allocate_seq();
                let ledger = state.ledgers.entry(key.clone()).or_default();
                ledger.latest_seq = seq;
                if ledger.state != LedgerState::CircuitOpen {
                    ledger.state = LedgerState::CircuitOpen;
                    opened.push(key.to_string());
                }
            }
            opened
        };
        warn!(server_id = %server, circuits = opened.len(), "server marked invalid");
        for resource in opened {
            let _ = self.inner.events.send(EngineEvent::CircuitOpened { resource });
        }
    }

    /// Session teardown: cancels everything and forgets all ledgers.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        for (_, inflight) in state.inflight.drain() {
            inflight.abort.abort();
        }
        state.ledgers.clear();
    }

    pub fn ledger(&self, key: &ResourceKey) -> Option<ResourceLedger> {
        self.inner.state.lock().ledgers.get(key).cloned()
    }

    pub fn is_circuit_open(&self, key: &ResourceKey) -> bool {
        self.ledger(key)
            .is_some_and(|ledger| ledger.state == LedgerState::CircuitOpen)
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.state.lock().inflight.len()
    }
}

async fn run_fetch<F>(
    inner: Arc<CoordinatorInner>,
    key: ResourceKey,
    seq: u64,
    policy: ResourcePolicy,
    mut fetch: F,
) -> Result<Value, FetchError>
where
    F: FnMut() -> BoxFuture<'static, Result<Value, FetchError>> + Send + 'static,
{
    let mut backoff = policy.retry_initial_backoff();
    let mut retries = 0;
    loop {
        match fetch().await {
            Ok(value) => {
                if inner.commit_success(&key, seq) {
                    return Ok(value);
                }
                return Err(FetchError::Aborted {
                    resource: key.to_string(),
                });
            }
            Err(err) => {
                // Retries stay inside one request; only the final outcome
                // counts toward the circuit.
                if err.is_retryable() && retries < policy.max_retries {
                    retries += 1;
                    debug!(resource = %key, retries, ?backoff, "retrying fetch: {err}");
                    tokio::time::sleep(backoff).await;
                    backoff = policy.next_retry_backoff(backoff.max(Duration::from_millis(1)));
                    if inner.record_retry(&key, seq) {
                        continue;
                    }
                }
                let verdict = inner.commit_failure(&key, seq, &err);
                inner.finish_failure(&key, seq);
                return match verdict {
                    FailureVerdict::Superseded => Err(FetchError::Aborted {
                        resource: key.to_string(),
                    }),
                    _ => Err(err),
                };
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/fetch_tests.rs"]
mod tests;
