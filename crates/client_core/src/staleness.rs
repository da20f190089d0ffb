use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use shared::domain::CacheEntry;

use crate::{
    clock::Clock,
    config::{PolicyTable, ResourceClass},
    fetch::ResourceKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// Fresh enough; no network.
    Serve,
    /// Serve now, refresh in the background.
    ServeAndRefresh,
    /// Nothing usable cached, or an accepted force refresh.
    BlockOnFresh,
}

pub struct StalenessPolicy {
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    forced: Mutex<HashMap<ResourceKey, i64>>,
}

impl StalenessPolicy {
    pub fn new(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            clock,
            forced: Mutex::new(HashMap::new()),
        }
    }

    pub fn decide(&self, key: &ResourceKey, fetched_at: Option<i64>, force: bool) -> CacheDecision {
        let policy = self.policies.get(key.class);
        let now = self.clock.now_millis();

        let Some(fetched_at) = fetched_at else {
            if force {
                self.forced.lock().insert(key.clone(), now);
            }
            return CacheDecision::BlockOnFresh;
        };

        if force {
            let mut forced = self.forced.lock();
            let cooled = forced.get(key).map_or(true, |last| {
                now.saturating_sub(*last) >= policy.force_cooldown_ms as i64
            });
            if cooled {
                forced.insert(key.clone(), now);
                return CacheDecision::BlockOnFresh;
            }
        }

        if is_stale(policy.ttl_ms, fetched_at, now) {
            CacheDecision::ServeAndRefresh
        } else {
            CacheDecision::Serve
        }
    }

    pub fn should_serve_cache<T>(&self, entry: Option<&CacheEntry<T>>) -> bool {
        entry.is_some()
    }

    pub fn should_background_refresh<T>(
        &self,
        class: ResourceClass,
        entry: Option<&CacheEntry<T>>,
    ) -> bool {
        let ttl_ms = self.policies.get(class).ttl_ms;
        entry.is_some_and(|entry| is_stale(ttl_ms, entry.fetched_at_millis, self.clock.now_millis()))
    }

    pub fn should_block_on_fresh<T>(&self, entry: Option<&CacheEntry<T>>) -> bool {
        entry.is_none()
    }

    pub fn clear(&self) {
        self.forced.lock().clear();
    }
}

/// A zero TTL never counts as fresh.
fn is_stale(ttl_ms: u64, fetched_at: i64, now: i64) -> bool {
    ttl_ms == 0 || now.saturating_sub(fetched_at) >= ttl_ms as i64
}

#[cfg(test)]
#[path = "tests/staleness_tests.rs"]
mod tests;
