use std::{sync::Arc, time::Duration};

use anyhow::Context;
use shared::domain::UserId;
use storage::SnapshotStore;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    store::{CacheSnapshot, EntityStore},
    task::{sleep_or_shutdown, PollHandle},
};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

pub fn snapshot_key(identity: &UserId) -> String {
    format!("identity:{identity}")
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot schema {found} is not supported (expected {expected})")]
    SchemaMismatch { found: i64, expected: u32 },
    #[error("snapshot belongs to {found:?}, not {expected}")]
    IdentityMismatch {
        found: Option<UserId>,
        expected: UserId,
    },
    #[error("snapshot body is unreadable: {0}")]
    Decode(#[from] serde_json::Error),
}

pub fn decode_snapshot(
    identity: &UserId,
    schema_version: i64,
    body: &str,
) -> Result<CacheSnapshot, SnapshotError> {
    if schema_version != i64::from(SNAPSHOT_SCHEMA_VERSION) {
        return Err(SnapshotError::SchemaMismatch {
            found: schema_version,
            expected: SNAPSHOT_SCHEMA_VERSION,
        });
    }
    let snapshot: CacheSnapshot = serde_json::from_str(body)?;
    if snapshot.identity.as_ref() != Some(identity) {
        return Err(SnapshotError::IdentityMismatch {
            found: snapshot.identity,
            expected: identity.clone(),
        });
    }
    Ok(snapshot)
}

/// Debounced bridge between the entity store and a [`SnapshotStore`].
#[derive(Clone)]
pub struct SnapshotPersistence {
    store: Arc<EntityStore>,
    backend: Arc<dyn SnapshotStore>,
    debounce: Duration,
}

impl SnapshotPersistence {
    pub fn new(store: Arc<EntityStore>, backend: Arc<dyn SnapshotStore>, debounce: Duration) -> Self {
        Self {
            store,
            backend,
            debounce,
        }
    }

    /// Loads the identity's snapshot into the store. Unusable snapshots are
    /// discarded with a warning rather than failing startup.
    pub async fn restore(&self, identity: &UserId) -> anyhow::Result<bool> {
        let key = snapshot_key(identity);
        let Some(stored) = self
            .backend
            .load(&key)
            .await
            .with_context(|| format!("failed to load snapshot {key}"))?
        else {
            debug!(snapshot = %key, "no snapshot to restore");
            return Ok(false);
        };

        match decode_snapshot(identity, stored.schema_version, &stored.body) {
            Ok(snapshot) => {
                self.store.import_snapshot(snapshot);
                info!(snapshot = %key, updated_at = %stored.updated_at, "cache restored");
                Ok(true)
            }
            Err(err) => {
                warn!(snapshot = %key, "discarding snapshot: {err}");
                Ok(false)
            }
        }
    }

    /// Writes the store if it is dirty. A failed save leaves it dirty.
    pub async fn flush(&self) -> anyhow::Result<bool> {
        if !self.store.take_dirty() {
            return Ok(false);
        }
        let Some(identity) = self.store.identity() else {
            return Ok(false);
        };
        let snapshot = self.store.export_snapshot(SNAPSHOT_SCHEMA_VERSION);
        let body = match serde_json::to_string(&snapshot) {
            Ok(body) => body,
            Err(err) => {
                self.store.mark_dirty();
                return Err(err).context("failed to encode cache snapshot");
            }
        };
        let key = snapshot_key(&identity);
        if let Err(err) = self
            .backend
            .save(&key, i64::from(SNAPSHOT_SCHEMA_VERSION), &body)
            .await
        {
            self.store.mark_dirty();
            return Err(err).with_context(|| format!("failed to save snapshot {key}"));
        }
        debug!(snapshot = %key, bytes = body.len(), "cache snapshot saved");
        Ok(true)
    }

    /// Flushes after each burst of mutations settles, and once more on stop.
    pub fn start(&self) -> PollHandle {
        let persistence = self.clone();
        PollHandle::spawn("snapshot-flusher", move |mut shutdown| async move {
            loop {
                let woken_by_shutdown = tokio::select! {
                    _ = persistence.store.dirtied() => None,
                    changed = shutdown.changed() => Some(changed.is_err()),
                };
                if let Some(closed) = woken_by_shutdown {
                    if closed || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                if sleep_or_shutdown(&mut shutdown, persistence.debounce).await {
                    break;
                }
                if let Err(err) = persistence.flush().await {
                    warn!("snapshot flush failed: {err:#}");
                }
            }
            if let Err(err) = persistence.flush().await {
                warn!("final snapshot flush failed: {err:#}");
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/persist_tests.rs"]
mod tests;
