//! Session lifecycle coordination and shard-capacity eviction.
//!
//! [`SessionManager`] is the single coordination point for image-session
//! records: it resolves shard placement, persists and refreshes records, and
//! runs the synchronization pass that bounds how many live sessions a shard
//! accumulates. It owns no I/O of its own; everything goes through the three
//! injected collaborators (storage, sharding, remote handler).
//!
//! # Synchronization pass
//!
//! The remote shard is the source of truth for which sessions actually exist
//! (it may have dropped them on its own, e.g. after a restart); local storage
//! is the source of truth for recency. One `sync_and_invalidate_sessions`
//! invocation runs:
//!
//! 1. Resolve the shard owning the key; no shard means no target, `false`.
//! 2. Fetch the shard's live listing and reconcile it into storage.
//! 3. Re-read the shard's namespace; if the key already holds a session or
//!    the count is at/under the eviction floor, `true` with no eviction.
//! 4. Collect sessions idle past the configured horizon.
//! 5. If the shard is full and the idle set cannot restore headroom, `false`
//!    with no partial eviction (back-pressure signal).
//! 6. Evict: the whole idle set when it is small, or only the least recently
//!    used entries above the floor when it is large. Each eviction is a local
//!    delete followed by a remote reset of exactly the deleted records.
//!
//! The two speeds keep a lightly used shard from being thrashed: small
//! amounts of idle state are fully reclaimed, large amounts only down to the
//! floor.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::remote::RemoteSessionHandler;
use crate::session::{PredictionOverlay, SessionData, TileServerShard};
use crate::sharding::ShardingAlgorithm;
use crate::storage::KeyValueStorage;

/// Knobs for the synchronize-and-invalidate pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Hard cap on live sessions per shard.
    pub max_sessions: usize,
    /// Idle horizon in minutes; sessions untouched for longer are eviction
    /// candidates.
    pub max_idle_minutes: i64,
    /// Fraction of `max_sessions` that survives a large-idle-set eviction.
    pub invalidation_threshold: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: 20,
            max_idle_minutes: 120,
            invalidation_threshold: 0.5,
        }
    }
}

impl EvictionPolicy {
    /// Number of idle sessions allowed to survive a large-idle-set eviction.
    #[must_use]
    pub fn floor(&self) -> usize {
        (self.max_sessions as f64 * self.invalidation_threshold).ceil() as usize
    }

    /// Cutoff instant separating idle sessions from active ones.
    #[must_use]
    pub fn idle_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::minutes(self.max_idle_minutes)
    }
}

/// Coordinates session records across storage, shard placement, and the
/// remote tile servers.
///
/// One value per process, constructed at startup with its collaborators and
/// passed explicitly to request handlers. The manager holds no mutable state
/// of its own, so sharing it across request tasks is safe as long as the
/// collaborators are.
pub struct SessionManager {
    storage: Arc<dyn KeyValueStorage>,
    sharding: Arc<dyn ShardingAlgorithm>,
    remote: Arc<dyn RemoteSessionHandler>,
}

impl SessionManager {
    /// Create a manager over the given collaborators.
    #[must_use]
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        sharding: Arc<dyn ShardingAlgorithm>,
        remote: Arc<dyn RemoteSessionHandler>,
    ) -> Self {
        Self {
            storage,
            sharding,
            remote,
        }
    }

    /// Resolve the shard that should own `key`. Pure topology lookup; does
    /// not touch storage.
    #[must_use]
    pub fn shard_for(&self, key: &str) -> Option<TileServerShard> {
        self.sharding.shard_for(key)
    }

    /// Record a freshly negotiated session for `key`, stamped with the
    /// current time.
    ///
    /// Unconditional overwrite: the caller is responsible for only calling
    /// this after legitimately obtaining `image_session_id` from the shard.
    pub async fn set_session(
        &self,
        key: &str,
        image_session_id: &str,
        shard: TileServerShard,
        overlays: Vec<PredictionOverlay>,
    ) -> Result<SessionData> {
        self.set_session_at(key, image_session_id, shard, overlays, Utc::now())
            .await
    }

    /// Record a session with an explicit last-access timestamp.
    pub async fn set_session_at(
        &self,
        key: &str,
        image_session_id: &str,
        shard: TileServerShard,
        overlays: Vec<PredictionOverlay>,
        at: DateTime<Utc>,
    ) -> Result<SessionData> {
        let record = SessionData::with_timestamp(image_session_id, shard, overlays, at);
        let namespace = record.tile_server_shard.namespace();
        self.storage.set(&namespace, key, &record.encode()?).await?;
        debug!(
            key,
            session_id = %record.image_session_id,
            shard = %record.tile_server_shard.label,
            "stored session record"
        );
        Ok(record)
    }

    /// Read the session record for `key`. Malformed stored payloads decode
    /// to `None`.
    pub async fn get_session(&self, key: &str) -> Result<Option<SessionData>> {
        Ok(self
            .storage
            .get(key)
            .await?
            .as_deref()
            .and_then(SessionData::decode))
    }

    /// Refresh the recency of `key`'s session.
    ///
    /// Best-effort heartbeat: silently no-ops when the record is absent or
    /// when the sharding algorithm now assigns the key elsewhere (a stale
    /// record the caller is expected to detect and re-negotiate).
    pub async fn update_session(&self, key: &str) -> Result<()> {
        let Some(stored) = self.get_session(key).await? else {
            return Ok(());
        };
        let Some(current) = self.sharding.shard_for(key) else {
            return Ok(());
        };
        if current != stored.tile_server_shard {
            debug!(
                key,
                stored = %stored.tile_server_shard.label,
                computed = %current.label,
                "skipping refresh; key now resolves to a different shard"
            );
            return Ok(());
        }

        let refreshed = stored.refreshed_at(Utc::now());
        let namespace = refreshed.tile_server_shard.namespace();
        self.storage.set(&namespace, key, &refreshed.encode()?).await
    }

    /// Number of keys currently stored under `namespace`.
    pub async fn count(&self, namespace: &str) -> Result<usize> {
        Ok(self.storage.get_all_keys(namespace).await?.len())
    }

    /// All session records stored under `namespace`; undecodable records
    /// surface as `None`.
    pub async fn all_sessions(&self, namespace: &str) -> Result<Vec<Option<SessionData>>> {
        Ok(self
            .storage
            .get_all_key_values(namespace)
            .await?
            .into_iter()
            .map(|(_, value)| SessionData::decode(&value))
            .collect())
    }

    /// All `(key, record)` pairs stored under `namespace`.
    pub async fn all_key_values(
        &self,
        namespace: &str,
    ) -> Result<Vec<(String, Option<SessionData>)>> {
        Ok(self
            .storage
            .get_all_key_values(namespace)
            .await?
            .into_iter()
            .map(|(key, value)| {
                let decoded = SessionData::decode(&value);
                (key, decoded)
            })
            .collect())
    }

    /// Delete the session record for `key`. Idempotent.
    pub async fn delete_session(&self, key: &str) -> Result<()> {
        self.storage.delete(key).await
    }

    /// Reconcile the shard owning `key` against its remote truth and, if the
    /// shard is over-subscribed, evict idle sessions locally and remotely.
    ///
    /// Returns `Ok(true)` when the shard's session count is within acceptable
    /// bounds (or was brought there), `Ok(false)` when it could not be — the
    /// caller should treat `false` as back-pressure and refuse to open
    /// another session on the shard. A remote listing failure aborts the pass
    /// with an error rather than proceeding on stale local data.
    pub async fn sync_and_invalidate_sessions(
        &self,
        key: &str,
        policy: &EvictionPolicy,
    ) -> Result<bool> {
        let Some(shard) = self.sharding.shard_for(key) else {
            warn!(key, "no shard resolves for key; cannot reconcile");
            return Ok(false);
        };
        let namespace = shard.namespace();

        // Remote truth for session existence
        let remote_sessions = self.remote.get_sessions(&shard).await?;
        let dropped = self
            .storage
            .update(&namespace, &remote_sessions, &shard)
            .await?;
        if dropped > 0 {
            info!(
                shard = %shard.label,
                dropped,
                "reconciled sessions the shard no longer recognizes"
            );
        }

        // Re-read the shard's session set after reconciliation
        let entries = self.all_key_values(&namespace).await?;
        let total = entries.len();
        let floor = policy.floor();
        if entries.iter().any(|(stored_key, _)| stored_key == key) || total <= floor {
            return Ok(true);
        }

        // Idle candidates
        let cutoff = policy.idle_cutoff(Utc::now());
        let mut idle: Vec<(String, SessionData)> = entries
            .into_iter()
            .filter_map(|(stored_key, record)| record.map(|r| (stored_key, r)))
            .filter(|(_, record)| record.is_idle(cutoff))
            .collect();
        let idle_count = idle.len();

        // Eviction cannot restore headroom: refuse without partial eviction
        if total >= policy.max_sessions && idle_count <= total - policy.max_sessions {
            warn!(
                shard = %shard.label,
                total,
                idle = idle_count,
                max_sessions = policy.max_sessions,
                "cannot reclaim headroom; signalling back-pressure"
            );
            return Ok(false);
        }

        // A large idle set is only trimmed down to the floor; a small one is
        // reclaimed entirely.
        idle.sort_by_key(|(_, record)| record.last_access);
        let evict_count = if idle_count > floor {
            idle_count - floor
        } else {
            idle_count
        };
        let victims: Vec<(String, SessionData)> =
            idle.into_iter().take(evict_count).collect();
        if victims.is_empty() {
            return Ok(true);
        }

        for (victim_key, _) in &victims {
            self.storage.delete(victim_key).await?;
        }

        let sessions: Vec<SessionData> =
            victims.into_iter().map(|(_, record)| record).collect();
        let evicted = sessions.len();
        // Local records are already gone; remote reset is best-effort and the
        // shard's own idle policy backstops anything this misses.
        match self.remote.reset_sessions(sessions).await {
            Ok(report) if report.all_succeeded() => {
                info!(shard = %shard.label, evicted, "evicted idle sessions");
            }
            Ok(report) => {
                warn!(
                    shard = %shard.label,
                    evicted,
                    failed = report.failed,
                    "evicted idle sessions; some remote resets failed"
                );
            }
            Err(err) => {
                warn!(
                    shard = %shard.label,
                    evicted,
                    error = %err,
                    "evicted idle sessions; remote reset fan-out failed"
                );
            }
        }

        Ok(true)
    }
}
