//! End-to-end eviction over the SQLite store.
//!
//! Exercises the full synchronize-and-invalidate pass with durable storage:
//! seed a shard past its cap, reconcile against a mock remote listing, and
//! check the two-speed LRU outcome survives a database reopen.

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};

use slidemux_core::manager::{EvictionPolicy, SessionManager};
use slidemux_core::remote::{RemoteFuture, RemoteSessionHandler, ResetReport};
use slidemux_core::session::{RemoteSession, SessionData, ShardId, TileServerShard};
use slidemux_core::sharding::ShardingAlgorithm;
use slidemux_core::storage::{KeyValueStorage, SqliteStorage};

fn shard() -> TileServerShard {
    TileServerShard::new(ShardId(0), "tiles-a", "http://tiles-a.internal:9090")
}

struct EverythingOnShardA;

impl ShardingAlgorithm for EverythingOnShardA {
    fn shard_for(&self, _key: &str) -> Option<TileServerShard> {
        Some(shard())
    }
}

#[derive(Default)]
struct RecordingRemote {
    listing: Mutex<Vec<RemoteSession>>,
    resets: Mutex<Vec<String>>,
}

impl RemoteSessionHandler for RecordingRemote {
    fn get_sessions(&self, _shard: &TileServerShard) -> RemoteFuture<'_, Vec<RemoteSession>> {
        Box::pin(async move { Ok(self.listing.lock().unwrap().clone()) })
    }

    fn reset_sessions(&self, sessions: Vec<SessionData>) -> RemoteFuture<'_, ResetReport> {
        Box::pin(async move {
            let attempted = sessions.len();
            let mut resets = self.resets.lock().unwrap();
            for record in &sessions {
                resets.push(record.image_session_id.clone());
            }
            Ok(ResetReport {
                attempted,
                ..Default::default()
            })
        })
    }
}

#[tokio::test]
async fn durable_eviction_pass_trims_to_the_floor() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("sessions.db");

    let storage = Arc::new(SqliteStorage::open(&db_path).unwrap());
    let remote = Arc::new(RecordingRemote::default());
    let manager = SessionManager::new(
        Arc::clone(&storage) as Arc<dyn KeyValueStorage>,
        Arc::new(EverythingOnShardA),
        Arc::clone(&remote) as Arc<dyn RemoteSessionHandler>,
    );

    // 15 idle (staggered, oldest first) + 7 active sessions on one shard
    let now = Utc::now();
    let mut ids = Vec::new();
    for i in 0..15 {
        let id = format!("idle-{i:02}");
        manager
            .set_session_at(
                &format!("slides/idle-{i:02}.svs"),
                &id,
                shard(),
                vec![],
                now - Duration::minutes(300 - i64::from(i)),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    for i in 0..7 {
        let id = format!("active-{i}");
        manager
            .set_session_at(
                &format!("slides/active-{i}.svs"),
                &id,
                shard(),
                vec![],
                now - Duration::minutes(i64::from(i)),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    *remote.listing.lock().unwrap() =
        ids.iter().map(|id| RemoteSession::new(id.clone())).collect();

    let ok = manager
        .sync_and_invalidate_sessions("slides/fresh.svs", &EvictionPolicy::default())
        .await
        .unwrap();
    assert!(ok);

    // 22 - (15 idle - floor 10) = 17 survivors; the 5 oldest idle were reset
    assert_eq!(manager.count(&shard().namespace()).await.unwrap(), 17);
    let mut reset = remote.resets.lock().unwrap().clone();
    reset.sort();
    assert_eq!(
        reset,
        vec!["idle-00", "idle-01", "idle-02", "idle-03", "idle-04"]
    );

    // Survivors are durable: a fresh connection sees the same state
    drop(manager);
    let reopened = SqliteStorage::open(&db_path).unwrap();
    assert_eq!(
        reopened.get_all_keys(&shard().namespace()).await.unwrap().len(),
        17
    );
    assert!(
        reopened
            .get("slides/idle-00.svs")
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        reopened
            .get("slides/idle-14.svs")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn backpressure_leaves_durable_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("sessions.db")).unwrap());
    let remote = Arc::new(RecordingRemote::default());
    let manager = SessionManager::new(
        storage,
        Arc::new(EverythingOnShardA),
        Arc::clone(&remote) as Arc<dyn RemoteSessionHandler>,
    );

    // Shard at its cap with nothing idle
    let mut ids = Vec::new();
    for i in 0..20 {
        let id = format!("active-{i}");
        manager
            .set_session(&format!("slides/active-{i}.svs"), &id, shard(), vec![])
            .await
            .unwrap();
        ids.push(id);
    }
    *remote.listing.lock().unwrap() =
        ids.iter().map(|id| RemoteSession::new(id.clone())).collect();

    let ok = manager
        .sync_and_invalidate_sessions("slides/fresh.svs", &EvictionPolicy::default())
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(manager.count(&shard().namespace()).await.unwrap(), 20);
    assert!(remote.resets.lock().unwrap().is_empty());
}
