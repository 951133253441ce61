//! Session record types for remote tile-server coordination.
//!
//! A displayed whole-slide image allocates an in-memory session on one remote
//! tile-server instance (a shard). The session is identified by an opaque id
//! issued by that shard; tiles can only be fetched by presenting the id to
//! the same instance. [`SessionData`] is the locally stored record binding an
//! image key to its shard, session id, and last access time.
//!
//! # Wire shape
//!
//! Records are stored as flat JSON with camelCase field names:
//!
//! ```json
//! {
//!   "imageSessionId": "sess-01f3",
//!   "lastAccessTimestamp": "2026-08-05T14:30:00Z",
//!   "tileServerShard": { "id": 2, "label": "tiles-c", "baseUrl": "http://tiles-c:9090" },
//!   "overlays": []
//! }
//! ```
//!
//! This shape round-trips field-for-field through the storage layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identifier for a tile-server shard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShardId(pub usize);

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Descriptor of one remote tile-server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileServerShard {
    /// Stable numeric identity within the deployment's topology.
    pub id: ShardId,
    /// Human-readable name used in logs and the CLI.
    pub label: String,
    /// HTTP base URL of the instance.
    pub base_url: String,
}

impl TileServerShard {
    /// Create a new shard descriptor.
    #[must_use]
    pub fn new(id: ShardId, label: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
            base_url: base_url.into(),
        }
    }

    /// Storage namespace scoping this shard's session records.
    ///
    /// Every record for an image key owned by this shard is stored under this
    /// namespace, so one synchronization pass enumerates the whole shard's
    /// session set.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("shard-{}", self.id)
    }
}

impl std::fmt::Display for TileServerShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.base_url)
    }
}

/// Opaque overlay layer descriptor attached to a session.
///
/// Prediction/annotation layers are produced and consumed elsewhere; this
/// core stores and forwards them unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionOverlay(pub serde_json::Value);

/// One live remote tile-server session bound to an image key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    /// Opaque id issued by the remote shard; required for all tile fetches
    /// against that shard.
    pub image_session_id: String,
    /// Updated on every confirmed access; the sole input to idle-time
    /// eviction.
    #[serde(rename = "lastAccessTimestamp")]
    pub last_access: DateTime<Utc>,
    /// The remote instance that currently owns this session.
    pub tile_server_shard: TileServerShard,
    /// Per-session overlay payloads, passed through unchanged.
    #[serde(default)]
    pub overlays: Vec<PredictionOverlay>,
}

impl SessionData {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(
        image_session_id: impl Into<String>,
        shard: TileServerShard,
        overlays: Vec<PredictionOverlay>,
    ) -> Self {
        Self::with_timestamp(image_session_id, shard, overlays, Utc::now())
    }

    /// Create a record with an explicit last-access timestamp.
    #[must_use]
    pub fn with_timestamp(
        image_session_id: impl Into<String>,
        shard: TileServerShard,
        overlays: Vec<PredictionOverlay>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            image_session_id: image_session_id.into(),
            last_access: at,
            tile_server_shard: shard,
            overlays,
        }
    }

    /// Copy of this record with a refreshed last-access timestamp.
    ///
    /// Session id, shard, and overlays are carried over unchanged; replacing
    /// the id (e.g. on shard re-assignment) requires a new record.
    #[must_use]
    pub fn refreshed_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            image_session_id: self.image_session_id.clone(),
            last_access: at,
            tile_server_shard: self.tile_server_shard.clone(),
            overlays: self.overlays.clone(),
        }
    }

    /// Whether this session's last access predates `cutoff`.
    #[must_use]
    pub fn is_idle(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_access < cutoff
    }

    /// Serialize to the stored JSON representation.
    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored payload.
    ///
    /// Malformed payloads are logged and treated as absent; "no session yet"
    /// and "unreadable record" are both expected states, not errors.
    #[must_use]
    pub fn decode(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(error = %err, "discarding malformed session record");
                None
            }
        }
    }
}

/// One entry of a shard's live-session listing.
///
/// The remote owns the full schema; this core only consumes the session id
/// and preserves whatever else the shard includes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSession {
    /// Opaque id of the live session on the shard.
    pub image_session_id: String,
    /// Additional fields the shard may report; unread here.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RemoteSession {
    /// Build a listing entry from a bare session id.
    #[must_use]
    pub fn new(image_session_id: impl Into<String>) -> Self {
        Self {
            image_session_id: image_session_id.into(),
            extra: serde_json::Map::new(),
        }
    }
}
