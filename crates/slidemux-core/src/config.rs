//! Configuration for slidemux deployments.
//!
//! One TOML file describes the shard topology, the storage location, the
//! eviction policy defaults, the remote request timeout, and logging. Every
//! section is optional; a missing file section falls back to serde defaults,
//! so a minimal deployment only needs its `[[shards]]` entries.
//!
//! ```toml
//! [storage]
//! path = "slidemux.db"
//!
//! [eviction]
//! max_sessions = 20
//! max_idle_minutes = 120
//! invalidation_threshold = 0.5
//!
//! [[shards]]
//! id = 0
//! label = "tiles-a"
//! url = "http://tiles-a.internal:9090"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::manager::EvictionPolicy;
use crate::session::{ShardId, TileServerShard};

/// Top-level configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlidemuxConfig {
    /// Session store location.
    pub storage: StorageConfig,
    /// Logging setup.
    pub log: LogConfig,
    /// Eviction policy defaults for synchronization passes.
    pub eviction: EvictionPolicy,
    /// Remote shard HTTP settings.
    pub remote: RemoteConfig,
    /// Shard placement settings.
    pub sharding: ShardingConfig,
    /// The deployment's tile-server shards.
    pub shards: Vec<ShardConfig>,
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("slidemux.db"),
        }
    }
}

/// Remote shard HTTP settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Per-request timeout for session listing and reset calls.
    pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
        }
    }
}

/// Shard placement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Virtual nodes per shard on the hash ring.
    pub virtual_nodes: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self { virtual_nodes: 128 }
    }
}

/// One tile-server shard entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Stable numeric identity.
    pub id: usize,
    /// Human-readable name used in logs and the CLI.
    pub label: String,
    /// HTTP base URL of the instance.
    pub url: String,
}

impl ShardConfig {
    /// Build the runtime shard descriptor.
    #[must_use]
    pub fn to_shard(&self) -> TileServerShard {
        TileServerShard::new(ShardId(self.id), self.label.clone(), self.url.clone())
    }
}

impl SlidemuxConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eviction.max_sessions == 0 {
            return Err(ConfigError::Invalid(
                "eviction.max_sessions must be >= 1".to_string(),
            ));
        }
        if self.eviction.max_idle_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "eviction.max_idle_minutes must be >= 1".to_string(),
            ));
        }
        let threshold = self.eviction.invalidation_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "eviction.invalidation_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.sharding.virtual_nodes == 0 {
            return Err(ConfigError::Invalid(
                "sharding.virtual_nodes must be >= 1".to_string(),
            ));
        }
        for shard in &self.shards {
            if shard.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "shard '{}' has an empty url",
                    shard.label
                )));
            }
        }
        // Duplicate ids/labels are caught again when the ring is built; check
        // here too so `smx` reports them at config load
        let mut ids = std::collections::HashSet::new();
        let mut labels = std::collections::HashSet::new();
        for shard in &self.shards {
            if !ids.insert(shard.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate shard id {}",
                    shard.id
                )));
            }
            if !labels.insert(shard.label.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate shard label '{}'",
                    shard.label
                )));
            }
        }
        Ok(())
    }

    /// Runtime shard descriptors for the configured topology.
    #[must_use]
    pub fn shard_topology(&self) -> Vec<TileServerShard> {
        self.shards.iter().map(ShardConfig::to_shard).collect()
    }

    /// Find a configured shard by its label.
    #[must_use]
    pub fn shard_by_label(&self, label: &str) -> Option<TileServerShard> {
        self.shards
            .iter()
            .find(|shard| shard.label == label)
            .map(ShardConfig::to_shard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_defaults() {
        let config: SlidemuxConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.storage.path, PathBuf::from("slidemux.db"));
        assert_eq!(config.eviction.max_sessions, 20);
        assert_eq!(config.remote.request_timeout_secs, 10);
        assert_eq!(config.sharding.virtual_nodes, 128);
        assert!(config.shards.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let config: SlidemuxConfig = toml::from_str(
            r#"
            [storage]
            path = "/var/lib/slidemux/sessions.db"

            [log]
            level = "debug"
            format = "json"

            [eviction]
            max_sessions = 32
            max_idle_minutes = 60
            invalidation_threshold = 0.25

            [remote]
            request_timeout_secs = 5

            [sharding]
            virtual_nodes = 64

            [[shards]]
            id = 0
            label = "tiles-a"
            url = "http://tiles-a.internal:9090"

            [[shards]]
            id = 1
            label = "tiles-b"
            url = "http://tiles-b.internal:9090"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.eviction.max_sessions, 32);
        assert_eq!(config.shards.len(), 2);
        let topology = config.shard_topology();
        assert_eq!(topology[1].label, "tiles-b");
        assert_eq!(topology[1].id, ShardId(1));
    }

    #[test]
    fn duplicate_label_fails_validation() {
        let config: SlidemuxConfig = toml::from_str(
            r#"
            [[shards]]
            id = 0
            label = "tiles-a"
            url = "http://a"

            [[shards]]
            id = 1
            label = "tiles-a"
            url = "http://b"
            "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate shard label"));
    }

    #[test]
    fn out_of_range_threshold_fails_validation() {
        let config: SlidemuxConfig = toml::from_str(
            r#"
            [eviction]
            invalidation_threshold = 1.5
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config: SlidemuxConfig = toml::from_str(
            r#"
            [eviction]
            invalidation_threshold = 0.0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn shard_by_label_resolves() {
        let config: SlidemuxConfig = toml::from_str(
            r#"
            [[shards]]
            id = 3
            label = "tiles-d"
            url = "http://tiles-d.internal:9090"
            "#,
        )
        .unwrap();
        let shard = config.shard_by_label("tiles-d").unwrap();
        assert_eq!(shard.id, ShardId(3));
        assert!(config.shard_by_label("tiles-z").is_none());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = SlidemuxConfig::load(Path::new("/nonexistent/slidemux.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
