//! Error types for slidemux-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slidemux-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote tile-server errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the key-value session store
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite-level failure
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The blocking storage task could not be joined
    #[error("blocking task join failed: {0}")]
    TaskJoin(String),
}

/// Errors talking to a remote tile-server shard
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Connection-level failure (DNS, TCP, TLS, timeout)
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The shard answered with a non-success status
    #[error("{url} returned status {status}")]
    Status {
        /// Request URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The session listing could not be decoded
    #[error("failed to decode session listing from {url}: {source}")]
    Decode {
        /// Request URL
        url: String,
        /// Underlying decode error
        #[source]
        source: reqwest::Error,
    },
}

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File path
        path: String,
        /// Underlying TOML error
        #[source]
        source: toml::de::Error,
    },

    /// Config parsed but failed validation
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_converts_to_library_error() {
        let err: Error = StorageError::TaskJoin("cancelled".to_string()).into();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn remote_status_error_names_url_and_code() {
        let err = RemoteError::Status {
            url: "http://tiles-a.internal:9090/api/v1/sessions".to_string(),
            status: 503,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("tiles-a.internal"));
        assert!(rendered.contains("503"));
    }

    #[test]
    fn config_invalid_renders_reason() {
        let err = ConfigError::Invalid("duplicate shard label 'tiles-a'".to_string());
        assert!(err.to_string().contains("duplicate shard label"));
    }
}
