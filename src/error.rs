//! Error types for the kinetic object store

use thiserror::Error;

use crate::domain::keys::Timestamp;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the object store and replicator
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Key Codec Errors
    // =========================================================================
    /// Key does not have the shape of a head or chunk key
    #[error("Malformed key {key:?}: {reason}")]
    MalformedKey { key: String, reason: String },

    // =========================================================================
    // DiskFile Errors
    // =========================================================================
    /// No head key exists for the hashpath
    #[error("Object does not exist: {hashpath}")]
    DiskFileNotExist { hashpath: String },

    /// The newest key for the hashpath is a tombstone
    #[error("Object was deleted at {timestamp}")]
    DiskFileDeleted { timestamp: Timestamp },

    /// A chunk referenced by a head record is not on the device
    #[error("Missing chunk {key} for object {hashpath}")]
    MissingChunk { hashpath: String, key: String },

    /// Object metadata is missing a required field or carries a bad value
    #[error("Invalid object metadata: {0}")]
    InvalidMetadata(String),

    // =========================================================================
    // Device Errors
    // =========================================================================
    /// Device unreachable or connection dropped
    #[error("Connection error ({device}): {message}")]
    Connection { device: String, message: String },

    /// Device actively refused the connection
    #[error("Connection refused for {device}")]
    ConnectionRefused { device: String },

    /// Connect or request exceeded its timeout
    #[error("Timed out after {timeout_secs}s during {operation} on {device}")]
    Timeout {
        device: String,
        operation: String,
        timeout_secs: u64,
    },

    /// Device answered a request with an error status
    #[error("Device error ({device}): {message}")]
    Device { device: String, message: String },

    /// Push or copy of an object's key set to a peer failed
    #[error("Transfer of {key} to {target} failed: {message}")]
    Transfer {
        key: String,
        target: String,
        message: String,
    },

    // =========================================================================
    // Policy / Configuration Errors
    // =========================================================================
    /// Storage policy type has no backend implementation
    #[error("Unsupported policy {policy}: {reason}")]
    UnsupportedPolicy { policy: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config parse error
    #[error("Config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `MalformedKey` error.
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// True when the device refused the connection outright.
    pub fn is_connection_refused(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
            _ => false,
        }
    }

    /// True for the expected read-path outcomes (absent or deleted).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::DiskFileNotExist { .. } | Self::DiskFileDeleted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_refused_classification() {
        let err = Error::ConnectionRefused {
            device: "10.0.0.1:8123".to_string(),
        };
        assert!(err.is_connection_refused());
        assert!(err.to_string().contains("10.0.0.1:8123"));

        let io = Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(io.is_connection_refused());

        let other = Error::Connection {
            device: "d".to_string(),
            message: "reset".to_string(),
        };
        assert!(!other.is_connection_refused());
    }

    #[test]
    fn test_not_found_outcomes() {
        let missing = Error::DiskFileNotExist {
            hashpath: "abc".to_string(),
        };
        let deleted = Error::DiskFileDeleted {
            timestamp: Timestamp::from_secs_f64(10.5),
        };
        assert!(missing.is_not_found());
        assert!(deleted.is_not_found());
        assert!(deleted.to_string().contains("0000000010.50000"));
        assert!(!Error::Internal("x".to_string()).is_not_found());
    }

    #[test]
    fn test_malformed_formatting() {
        let err = Error::malformed("objects.abc", "too few segments");
        let msg = err.to_string();
        assert!(msg.contains("objects.abc"));
        assert!(msg.contains("too few segments"));
    }
}
