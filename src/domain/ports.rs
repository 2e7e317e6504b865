//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! Abstractions over the two external collaborators this crate drives:
//! the key-value device protocol and the placement ring.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   DeviceConnection │ Connector │ PlacementRing       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │   InMemoryCluster │ TcpConnector │ StaticRing        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Device identifier (`host:port`), also the pool and placement key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into host and port.
    pub fn host_port(&self) -> Result<(&str, u16)> {
        let (host, port) = self
            .0
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("device {:?} is not host:port", self.0)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("device {:?} has an invalid port", self.0)))?;
        Ok((host, port))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Durability tier requested for a device write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronization {
    /// Device default acknowledgment.
    #[default]
    Default,
    /// Acknowledge once persisted.
    WriteThrough,
    /// Acknowledge once buffered.
    WriteBack,
    /// Persist this write and everything buffered before it.
    Flush,
}

impl Synchronization {
    /// Protocol code sent with a put; `None` lets the device choose.
    pub fn wire_code(&self) -> Option<u8> {
        match self {
            Synchronization::Default => None,
            Synchronization::WriteThrough => Some(1),
            Synchronization::WriteBack => Some(2),
            Synchronization::Flush => Some(3),
        }
    }

    /// Tier for one write of an object. `Flush` is only honoured on the
    /// final write; earlier writes go out as `WriteBack`.
    pub fn for_write(&self, is_final: bool) -> Synchronization {
        match self {
            Synchronization::Flush if !is_final => Synchronization::WriteBack,
            other => *other,
        }
    }
}

impl std::str::FromStr for Synchronization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "writethrough" => Ok(Self::WriteThrough),
            "writeback" => Ok(Self::WriteBack),
            "flush" => Ok(Self::Flush),
            other => Err(Error::Config(format!("unknown synchronization {:?}", other))),
        }
    }
}

impl std::fmt::Display for Synchronization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Synchronization::Default => write!(f, "default"),
            Synchronization::WriteThrough => write!(f, "writethrough"),
            Synchronization::WriteBack => write!(f, "writeback"),
            Synchronization::Flush => write!(f, "flush"),
        }
    }
}

/// A range scan request: keys in `[start, end)` (or `(start, end)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: String,
    pub end: String,
    pub start_inclusive: bool,
    pub max_returned: usize,
}

impl KeyRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>, max_returned: usize) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            start_inclusive: true,
            max_returned,
        }
    }

    /// The same range resumed strictly after `key`.
    pub fn after(&self, key: impl Into<String>) -> Self {
        Self {
            start: key.into(),
            start_inclusive: false,
            ..self.clone()
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let lower = if self.start_inclusive {
            key >= self.start.as_str()
        } else {
            key > self.start.as_str()
        };
        lower && key < self.end.as_str()
    }
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Bytes,
}

/// Timeouts and retry bounds for device connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub connect_retry: u32,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(30),
            connect_retry: 3,
        }
    }
}

// =============================================================================
// Device Protocol Port
// =============================================================================

/// Port for one live connection to a key-value device.
///
/// Every call is a request the caller awaits to completion; nothing is
/// pipelined behind the caller's back.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Device this connection talks to.
    fn device(&self) -> &DeviceId;

    /// Fetch one record.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Keys in the range, in byte order, at most `range.max_returned`.
    async fn get_key_range(&self, range: &KeyRange) -> Result<Vec<String>>;

    /// Greatest record whose key is `<= key`.
    async fn get_previous(&self, key: &str) -> Result<Option<Entry>>;

    /// Write a record with the requested durability.
    async fn put(&self, key: &str, value: Bytes, sync: Synchronization) -> Result<()>;

    /// Remove one record; absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove many records.
    async fn delete_keys(&self, keys: &[String]) -> Result<()>;

    /// Source-initiated transfer of `keys` to `target`.
    async fn push_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()>;

    /// Device-to-device copy of `keys` to `target`.
    async fn copy_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection").field("device", self.device()).finish()
    }
}

/// Port for opening device connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        device: &DeviceId,
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn DeviceConnection>>;
}

// =============================================================================
// Placement Port
// =============================================================================

/// Port for the consistent-hash placement ring of one storage policy.
pub trait PlacementRing: Send + Sync {
    /// Right shift that turns the leading 32 hash bits into a partition.
    fn part_shift(&self) -> u32;

    /// Ordered candidate devices for a partition.
    fn get_part_nodes(&self, partition: u32) -> Vec<DeviceId>;

    /// Every device in the ring.
    fn devices(&self) -> Vec<DeviceId>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_host_port() {
        let id = DeviceId::new("10.0.0.5:8123");
        assert_eq!(id.host_port().unwrap(), ("10.0.0.5", 8123));
        assert_eq!(id.to_string(), "10.0.0.5:8123");
        assert!(DeviceId::new("nohost").host_port().is_err());
        assert!(DeviceId::new("h:notaport").host_port().is_err());
    }

    #[test]
    fn test_sync_wire_codes() {
        assert_eq!(Synchronization::Default.wire_code(), None);
        assert_eq!(Synchronization::WriteThrough.wire_code(), Some(1));
        assert_eq!(Synchronization::WriteBack.wire_code(), Some(2));
        assert_eq!(Synchronization::Flush.wire_code(), Some(3));
    }

    #[test]
    fn test_flush_downgrades_until_final_write() {
        assert_eq!(
            Synchronization::Flush.for_write(false),
            Synchronization::WriteBack
        );
        assert_eq!(Synchronization::Flush.for_write(true), Synchronization::Flush);
        for sync in [
            Synchronization::Default,
            Synchronization::WriteThrough,
            Synchronization::WriteBack,
        ] {
            assert_eq!(sync.for_write(false), sync);
            assert_eq!(sync.for_write(true), sync);
        }
    }

    #[test]
    fn test_sync_parse() {
        assert_eq!(
            "WriteBack".parse::<Synchronization>().unwrap(),
            Synchronization::WriteBack
        );
        assert!("sometimes".parse::<Synchronization>().is_err());
    }

    #[test]
    fn test_key_range_bounds() {
        let range = KeyRange::new("a.", "a/", 10);
        assert!(range.contains("a."));
        assert!(range.contains("a.x"));
        assert!(!range.contains("a/"));
        let resumed = range.after("a.x");
        assert!(!resumed.contains("a.x"));
        assert!(resumed.contains("a.y"));
        assert_eq!(resumed.max_returned, 10);
    }
}
