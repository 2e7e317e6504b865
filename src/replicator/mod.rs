//! Replication Engine
//!
//! Peer-to-peer replication between kinetic devices. One cycle walks every
//! replicated policy and every device in its ring:
//!
//! ```text
//! Replicator (cycle) ──acquire──▶ ConnectionPool
//!        │
//!        ▼
//! ObjectReplicator::replicate_device
//!        │  enumerate head keys (paged cursor)
//!        │  resolve targets from the ring
//!        ▼
//! replicate_one ──▶ per target: Satisfied | Transferred | Failed
//!        │
//!        └──▶ handoff copy removed once every target is satisfied
//! ```
//!
//! Nothing is carried between cycles. A failed transfer is simply found
//! again on the next pass.

mod cycle;
mod engine;
mod pool;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ports::ConnectSettings;
use crate::error::{Error, Result};

pub use cycle::{CycleStats, Replicator};
pub use engine::{
    is_present_and_current, KeyCursor, KineticReplicator, ObjectOutcome, ObjectReplicator,
    PassStats, TargetOutcome,
};
pub use pool::ConnectionPool;

/// Peer-replication primitive used to move an object's key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Source device pushes the keys to the target.
    #[default]
    Push,
    /// Device-to-device copy.
    Copy,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Push => write!(f, "push"),
            ReplicationMode::Copy => write!(f, "copy"),
        }
    }
}

/// Replicator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(rename = "kinetic_replication_mode", default)]
    pub replication_mode: ReplicationMode,

    /// Connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Per-request timeout (seconds)
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,

    /// Connection pool capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connect_retry")]
    pub connect_retry: u32,

    /// Seconds between cycles
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Tombstones older than this many seconds are removed
    #[serde(default = "default_reclaim_age")]
    pub reclaim_age: u64,

    /// Keys requested per range scan
    #[serde(default = "default_key_range_limit")]
    pub key_range_limit: usize,
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_response_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    10
}

fn default_connect_retry() -> u32 {
    3
}

fn default_interval() -> u64 {
    30
}

fn default_reclaim_age() -> u64 {
    60 * 60 * 24 * 7
}

fn default_key_range_limit() -> usize {
    200
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            replication_mode: ReplicationMode::Push,
            connect_timeout: default_connect_timeout(),
            response_timeout: default_response_timeout(),
            max_connections: default_max_connections(),
            connect_retry: default_connect_retry(),
            interval: default_interval(),
            reclaim_age: default_reclaim_age(),
            key_range_limit: default_key_range_limit(),
        }
    }
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be positive".into()));
        }
        if self.key_range_limit == 0 {
            return Err(Error::Config("key_range_limit must be positive".into()));
        }
        if self.interval == 0 {
            return Err(Error::Config("interval must be positive".into()));
        }
        Ok(())
    }

    pub fn connect_settings(&self) -> ConnectSettings {
        ConnectSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            response_timeout: Duration::from_secs(self.response_timeout),
            connect_retry: self.connect_retry,
        }
    }
}
