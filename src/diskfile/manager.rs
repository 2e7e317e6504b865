//! DiskFile manager: configuration and the per-policy factory for
//! [`DiskFile`] handles.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::file::DiskFile;
use crate::config::HashConfig;
use crate::domain::keys::hash_path;
use crate::domain::policy::{PolicyType, StoragePolicy};
use crate::domain::ports::{ConnectSettings, Connector, DeviceId, Synchronization};
use crate::error::{Error, Result};

/// Default chunk size (1 MiB).
pub const DEFAULT_DISK_CHUNK_SIZE: usize = 1024 * 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the diskfile layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskFileConfig {
    /// Durability tier for writes
    #[serde(default)]
    pub synchronization: Synchronization,

    /// Bytes per chunk record
    #[serde(default = "default_disk_chunk_size")]
    pub disk_chunk_size: usize,

    /// Chunk puts allowed in flight per writer
    #[serde(default = "default_write_depth")]
    pub write_depth: usize,

    /// Deletes allowed in flight while reclaiming old versions
    #[serde(default = "default_delete_depth")]
    pub delete_depth: usize,

    /// Connect attempts before giving up
    #[serde(default = "default_connect_retry")]
    pub connect_retry: u32,

    /// Connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Per-request timeout (seconds)
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,

    /// Await reclamation of superseded versions instead of spawning it
    #[serde(default)]
    pub unlink_wait: bool,

    /// Keys requested per range scan
    #[serde(default = "default_key_range_limit")]
    pub key_range_limit: usize,
}

fn default_disk_chunk_size() -> usize {
    DEFAULT_DISK_CHUNK_SIZE
}

fn default_write_depth() -> usize {
    2
}

fn default_delete_depth() -> usize {
    4
}

fn default_connect_retry() -> u32 {
    3
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_response_timeout() -> u64 {
    30
}

fn default_key_range_limit() -> usize {
    200
}

impl Default for DiskFileConfig {
    fn default() -> Self {
        Self {
            synchronization: Synchronization::Default,
            disk_chunk_size: DEFAULT_DISK_CHUNK_SIZE,
            write_depth: 2,
            delete_depth: 4,
            connect_retry: 3,
            connect_timeout: 3,
            response_timeout: 30,
            unlink_wait: false,
            key_range_limit: 200,
        }
    }
}

impl DiskFileConfig {
    /// Reject values that would stall or corrupt writes.
    pub fn validate(&self) -> Result<()> {
        if self.disk_chunk_size == 0 {
            return Err(Error::Config("disk_chunk_size must be positive".into()));
        }
        if self.write_depth == 0 || self.delete_depth == 0 {
            return Err(Error::Config(
                "write_depth and delete_depth must be positive".into(),
            ));
        }
        if self.key_range_limit == 0 {
            return Err(Error::Config("key_range_limit must be positive".into()));
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

// =============================================================================
// Manager
// =============================================================================

/// Hands out [`DiskFile`] handles for replicated policies.
pub struct DiskFileManager {
    config: Arc<DiskFileConfig>,
    hash: HashConfig,
    connector: Arc<dyn Connector>,
}

impl DiskFileManager {
    pub fn new(
        config: DiskFileConfig,
        hash: HashConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            hash,
            connector,
        })
    }

    pub fn config(&self) -> &DiskFileConfig {
        &self.config
    }

    /// Hashpath of an object name under this cluster's salts.
    pub fn hash_path(&self, account: &str, container: &str, object: &str) -> String {
        hash_path(
            &self.hash.path_prefix,
            &self.hash.path_suffix,
            account,
            container,
            object,
        )
    }

    /// Handle for one object on one device. No I/O happens until the handle
    /// is used.
    #[allow(clippy::too_many_arguments)]
    pub fn get_diskfile(
        &self,
        device: &DeviceId,
        partition: u32,
        account: &str,
        container: &str,
        object: &str,
        policy: &StoragePolicy,
        chunk_size: Option<usize>,
    ) -> Result<DiskFile> {
        if policy.policy_type != PolicyType::Replication {
            return Err(Error::UnsupportedPolicy {
                policy: policy.name.clone(),
                reason: "only replicated policies are stored by this backend".into(),
            });
        }
        let chunk_size = chunk_size.unwrap_or(self.config.disk_chunk_size);
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".into()));
        }
        Ok(DiskFile::new(
            device.clone(),
            partition,
            policy.index,
            self.hash_path(account, container, object),
            chunk_size,
            self.config.clone(),
            self.connector.clone(),
        ))
    }
}

impl std::fmt::Debug for DiskFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileManager")
            .field("config", &self.config)
            .finish()
    }
}

/// Picks the diskfile manager for a policy type.
pub struct DiskFileRouter {
    replicated: Arc<DiskFileManager>,
}

impl DiskFileRouter {
    pub fn new(replicated: Arc<DiskFileManager>) -> Self {
        Self { replicated }
    }

    pub fn manager_for(&self, policy: &StoragePolicy) -> Result<Arc<DiskFileManager>> {
        match policy.policy_type {
            PolicyType::Replication => Ok(self.replicated.clone()),
            PolicyType::ErasureCoding => Err(Error::UnsupportedPolicy {
                policy: policy.name.clone(),
                reason: "erasure-coded objects are not supported".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryConnector, StaticRing};
    use assert_matches::assert_matches;

    fn policy(policy_type: PolicyType) -> StoragePolicy {
        let ring = StaticRing::balanced(vec!["a:1".into()], 0, 1).unwrap();
        StoragePolicy::new(0, "p", policy_type, Arc::new(ring))
    }

    fn manager(config: DiskFileConfig) -> Result<DiskFileManager> {
        let connector = InMemoryConnector::new(InMemoryCluster::with_devices(["a:1"]));
        DiskFileManager::new(config, HashConfig::default(), Arc::new(connector))
    }

    #[test]
    fn test_manager_config_from_yaml() {
        let yaml = r#"
connect_retry: 6
connect_timeout: 10
response_timeout: 90
write_depth: 2
delete_depth: 4
disk_chunk_size: 1048576
synchronization: flush
"#;
        let config: DiskFileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connect_retry, 6);
        assert_eq!(config.disk_chunk_size, 1 << 20);
        assert_eq!(config.synchronization, Synchronization::Flush);
        let settings = config.connect_settings();
        assert_eq!(settings.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.response_timeout, Duration::from_secs(90));

        let mgr = manager(config).unwrap();
        let df = mgr
            .get_diskfile(&"a:1".into(), 0, "a", "c", "o", &policy(PolicyType::Replication), None)
            .unwrap();
        assert_eq!(df.chunk_size(), 1 << 20);
        assert_eq!(df.hashpath(), mgr.hash_path("a", "c", "o"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DiskFileConfig {
            disk_chunk_size: 0,
            ..Default::default()
        };
        assert_matches!(manager(config), Err(Error::Config(_)));
        let config = DiskFileConfig {
            write_depth: 0,
            ..Default::default()
        };
        assert_matches!(manager(config), Err(Error::Config(_)));
    }

    #[test]
    fn test_router_dispatches_by_policy_type() {
        let router = DiskFileRouter::new(Arc::new(manager(DiskFileConfig::default()).unwrap()));
        assert!(router.manager_for(&policy(PolicyType::Replication)).is_ok());
        assert_matches!(
            router.manager_for(&policy(PolicyType::ErasureCoding)),
            Err(Error::UnsupportedPolicy { .. })
        );

        let mgr = manager(DiskFileConfig::default()).unwrap();
        assert_matches!(
            mgr.get_diskfile(&"a:1".into(), 0, "a", "c", "o", &policy(PolicyType::ErasureCoding), None),
            Err(Error::UnsupportedPolicy { .. })
        );
    }
}
