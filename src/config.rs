//! Daemon configuration file.
//!
//! ```yaml
//! replicator:
//!   kinetic_replication_mode: push
//!   connect_timeout: 3
//!   max_connections: 10
//!   interval: 30
//! diskfile:
//!   synchronization: flush
//!   disk_chunk_size: 1048576
//! hash:
//!   path_prefix: ""
//!   path_suffix: changeme
//! policies:
//!   - index: 0
//!     name: gold
//!     policy_type: replication
//!     ring:
//!       part_power: 10
//!       replicas: 3
//!       devices: ["10.0.0.1:8123", "10.0.0.2:8123", "10.0.0.3:8123"]
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::adapters::StaticRing;
use crate::diskfile::DiskFileConfig;
use crate::domain::policy::{PolicyType, StoragePolicies, StoragePolicy};
use crate::domain::ports::DeviceId;
use crate::error::{Error, Result};
use crate::replicator::ReplicatorConfig;

/// Salts mixed into every hashpath.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConfig {
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub path_suffix: String,
}

/// Ring of one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_part_power")]
    pub part_power: u32,
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    pub devices: Vec<DeviceId>,
    /// Explicit `replica -> partition -> device index` table; spread
    /// round-robin when absent.
    #[serde(default)]
    pub assignment: Option<Vec<Vec<usize>>>,
}

fn default_part_power() -> u32 {
    10
}

fn default_replicas() -> usize {
    3
}

impl RingConfig {
    pub fn build(&self) -> Result<StaticRing> {
        match &self.assignment {
            Some(table) => {
                if table.len() != self.replicas {
                    return Err(Error::Config(format!(
                        "assignment has {} replica rows, ring declares {}",
                        table.len(),
                        self.replicas
                    )));
                }
                StaticRing::from_assignment(self.devices.clone(), self.part_power, table.clone())
            }
            None => StaticRing::balanced(self.devices.clone(), self.part_power, self.replicas),
        }
    }
}

/// One storage policy entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub index: u32,
    pub name: String,
    #[serde(default = "default_policy_type")]
    pub policy_type: PolicyType,
    pub ring: RingConfig,
}

fn default_policy_type() -> PolicyType {
    PolicyType::Replication
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub replicator: ReplicatorConfig,
    #[serde(default)]
    pub diskfile: DiskFileConfig,
    #[serde(default)]
    pub hash: HashConfig,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.replicator.validate()?;
        self.diskfile.validate()?;
        // builds every ring, which checks replicas against devices
        self.storage_policies().map(|_| ())
    }

    /// Policies with their rings built.
    pub fn storage_policies(&self) -> Result<StoragePolicies> {
        let policies = self
            .policies
            .iter()
            .map(|p| {
                let ring = p.ring.build().map_err(|e| {
                    Error::Config(format!("policy {} ({}): {}", p.index, p.name, e))
                })?;
                Ok(StoragePolicy::new(
                    p.index,
                    p.name.clone(),
                    p.policy_type,
                    Arc::new(ring),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        StoragePolicies::new(policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Synchronization;
    use crate::replicator::ReplicationMode;
    use assert_matches::assert_matches;

    const SAMPLE: &str = r#"
replicator:
  kinetic_replication_mode: copy
  connect_timeout: 5
  max_connections: 4
diskfile:
  synchronization: flush
  disk_chunk_size: 65536
  unlink_wait: true
hash:
  path_suffix: s3cr3t
policies:
  - index: 0
    name: gold
    ring:
      part_power: 4
      replicas: 2
      devices: ["10.0.0.1:8123", "10.0.0.2:8123", "10.0.0.3:8123"]
  - index: 1
    name: ec
    policy_type: erasure_coding
    ring:
      part_power: 0
      replicas: 1
      devices: ["10.0.0.4:8123"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.replicator.replication_mode, ReplicationMode::Copy);
        assert_eq!(config.replicator.connect_timeout, 5);
        assert_eq!(config.replicator.response_timeout, 30);
        assert_eq!(config.replicator.max_connections, 4);
        assert_eq!(config.diskfile.synchronization, Synchronization::Flush);
        assert_eq!(config.diskfile.disk_chunk_size, 65536);
        assert_eq!(config.diskfile.write_depth, 2);
        assert!(config.diskfile.unlink_wait);
        assert_eq!(config.hash.path_suffix, "s3cr3t");

        let policies = config.storage_policies().unwrap();
        assert_eq!(policies.len(), 2);
        assert_eq!(policies.get(1).unwrap().policy_type, PolicyType::ErasureCoding);
        assert_eq!(policies.get(0).unwrap().ring.part_shift(), 28);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.replicator.replication_mode, ReplicationMode::Push);
        assert_eq!(config.replicator.max_connections, 10);
        assert_eq!(config.replicator.connect_retry, 3);
        assert_eq!(config.replicator.interval, 30);
        assert_eq!(config.replicator.reclaim_age, 604_800);
        assert_eq!(config.diskfile.disk_chunk_size, 1 << 20);
        assert_eq!(config.diskfile.delete_depth, 4);
    }

    #[test]
    fn test_validation_failures() {
        // no policies
        assert_matches!(Config::from_yaml("replicator: {}"), Err(Error::Config(_)));

        let too_few_devices = r#"
policies:
  - index: 0
    name: gold
    ring: {part_power: 2, replicas: 3, devices: ["a:1", "b:1"]}
"#;
        assert_matches!(Config::from_yaml(too_few_devices), Err(Error::Config(_)));

        let duplicate = r#"
policies:
  - {index: 0, name: a, ring: {part_power: 0, replicas: 1, devices: ["a:1"]}}
  - {index: 0, name: b, ring: {part_power: 0, replicas: 1, devices: ["a:1"]}}
"#;
        assert_matches!(Config::from_yaml(duplicate), Err(Error::Config(_)));

        let zero_pool = r#"
replicator: {max_connections: 0}
policies:
  - {index: 0, name: a, ring: {part_power: 0, replicas: 1, devices: ["a:1"]}}
"#;
        assert_matches!(Config::from_yaml(zero_pool), Err(Error::Config(_)));

        assert_matches!(Config::from_yaml("policies: [1, 2"), Err(Error::Yaml(_)));
    }

    #[test]
    fn test_explicit_assignment() {
        let yaml = r#"
policies:
  - index: 0
    name: gold
    ring:
      part_power: 1
      replicas: 2
      devices: ["a:1", "b:1", "c:1"]
      assignment: [[0, 1], [2, 0]]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let policies = config.storage_policies().unwrap();
        let ring = &policies.get(0).unwrap().ring;
        assert_eq!(ring.get_part_nodes(1), vec![DeviceId::new("b:1"), DeviceId::new("a:1")]);
    }

    #[test]
    fn test_load_missing_file() {
        assert_matches!(
            Config::load("/nonexistent/kinetic/replicator.yaml"),
            Err(Error::Config(_))
        );
    }
}
