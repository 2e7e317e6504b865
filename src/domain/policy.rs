//! Storage policies and the rings they own.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::keys::policy_string;
use super::ports::{DeviceId, PlacementRing};
use crate::error::{Error, Result};

/// Object storage scheme of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Whole-object replicas.
    Replication,
    /// Erasure-coded fragments; not driven by this backend.
    ErasureCoding,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyType::Replication => write!(f, "replication"),
            PolicyType::ErasureCoding => write!(f, "erasure_coding"),
        }
    }
}

/// A named storage policy and its placement ring.
#[derive(Clone)]
pub struct StoragePolicy {
    pub index: u32,
    pub name: String,
    pub policy_type: PolicyType,
    pub ring: Arc<dyn PlacementRing>,
}

impl StoragePolicy {
    pub fn new(
        index: u32,
        name: impl Into<String>,
        policy_type: PolicyType,
        ring: Arc<dyn PlacementRing>,
    ) -> Self {
        Self {
            index,
            name: name.into(),
            policy_type,
            ring,
        }
    }

    /// Head key namespace of this policy (`objects`, `objects-1`, ...).
    pub fn key_namespace(&self) -> String {
        policy_string(self.index)
    }

    /// Every device in the policy's ring.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.ring.devices()
    }
}

impl std::fmt::Debug for StoragePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePolicy")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("policy_type", &self.policy_type)
            .finish()
    }
}

impl std::fmt::Display for StoragePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (index {}, {})", self.name, self.index, self.policy_type)
    }
}

/// The set of configured policies, ordered by index.
#[derive(Debug, Clone, Default)]
pub struct StoragePolicies {
    policies: Vec<StoragePolicy>,
}

impl StoragePolicies {
    pub fn new(mut policies: Vec<StoragePolicy>) -> Result<Self> {
        if policies.is_empty() {
            return Err(Error::Config("at least one storage policy is required".into()));
        }
        policies.sort_by_key(|p| p.index);
        if let Some(dup) = policies.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(Error::Config(format!(
                "duplicate storage policy index {}",
                dup[0].index
            )));
        }
        Ok(Self { policies })
    }

    pub fn get(&self, index: u32) -> Option<&StoragePolicy> {
        self.policies.iter().find(|p| p.index == index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoragePolicy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::StaticRing;

    fn ring() -> Arc<dyn PlacementRing> {
        Arc::new(StaticRing::balanced(vec!["a:1".into(), "b:1".into()], 2, 2).unwrap())
    }

    #[test]
    fn test_policies_sorted_and_unique() {
        let policies = StoragePolicies::new(vec![
            StoragePolicy::new(2, "ec", PolicyType::ErasureCoding, ring()),
            StoragePolicy::new(0, "gold", PolicyType::Replication, ring()),
        ])
        .unwrap();
        let indexes: Vec<u32> = policies.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![0, 2]);
        assert_eq!(policies.get(2).unwrap().key_namespace(), "objects-2");

        let dup = StoragePolicies::new(vec![
            StoragePolicy::new(1, "a", PolicyType::Replication, ring()),
            StoragePolicy::new(1, "b", PolicyType::Replication, ring()),
        ]);
        assert!(dup.is_err());
        assert!(StoragePolicies::new(vec![]).is_err());
    }
}
