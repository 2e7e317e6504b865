//! Per-device replication pass.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::pool::ConnectionPool;
use super::{ReplicationMode, ReplicatorConfig};
use crate::diskfile::keyset::{delete_versions, object_key_set};
use crate::domain::keys::{hashpath_partition, key_range_for_prefix, parse_key, ObjectKey, Timestamp};
use crate::domain::policy::StoragePolicy;
use crate::domain::ports::{DeviceConnection, DeviceId, KeyRange};
use crate::error::{Error, Result};

// =============================================================================
// Outcomes
// =============================================================================

/// Result of syncing one object to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    /// Target already held an equal or newer version.
    Satisfied,
    /// Key set was transferred.
    Transferred,
    /// Target is still missing the object.
    Failed(String),
}

impl TargetOutcome {
    /// Target ends the pass holding the object.
    pub fn is_satisfied(&self) -> bool {
        !matches!(self, TargetOutcome::Failed(_))
    }
}

/// Result of replicating one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOutcome {
    pub key: ObjectKey,
    pub targets: Vec<(DeviceId, TargetOutcome)>,
    pub deleted_locally: bool,
}

impl ObjectOutcome {
    /// Every target holds the object. False when there are no targets.
    pub fn all_satisfied(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|(_, o)| o.is_satisfied())
    }

    pub fn transfers(&self) -> u64 {
        self.count(|o| matches!(o, TargetOutcome::Transferred))
    }

    pub fn failures(&self) -> u64 {
        self.count(|o| matches!(o, TargetOutcome::Failed(_)))
    }

    fn count(&self, pred: impl Fn(&TargetOutcome) -> bool) -> u64 {
        self.targets.iter().filter(|(_, o)| pred(o)).count() as u64
    }
}

/// Counters for one device pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub objects_seen: u64,
    pub transfers: u64,
    pub transfer_failures: u64,
    pub handoffs_removed: u64,
    pub stale_reclaimed: u64,
    pub malformed_keys: u64,
}

impl PassStats {
    fn record(&mut self, outcome: &ObjectOutcome) {
        self.transfers += outcome.transfers();
        self.transfer_failures += outcome.failures();
        if outcome.deleted_locally {
            self.handoffs_removed += 1;
        }
    }

    pub fn merge(&mut self, other: &PassStats) {
        self.objects_seen += other.objects_seen;
        self.transfers += other.transfers;
        self.transfer_failures += other.transfer_failures;
        self.handoffs_removed += other.handoffs_removed;
        self.stale_reclaimed += other.stale_reclaimed;
        self.malformed_keys += other.malformed_keys;
    }
}

// =============================================================================
// Key cursor
// =============================================================================

/// Paged scan over a key range.
///
/// Each page resumes strictly after the last key of the previous one, so a
/// cursor never holds more than one page and tolerates deletes behind it.
pub struct KeyCursor {
    conn: Arc<dyn DeviceConnection>,
    range: KeyRange,
    exhausted: bool,
}

impl KeyCursor {
    pub fn new(conn: Arc<dyn DeviceConnection>, range: KeyRange) -> Self {
        Self {
            conn,
            range,
            exhausted: false,
        }
    }

    /// Next page of keys; empty once the range is exhausted.
    pub async fn next_page(&mut self) -> Result<Vec<String>> {
        if self.exhausted {
            return Ok(Vec::new());
        }
        let page = self.conn.get_key_range(&self.range).await?;
        match page.last() {
            Some(last) => self.range = self.range.after(last.clone()),
            None => self.exhausted = true,
        }
        Ok(page)
    }
}

// =============================================================================
// Currency check
// =============================================================================

/// Whether `target` already holds `key`'s version or a newer one of the
/// same hashpath.
pub async fn is_present_and_current(target: &dyn DeviceConnection, key: &ObjectKey) -> Result<bool> {
    let Some(entry) = target.get_previous(&key.latest_lookup_key()).await? else {
        return Ok(false);
    };
    Ok(match parse_key(&entry.key) {
        Ok(found) => {
            found.policy_index == key.policy_index
                && found.hashpath == key.hashpath
                && found.timestamp >= key.timestamp
        }
        Err(_) => false,
    })
}

// =============================================================================
// Replicator port
// =============================================================================

/// Replication strategy for one storage policy type.
#[async_trait]
pub trait ObjectReplicator: Send + Sync {
    /// Cursor over the head keys of `policy` resident on the device.
    fn enumerate(&self, conn: Arc<dyn DeviceConnection>, policy: &StoragePolicy) -> KeyCursor;

    /// Ordered devices that should hold `key`.
    fn resolve_targets(&self, key: &ObjectKey, policy: &StoragePolicy) -> Result<Vec<DeviceId>>;

    /// Sync `key` to each target, then drop the local copy if it is a
    /// handoff and every target is satisfied.
    async fn replicate_one(
        &self,
        conn: &dyn DeviceConnection,
        key: &ObjectKey,
        targets: &[DeviceId],
        is_handoff: bool,
    ) -> Result<ObjectOutcome>;

    /// One full pass over a device.
    async fn replicate_device(
        &self,
        device: &DeviceId,
        conn: Arc<dyn DeviceConnection>,
        policy: &StoragePolicy,
    ) -> Result<PassStats>;
}

// =============================================================================
// Kinetic replicator
// =============================================================================

/// Replicator for whole-object (replicated) policies.
pub struct KineticReplicator {
    config: ReplicatorConfig,
    pool: Arc<ConnectionPool>,
}

impl KineticReplicator {
    pub fn new(config: ReplicatorConfig, pool: Arc<ConnectionPool>) -> Self {
        Self { config, pool }
    }

    async fn sync_target(
        &self,
        conn: &dyn DeviceConnection,
        key: &ObjectKey,
        target: &DeviceId,
        key_set: &mut Option<Vec<String>>,
    ) -> Result<TargetOutcome> {
        let target_conn = self.pool.acquire(target).await?;
        if is_present_and_current(target_conn.as_ref(), key).await? {
            return Ok(TargetOutcome::Satisfied);
        }
        if key_set.is_none() {
            *key_set = Some(object_key_set(conn, key, self.config.key_range_limit).await?);
        }
        let keys = key_set.as_deref().unwrap_or_default();
        match self.config.replication_mode {
            ReplicationMode::Push => conn.push_keys(target, keys).await?,
            ReplicationMode::Copy => conn.copy_keys(target, keys).await?,
        }
        Ok(TargetOutcome::Transferred)
    }

    async fn remove_handoff(
        &self,
        conn: &dyn DeviceConnection,
        key: &ObjectKey,
        key_set: Option<Vec<String>>,
    ) -> Result<usize> {
        let keys = match key_set {
            Some(keys) => keys,
            None => object_key_set(conn, key, self.config.key_range_limit).await?,
        };
        conn.delete_keys(&keys).await?;
        Ok(keys.len())
    }

    fn is_expired_tombstone(&self, key: &ObjectKey, now: Timestamp) -> bool {
        key.is_tombstone() && key.timestamp.offset(self.config.reclaim_age as f64) < now
    }

    /// Delete whole key sets of versions that need no replication.
    async fn reclaim(&self, conn: &dyn DeviceConnection, keys: Vec<ObjectKey>) -> u64 {
        let count = keys.len() as u64;
        match delete_versions(conn, keys, 1, self.config.key_range_limit).await {
            Ok(_) => count,
            Err(e) => {
                warn!(device = %conn.device(), error = %e, "Failed to reclaim stale versions");
                0
            }
        }
    }

    /// Replicate the newest local version of one hashpath.
    async fn process_current(
        &self,
        device: &DeviceId,
        conn: &dyn DeviceConnection,
        key: ObjectKey,
        policy: &StoragePolicy,
        now: Timestamp,
        stats: &mut PassStats,
    ) -> Result<()> {
        if self.is_expired_tombstone(&key, now) {
            debug!(key = %key, "Reclaiming expired tombstone");
            stats.stale_reclaimed += self.reclaim(conn, vec![key]).await;
            return Ok(());
        }

        let targets = self.resolve_targets(&key, policy)?;
        let is_handoff = !targets.contains(device);
        let peers: Vec<DeviceId> = targets.into_iter().filter(|t| t != device).collect();
        let outcome = self.replicate_one(conn, &key, &peers, is_handoff).await?;
        stats.record(&outcome);
        Ok(())
    }
}

#[async_trait]
impl ObjectReplicator for KineticReplicator {
    fn enumerate(&self, conn: Arc<dyn DeviceConnection>, policy: &StoragePolicy) -> KeyCursor {
        let (start, end) = key_range_for_prefix(&policy.key_namespace());
        KeyCursor::new(conn, KeyRange::new(start, end, self.config.key_range_limit))
    }

    fn resolve_targets(&self, key: &ObjectKey, policy: &StoragePolicy) -> Result<Vec<DeviceId>> {
        let partition = hashpath_partition(&key.hashpath, policy.ring.part_shift())?;
        Ok(policy.ring.get_part_nodes(partition))
    }

    #[instrument(skip(self, conn, targets), fields(device = %conn.device(), key = %key))]
    async fn replicate_one(
        &self,
        conn: &dyn DeviceConnection,
        key: &ObjectKey,
        targets: &[DeviceId],
        is_handoff: bool,
    ) -> Result<ObjectOutcome> {
        let mut key_set: Option<Vec<String>> = None;
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let outcome = match self.sync_target(conn, key, target, &mut key_set).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(key = %key, target = %target, error = %e, "Failed to replicate object");
                    TargetOutcome::Failed(e.to_string())
                }
            };
            if outcome == TargetOutcome::Transferred {
                debug!(key = %key, target = %target, "Transferred object");
            }
            results.push((target.clone(), outcome));
        }

        let mut outcome = ObjectOutcome {
            key: key.clone(),
            targets: results,
            deleted_locally: false,
        };
        if is_handoff && outcome.all_satisfied() {
            match self.remove_handoff(conn, key, key_set).await {
                Ok(removed) => {
                    outcome.deleted_locally = true;
                    debug!(key = %key, keys = removed, "Removed handoff copy");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to remove handoff copy, retaining it");
                }
            }
        }
        Ok(outcome)
    }

    #[instrument(skip(self, conn, policy), fields(device = %device, policy = %policy.name))]
    async fn replicate_device(
        &self,
        device: &DeviceId,
        conn: Arc<dyn DeviceConnection>,
        policy: &StoragePolicy,
    ) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let mut cursor = self.enumerate(conn.clone(), policy);
        let now = Timestamp::now();
        // newest-so-far key of the hashpath being scanned
        let mut pending: Option<ObjectKey> = None;

        loop {
            let page = cursor.next_page().await?;
            if page.is_empty() {
                break;
            }
            for raw in page {
                stats.objects_seen += 1;
                let key = match parse_key(&raw) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(key = %raw, error = %e, "Skipping malformed key");
                        stats.malformed_keys += 1;
                        continue;
                    }
                };
                match pending.take() {
                    // same hashpath sorts by timestamp, so the earlier key is stale
                    Some(prev) if prev.hashpath == key.hashpath => {
                        debug!(key = %prev, "Reclaiming superseded version");
                        stats.stale_reclaimed += self.reclaim(conn.as_ref(), vec![prev]).await;
                    }
                    Some(prev) => {
                        self.process_current(device, conn.as_ref(), prev, policy, now, &mut stats)
                            .await
                            .or_else(skip_malformed(&mut stats))?;
                    }
                    None => {}
                }
                pending = Some(key);
            }
        }
        if let Some(last) = pending {
            self.process_current(device, conn.as_ref(), last, policy, now, &mut stats)
                .await
                .or_else(skip_malformed(&mut stats))?;
        }

        info!(
            objects = stats.objects_seen,
            transfers = stats.transfers,
            failures = stats.transfer_failures,
            handoffs_removed = stats.handoffs_removed,
            reclaimed = stats.stale_reclaimed,
            "Device pass complete"
        );
        Ok(stats)
    }
}

/// A key whose hashpath cannot be placed only costs that key.
fn skip_malformed(stats: &mut PassStats) -> impl FnOnce(Error) -> Result<()> + '_ {
    move |e| match e {
        Error::MalformedKey { key, reason } => {
            warn!(key = %key, reason = %reason, "Skipping unplaceable key");
            stats.malformed_keys += 1;
            Ok(())
        }
        other => Err(other),
    }
}

impl std::fmt::Debug for KineticReplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KineticReplicator")
            .field("mode", &self.config.replication_mode)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryConnector, StaticRing};
    use crate::domain::keys::{HeadKind, Nonce};
    use crate::domain::policy::PolicyType;
    use crate::domain::ports::{ConnectSettings, Synchronization};
    use bytes::Bytes;

    fn key(hashpath: &str, secs: f64) -> ObjectKey {
        ObjectKey::new(0, hashpath, Timestamp::from_secs_f64(secs), HeadKind::Data, Nonce::generate(None))
    }

    async fn put_head(conn: &dyn DeviceConnection, key: &ObjectKey) {
        conn.put(&key.to_key(), Bytes::from_static(b"{}"), Synchronization::Default)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_present_and_current() {
        let cluster = InMemoryCluster::with_devices(["t:1"]);
        let target = cluster.connection(&"t:1".into()).unwrap();
        let source_key = key("aaaa0000", 100.0);

        // absent
        assert!(!is_present_and_current(&target, &source_key).await.unwrap());

        // different hashpath sorting just before ours
        put_head(&target, &key("9999ffff", 500.0)).await;
        assert!(!is_present_and_current(&target, &source_key).await.unwrap());

        // older
        put_head(&target, &key("aaaa0000", 50.0)).await;
        assert!(!is_present_and_current(&target, &source_key).await.unwrap());

        // equal
        put_head(&target, &key("aaaa0000", 100.0)).await;
        assert!(is_present_and_current(&target, &source_key).await.unwrap());

        // newer
        put_head(&target, &key("aaaa0000", 200.0)).await;
        assert!(is_present_and_current(&target, &source_key).await.unwrap());
    }

    #[tokio::test]
    async fn test_cursor_pages_until_empty() {
        let cluster = InMemoryCluster::new();
        cluster.add_device_with_limit("s:1", 2);
        let conn: Arc<dyn DeviceConnection> = Arc::new(cluster.connection(&"s:1".into()).unwrap());
        for i in 0..5 {
            put_head(conn.as_ref(), &key(&format!("{:08x}", i), 1.0)).await;
        }
        conn.put("objects-1.zzz", Bytes::new(), Synchronization::Default).await.unwrap();

        let pool = Arc::new(ConnectionPool::new(
            Arc::new(InMemoryConnector::new(cluster.clone())),
            ConnectSettings::default(),
            4,
        ));
        let replicator = KineticReplicator::new(
            ReplicatorConfig {
                key_range_limit: 2,
                ..Default::default()
            },
            pool,
        );
        let ring = StaticRing::balanced(vec!["s:1".into()], 0, 1).unwrap();
        let policy = StoragePolicy::new(0, "gold", PolicyType::Replication, Arc::new(ring));

        let mut cursor = replicator.enumerate(conn, &policy);
        let mut seen = Vec::new();
        loop {
            let page = cursor.next_page().await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            seen.extend(page);
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|k| k.starts_with("objects.")));
        assert!(cursor.next_page().await.unwrap().is_empty());
    }

    #[test]
    fn test_outcome_reduction() {
        let k = key("aaaa0000", 1.0);
        let outcome = ObjectOutcome {
            key: k.clone(),
            targets: vec![
                ("a:1".into(), TargetOutcome::Satisfied),
                ("b:1".into(), TargetOutcome::Transferred),
            ],
            deleted_locally: false,
        };
        assert!(outcome.all_satisfied());
        assert_eq!(outcome.transfers(), 1);

        let failed = ObjectOutcome {
            targets: vec![
                ("a:1".into(), TargetOutcome::Transferred),
                ("b:1".into(), TargetOutcome::Failed("boom".into())),
            ],
            ..outcome.clone()
        };
        assert!(!failed.all_satisfied());
        assert_eq!(failed.failures(), 1);

        let empty = ObjectOutcome {
            targets: Vec::new(),
            ..outcome
        };
        assert!(!empty.all_satisfied());
    }
}
