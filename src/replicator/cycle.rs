//! Replication cycle scheduler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::engine::{KineticReplicator, ObjectReplicator, PassStats};
use super::pool::ConnectionPool;
use super::ReplicatorConfig;
use crate::domain::policy::{PolicyType, StoragePolicies, StoragePolicy};
use crate::domain::ports::{Connector, DeviceId};
use crate::metrics;

/// Counters for the most recent cycle, reset when a cycle starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub devices_processed: u64,
    pub devices_failed: u64,
    pub objects_seen: u64,
    pub transfers: u64,
    pub transfer_failures: u64,
    pub handoffs_removed: u64,
    pub stale_reclaimed: u64,
}

impl CycleStats {
    fn absorb(&mut self, pass: &PassStats) {
        self.devices_processed += 1;
        self.objects_seen += pass.objects_seen;
        self.transfers += pass.transfers;
        self.transfer_failures += pass.transfer_failures;
        self.handoffs_removed += pass.handoffs_removed;
        self.stale_reclaimed += pass.stale_reclaimed;
    }
}

/// Drives replication cycles over every replicated policy.
pub struct Replicator {
    config: ReplicatorConfig,
    policies: StoragePolicies,
    connector: Arc<dyn Connector>,
    stats: RwLock<CycleStats>,
    ready: Arc<AtomicBool>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        policies: StoragePolicies,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            policies,
            connector,
            stats: RwLock::new(CycleStats::default()),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot of the current (or last finished) cycle's counters.
    pub fn stats(&self) -> CycleStats {
        self.stats.read().clone()
    }

    /// Set once the first cycle has finished.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// One engine per policy type this backend can replicate.
    fn engines(&self, pool: Arc<ConnectionPool>) -> HashMap<PolicyType, Arc<dyn ObjectReplicator>> {
        let mut engines: HashMap<PolicyType, Arc<dyn ObjectReplicator>> = HashMap::new();
        engines.insert(
            PolicyType::Replication,
            Arc::new(KineticReplicator::new(self.config.clone(), pool)),
        );
        engines
    }

    /// Run cycles every `config.interval` seconds until `shutdown` fires.
    pub async fn run(&self, override_devices: Option<Vec<DeviceId>>, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval,
            mode = %self.config.replication_mode,
            policies = self.policies.len(),
            "Starting replicator"
        );
        let mut tick = interval(Duration::from_secs(self.config.interval));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Replicator shutting down");
                    break;
                }
                _ = tick.tick() => {
                    let pool = self.new_pool();
                    let finished = tokio::select! {
                        _ = shutdown.cancelled() => None,
                        stats = self.cycle(&pool, override_devices.as_deref()) => Some(stats),
                    };
                    match finished {
                        Some(stats) => debug!(?stats, "Cycle finished"),
                        None => {
                            info!("Replicator shutting down mid-cycle");
                            pool.close_all().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    fn new_pool(&self) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            self.connector.clone(),
            self.config.connect_settings(),
            self.config.max_connections,
        ))
    }

    /// One full cycle. `override_devices` restricts every policy to the
    /// listed devices.
    pub async fn run_once(&self, override_devices: Option<&[DeviceId]>) -> CycleStats {
        let pool = self.new_pool();
        self.cycle(&pool, override_devices).await
    }

    /// Body of one cycle over `pool`. The pool is closed when the cycle
    /// completes; a caller that drops the future must close it instead.
    #[instrument(skip(self, pool, override_devices))]
    async fn cycle(
        &self,
        pool: &Arc<ConnectionPool>,
        override_devices: Option<&[DeviceId]>,
    ) -> CycleStats {
        let started = Instant::now();
        *self.stats.write() = CycleStats {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let engines = self.engines(pool.clone());

        for policy in self.policies.iter() {
            match engines.get(&policy.policy_type) {
                Some(engine) => {
                    self.replicate_policy(engine.as_ref(), pool, policy, override_devices)
                        .await
                }
                None => debug!(policy = %policy.name, policy_type = %policy.policy_type, "Skipping policy"),
            }
        }

        pool.close_all().await;

        let stats = {
            let mut stats = self.stats.write();
            stats.duration = Some(started.elapsed());
            stats.clone()
        };
        if let Some(m) = metrics::global() {
            m.record_cycle(&stats);
        }
        self.ready.store(true, Ordering::Release);
        info!(
            devices = stats.devices_processed,
            failed = stats.devices_failed,
            objects = stats.objects_seen,
            transfers = stats.transfers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replication cycle complete"
        );
        stats
    }

    /// Every device of one policy. Device failures are logged and counted,
    /// never propagated.
    async fn replicate_policy(
        &self,
        engine: &dyn ObjectReplicator,
        pool: &ConnectionPool,
        policy: &StoragePolicy,
        override_devices: Option<&[DeviceId]>,
    ) {
        let devices: Vec<DeviceId> = policy
            .devices()
            .into_iter()
            .filter(|d| override_devices.map_or(true, |only| only.contains(d)))
            .collect();
        debug!(policy = %policy.name, devices = devices.len(), "Replicating policy");

        for device in devices {
            let conn = match pool.acquire(&device).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(device = %device, policy = %policy.name, error = %e, "Skipping unreachable device");
                    self.device_failed(policy);
                    continue;
                }
            };
            match engine.replicate_device(&device, conn, policy).await {
                Ok(pass) => {
                    self.stats.write().absorb(&pass);
                    if let Some(m) = metrics::global() {
                        m.record_pass(&policy.name, &pass);
                    }
                }
                Err(e) if e.is_connection_refused() => {
                    warn!(device = %device, policy = %policy.name, error = %e, "Connection refused during device pass");
                    self.device_failed(policy);
                }
                Err(e) => {
                    error!(device = %device, policy = %policy.name, error = %e, "Device pass failed");
                    self.device_failed(policy);
                }
            }
        }
    }

    fn device_failed(&self, policy: &StoragePolicy) {
        self.stats.write().devices_failed += 1;
        if let Some(m) = metrics::global() {
            m.record_device_failure(&policy.name);
        }
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("config", &self.config)
            .field("policies", &self.policies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryConnector, StaticRing};
    use crate::domain::ports::{
        ConnectSettings, DeviceConnection, Entry, KeyRange, Synchronization,
    };
    use crate::error::Result;
    use async_trait::async_trait;
    use bytes::Bytes;

    /// Connector whose connections to `stalled` never answer a key scan.
    struct StallingConnector {
        inner: InMemoryConnector,
        stalled: DeviceId,
    }

    struct StallingConnection {
        inner: Arc<dyn DeviceConnection>,
        stall: bool,
    }

    #[async_trait]
    impl Connector for StallingConnector {
        async fn connect(
            &self,
            device: &DeviceId,
            settings: &ConnectSettings,
        ) -> Result<Arc<dyn DeviceConnection>> {
            let inner = self.inner.connect(device, settings).await?;
            Ok(Arc::new(StallingConnection {
                inner,
                stall: *device == self.stalled,
            }))
        }
    }

    #[async_trait]
    impl DeviceConnection for StallingConnection {
        fn device(&self) -> &DeviceId {
            self.inner.device()
        }
        async fn get(&self, key: &str) -> Result<Option<Entry>> {
            self.inner.get(key).await
        }
        async fn get_key_range(&self, range: &KeyRange) -> Result<Vec<String>> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.inner.get_key_range(range).await
        }
        async fn get_previous(&self, key: &str) -> Result<Option<Entry>> {
            self.inner.get_previous(key).await
        }
        async fn put(&self, key: &str, value: Bytes, sync: Synchronization) -> Result<()> {
            self.inner.put(key, value, sync).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn delete_keys(&self, keys: &[String]) -> Result<()> {
            self.inner.delete_keys(keys).await
        }
        async fn push_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
            self.inner.push_keys(target, keys).await
        }
        async fn copy_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
            self.inner.copy_keys(target, keys).await
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn replicator(cluster: &InMemoryCluster) -> Replicator {
        let devices = cluster.device_ids();
        let ring = StaticRing::balanced(devices, 0, 2).unwrap();
        let policy = StoragePolicy::new(0, "gold", PolicyType::Replication, Arc::new(ring));
        Replicator::new(
            ReplicatorConfig {
                interval: 1,
                ..Default::default()
            },
            StoragePolicies::new(vec![policy]).unwrap(),
            Arc::new(InMemoryConnector::new(cluster.clone())),
        )
    }

    #[test]
    fn test_absorb_counts_device() {
        let mut stats = CycleStats::default();
        stats.absorb(&PassStats {
            objects_seen: 3,
            transfers: 2,
            stale_reclaimed: 1,
            ..Default::default()
        });
        assert_eq!(stats.devices_processed, 1);
        assert_eq!(stats.objects_seen, 3);
        assert_eq!(stats.transfers, 2);
        assert_eq!(stats.stale_reclaimed, 1);
    }

    #[tokio::test]
    async fn test_ready_after_first_cycle() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let replicator = replicator(&cluster);
        let ready = replicator.ready_flag();
        assert!(!ready.load(Ordering::Acquire));
        assert_eq!(replicator.stats(), CycleStats::default());

        let stats = replicator.run_once(None).await;
        assert!(ready.load(Ordering::Acquire));
        assert_eq!(stats.devices_processed, 2);
        assert_eq!(stats.devices_failed, 0);

        // connections never outlive the cycle
        for id in cluster.device_ids() {
            let device = cluster.device(&id).unwrap();
            assert_eq!(device.stats().connects, device.stats().closes);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let replicator = replicator(&cluster);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), replicator.run(None, shutdown))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_mid_cycle_closes_connections() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let ring = StaticRing::balanced(cluster.device_ids(), 0, 2).unwrap();
        let policy = StoragePolicy::new(0, "gold", PolicyType::Replication, Arc::new(ring));
        let stalled = DeviceId::new("b:1");
        let replicator = Replicator::new(
            ReplicatorConfig {
                interval: 1,
                ..Default::default()
            },
            StoragePolicies::new(vec![policy]).unwrap(),
            Arc::new(StallingConnector {
                inner: InMemoryConnector::new(cluster.clone()),
                stalled: stalled.clone(),
            }),
        );

        let shutdown = CancellationToken::new();
        let cancel = {
            let shutdown = shutdown.clone();
            let cluster = cluster.clone();
            let stalled = stalled.clone();
            async move {
                // wait until the cycle is stuck scanning the stalled device
                while cluster.device(&stalled).unwrap().stats().connects == 0 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                shutdown.cancel();
            }
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(replicator.run(None, shutdown.clone()), cancel)
        })
        .await
        .unwrap();

        assert!(!replicator.ready_flag().load(Ordering::Acquire));
        let device = cluster.device(&stalled).unwrap();
        assert_eq!(device.stats().connects, 1);
        assert_eq!(device.stats().closes, 1);
        for id in cluster.device_ids() {
            let device = cluster.device(&id).unwrap();
            assert_eq!(device.stats().connects, device.stats().closes);
        }
    }

    #[tokio::test]
    async fn test_override_outside_policy_ignored() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let replicator = replicator(&cluster);
        let stats = replicator
            .run_once(Some(&[DeviceId::new("a:1"), DeviceId::new("zz:9")]))
            .await;
        // zz:9 is not in the policy, so only a:1 is scanned
        assert_eq!(stats.devices_processed, 1);
        assert_eq!(stats.devices_failed, 0);
    }
}
