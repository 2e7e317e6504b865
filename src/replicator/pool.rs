//! Bounded LRU cache of device connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::ports::{ConnectSettings, Connector, DeviceConnection, DeviceId};
use crate::error::Result;

struct PoolEntry {
    conn: Arc<dyn DeviceConnection>,
    last_used: u64,
}

impl PoolEntry {
    /// Handed out and not yet dropped by the borrower.
    fn in_use(&self) -> bool {
        Arc::strong_count(&self.conn) > 1
    }
}

/// One connection per device, at most `capacity` of them.
///
/// Owned by a single replication cycle and closed with it. The lock is
/// never held across an await.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    settings: ConnectSettings,
    capacity: usize,
    entries: Mutex<HashMap<DeviceId, PoolEntry>>,
    clock: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: ConnectSettings, capacity: usize) -> Self {
        Self {
            connector,
            settings,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.entries.lock().contains_key(device)
    }

    /// Cached connection for `device`, opening one if needed.
    pub async fn acquire(&self, device: &DeviceId) -> Result<Arc<dyn DeviceConnection>> {
        if let Some(conn) = self.touch(device) {
            return Ok(conn);
        }

        let conn = self.connector.connect(device, &self.settings).await?;

        let (conn, evicted) = {
            let mut entries = self.entries.lock();
            if let Some(existing) = entries.get_mut(device) {
                // lost a race with another acquire for the same device
                existing.last_used = self.tick();
                (existing.conn.clone(), vec![conn])
            } else {
                let evicted = Self::shrink_to(&mut entries, self.capacity - 1);
                entries.insert(
                    device.clone(),
                    PoolEntry {
                        conn: conn.clone(),
                        last_used: self.tick(),
                    },
                );
                (conn, evicted)
            }
        };
        debug!(device = %device, evicted = evicted.len(), "Opened device connection");
        Self::close_quietly(evicted).await;
        Ok(conn)
    }

    fn touch(&self, device: &DeviceId) -> Option<Arc<dyn DeviceConnection>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(device)?;
        entry.last_used = self.tick();
        Some(entry.conn.clone())
    }

    /// Idle entries go first, then least recently used.
    fn pick_victim(entries: &HashMap<DeviceId, PoolEntry>) -> Option<DeviceId> {
        entries
            .iter()
            .min_by_key(|(_, e)| (e.in_use(), e.last_used))
            .map(|(id, _)| id.clone())
    }

    /// Remove entries until at most `keep` remain and return the idle ones
    /// for closing. A connection still held by a caller is only forgotten;
    /// the last holder's drop releases it.
    fn shrink_to(
        entries: &mut HashMap<DeviceId, PoolEntry>,
        keep: usize,
    ) -> Vec<Arc<dyn DeviceConnection>> {
        let mut idle = Vec::new();
        while entries.len() > keep {
            let Some(victim) = Self::pick_victim(entries) else {
                break;
            };
            if let Some(entry) = entries.remove(&victim) {
                if entry.in_use() {
                    debug!(device = %victim, "Releasing in-use connection without closing");
                } else {
                    idle.push(entry.conn);
                }
            }
        }
        idle
    }

    /// Close and drop entries beyond capacity, least recently used first.
    pub async fn evict_oldest(&self) -> usize {
        let (evicted, count) = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            let evicted = Self::shrink_to(&mut entries, self.capacity);
            (evicted, before - entries.len())
        };
        Self::close_quietly(evicted).await;
        count
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let all: Vec<_> = self.entries.lock().drain().map(|(_, e)| e.conn).collect();
        Self::close_quietly(all).await;
    }

    async fn close_quietly(conns: Vec<Arc<dyn DeviceConnection>>) {
        for conn in conns {
            if let Err(e) = conn.close().await {
                warn!(device = %conn.device(), error = %e, "Failed to close connection");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Fault, InMemoryCluster, InMemoryConnector};
    use assert_matches::assert_matches;

    fn pool(cluster: &InMemoryCluster, capacity: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(InMemoryConnector::new(cluster.clone())),
            ConnectSettings::default(),
            capacity,
        )
    }

    #[tokio::test]
    async fn test_acquire_reuses_connection() {
        let cluster = InMemoryCluster::with_devices(["a:1"]);
        let pool = pool(&cluster, 10);
        let first = pool.acquire(&"a:1".into()).await.unwrap();
        let second = pool.acquire(&"a:1".into()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
        assert_eq!(cluster.device(&"a:1".into()).unwrap().stats().connects, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_closes_oldest() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1", "c:1"]);
        let pool = pool(&cluster, 2);
        drop(pool.acquire(&"a:1".into()).await.unwrap());
        drop(pool.acquire(&"b:1".into()).await.unwrap());
        // refresh a so b becomes the oldest
        drop(pool.acquire(&"a:1".into()).await.unwrap());
        drop(pool.acquire(&"c:1".into()).await.unwrap());

        assert_eq!(pool.len(), 2);
        assert!(pool.contains(&"a:1".into()));
        assert!(!pool.contains(&"b:1".into()));
        assert!(pool.contains(&"c:1".into()));
        assert_eq!(cluster.device(&"b:1".into()).unwrap().stats().closes, 1);
    }

    #[tokio::test]
    async fn test_in_use_connections_evicted_last() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1", "c:1"]);
        let pool = pool(&cluster, 2);
        let held = pool.acquire(&"a:1".into()).await.unwrap();
        drop(pool.acquire(&"b:1".into()).await.unwrap());
        drop(pool.acquire(&"c:1".into()).await.unwrap());

        assert!(pool.contains(&"a:1".into()));
        assert!(!pool.contains(&"b:1".into()));
        assert!(held.get("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_in_use_connection_never_closed_by_eviction() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let pool = pool(&cluster, 1);
        let source = pool.acquire(&"a:1".into()).await.unwrap();
        let target = pool.acquire(&"b:1".into()).await.unwrap();

        assert!(!pool.contains(&"a:1".into()));
        assert!(pool.contains(&"b:1".into()));
        assert_eq!(cluster.device(&"a:1".into()).unwrap().stats().closes, 0);
        assert!(source.get("x").await.is_ok());
        assert!(target.get("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_not_cached() {
        let cluster = InMemoryCluster::with_devices(["a:1"]);
        cluster.device(&"a:1".into()).unwrap().set_fault(Some(Fault::RefuseConnect));
        let pool = pool(&cluster, 2);
        let err = pool.acquire(&"a:1".into()).await.err().unwrap();
        assert!(err.is_connection_refused());
        assert!(pool.is_empty());

        assert_matches!(pool.acquire(&"missing:1".into()).await, Err(_));
    }

    #[tokio::test]
    async fn test_close_all() {
        let cluster = InMemoryCluster::with_devices(["a:1", "b:1"]);
        let pool = pool(&cluster, 4);
        drop(pool.acquire(&"a:1".into()).await.unwrap());
        drop(pool.acquire(&"b:1".into()).await.unwrap());
        assert_eq!(pool.evict_oldest().await, 0);
        pool.close_all().await;
        assert!(pool.is_empty());
        for id in ["a:1", "b:1"] {
            assert_eq!(cluster.device(&id.into()).unwrap().stats().closes, 1);
        }
    }
}
