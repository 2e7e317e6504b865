//! In-Memory Device Adapter
//!
//! Implements the `DeviceConnection` and `Connector` ports over an ordered
//! in-process key space. Devices are registered in an [`InMemoryCluster`] so
//! that push/copy can move records between them the way drives do
//! peer-to-peer. Faults can be injected per device for testing.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::domain::ports::{
    ConnectSettings, Connector, DeviceConnection, DeviceId, Entry, KeyRange, Synchronization,
};
use crate::error::{Error, Result};

/// Range scan cap, matching what kinetic drives return per request.
pub const DEFAULT_MAX_KEY_RANGE: usize = 200;

/// Injected device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connects and requests fail as if the host were down.
    Unreachable,
    /// Connects are refused.
    RefuseConnect,
    /// Connects succeed, every request is refused.
    RefuseRequests,
    /// Everything works except deletes, which fail.
    RejectDeletes,
}

/// Operation counters of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub keys: u64,
    pub puts: u64,
    pub deletes: u64,
    /// Push/copy requests this device served as source.
    pub transfers_out: u64,
    pub connects: u64,
    pub closes: u64,
}

/// One emulated key-value device.
pub struct InMemoryDevice {
    id: DeviceId,
    store: RwLock<BTreeMap<String, Bytes>>,
    write_log: Mutex<Vec<(String, Synchronization)>>,
    fault: Mutex<Option<Fault>>,
    failing_targets: Mutex<HashSet<DeviceId>>,
    max_key_range: usize,
    puts: AtomicU64,
    deletes: AtomicU64,
    transfers_out: AtomicU64,
    connects: AtomicU64,
    closes: AtomicU64,
}

impl InMemoryDevice {
    fn new(id: DeviceId, max_key_range: usize) -> Self {
        Self {
            id,
            store: RwLock::new(BTreeMap::new()),
            write_log: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
            failing_targets: Mutex::new(HashSet::new()),
            max_key_range,
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            transfers_out: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Inject (or clear) a fault.
    pub fn set_fault(&self, fault: Option<Fault>) {
        *self.fault.lock() = fault;
    }

    pub fn fault(&self) -> Option<Fault> {
        *self.fault.lock()
    }

    /// Make every push/copy from this device to `target` fail.
    pub fn fail_transfers_to(&self, target: &DeviceId) {
        self.failing_targets.lock().insert(target.clone());
    }

    pub fn clear_failing_transfers(&self) {
        self.failing_targets.lock().clear();
    }

    /// All keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.store.read().keys().cloned().collect()
    }

    /// Keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.store
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.store.read().get(key).cloned()
    }

    /// Write a record directly, bypassing faults and the write log.
    pub fn insert(&self, key: impl Into<String>, value: Bytes) {
        self.store.write().insert(key.into(), value);
    }

    /// Every put seen so far with its durability tier.
    pub fn write_log(&self) -> Vec<(String, Synchronization)> {
        self.write_log.lock().clone()
    }

    pub fn clear_write_log(&self) {
        self.write_log.lock().clear();
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            keys: self.store.read().len() as u64,
            puts: self.puts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            transfers_out: self.transfers_out.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }

    fn check_request(&self) -> Result<()> {
        match self.fault() {
            Some(Fault::Unreachable) => Err(Error::Connection {
                device: self.id.to_string(),
                message: "device unreachable".to_string(),
            }),
            Some(Fault::RefuseRequests) | Some(Fault::RefuseConnect) => {
                Err(Error::ConnectionRefused {
                    device: self.id.to_string(),
                })
            }
            Some(Fault::RejectDeletes) | None => Ok(()),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.check_request()?;
        Ok(self.store.read().get(key).map(|value| Entry {
            key: key.to_string(),
            value: value.clone(),
        }))
    }

    fn get_key_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        self.check_request()?;
        let limit = range.max_returned.min(self.max_key_range);
        if range.start >= range.end {
            return Ok(Vec::new());
        }
        Ok(self
            .store
            .read()
            .range(range.start.clone()..range.end.clone())
            .map(|(k, _)| k)
            .filter(|k| range.contains(k))
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_previous(&self, key: &str) -> Result<Option<Entry>> {
        self.check_request()?;
        Ok(self
            .store
            .read()
            .range(..=key.to_string())
            .next_back()
            .map(|(k, v)| Entry {
                key: k.clone(),
                value: v.clone(),
            }))
    }

    fn put(&self, key: &str, value: Bytes, sync: Synchronization) -> Result<()> {
        self.check_request()?;
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.write_log.lock().push((key.to_string(), sync));
        self.store.write().insert(key.to_string(), value);
        Ok(())
    }

    fn delete_keys(&self, keys: &[String]) -> Result<()> {
        self.check_request()?;
        if self.fault() == Some(Fault::RejectDeletes) {
            return Err(Error::Device {
                device: self.id.to_string(),
                message: "delete rejected".to_string(),
            });
        }
        let mut store = self.store.write();
        for key in keys {
            if store.remove(key).is_some() {
                self.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn snapshot(&self, keys: &[String]) -> Vec<(String, Bytes)> {
        let store = self.store.read();
        keys.iter()
            .filter_map(|k| store.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

impl std::fmt::Debug for InMemoryDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDevice")
            .field("id", &self.id)
            .field("keys", &self.store.read().len())
            .field("fault", &self.fault())
            .finish()
    }
}

/// Registry of emulated devices reachable from one another.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    devices: Arc<DashMap<DeviceId, Arc<InMemoryDevice>>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster with one device per id.
    pub fn with_devices<I, D>(ids: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        let cluster = Self::new();
        for id in ids {
            cluster.add_device(id);
        }
        cluster
    }

    /// Register a device with the default range scan cap.
    pub fn add_device(&self, id: impl Into<DeviceId>) -> Arc<InMemoryDevice> {
        self.add_device_with_limit(id, DEFAULT_MAX_KEY_RANGE)
    }

    /// Register a device that returns at most `max_key_range` keys per scan.
    pub fn add_device_with_limit(
        &self,
        id: impl Into<DeviceId>,
        max_key_range: usize,
    ) -> Arc<InMemoryDevice> {
        let id = id.into();
        self.devices
            .entry(id.clone())
            .or_insert_with(|| Arc::new(InMemoryDevice::new(id, max_key_range.max(1))))
            .clone()
    }

    pub fn device(&self, id: &DeviceId) -> Option<Arc<InMemoryDevice>> {
        self.devices.get(id).map(|d| d.clone())
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.devices.iter().map(|d| d.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Open a connection without going through a [`Connector`].
    pub fn connection(&self, id: &DeviceId) -> Result<InMemoryConnection> {
        let device = self.device(id).ok_or_else(|| Error::Connection {
            device: id.to_string(),
            message: "no such device".to_string(),
        })?;
        Ok(InMemoryConnection {
            device,
            cluster: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn transfer(&self, source: &InMemoryDevice, target: &DeviceId, keys: &[String]) -> Result<()> {
        source.check_request()?;
        let transfer_err = |message: &str| Error::Transfer {
            key: keys.first().cloned().unwrap_or_default(),
            target: target.to_string(),
            message: message.to_string(),
        };
        if source.failing_targets.lock().contains(target) {
            return Err(transfer_err("peer rejected transfer"));
        }
        let dest = self
            .device(target)
            .ok_or_else(|| transfer_err("unknown peer device"))?;
        if dest.fault().is_some_and(|f| f != Fault::RejectDeletes) {
            return Err(transfer_err("peer unreachable"));
        }
        let records = source.snapshot(keys);
        if records.len() != keys.len() {
            return Err(transfer_err("source is missing keys"));
        }
        source.transfers_out.fetch_add(1, Ordering::Relaxed);
        let mut store = dest.store.write();
        for (k, v) in records {
            store.insert(k, v);
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCluster")
            .field("devices", &self.device_ids())
            .finish()
    }
}

/// Connection to an [`InMemoryDevice`].
pub struct InMemoryConnection {
    device: Arc<InMemoryDevice>,
    cluster: InMemoryCluster,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection {
                device: self.device.id.to_string(),
                message: "connection closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceConnection for InMemoryConnection {
    fn device(&self) -> &DeviceId {
        &self.device.id
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        self.check_open()?;
        self.device.get(key)
    }

    async fn get_key_range(&self, range: &KeyRange) -> Result<Vec<String>> {
        self.check_open()?;
        self.device.get_key_range(range)
    }

    async fn get_previous(&self, key: &str) -> Result<Option<Entry>> {
        self.check_open()?;
        self.device.get_previous(key)
    }

    async fn put(&self, key: &str, value: Bytes, sync: Synchronization) -> Result<()> {
        self.check_open()?;
        self.device.put(key, value, sync)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        self.device.delete_keys(&[key.to_string()])
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        self.check_open()?;
        self.device.delete_keys(keys)
    }

    async fn push_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
        self.check_open()?;
        self.cluster.transfer(&self.device, target, keys)
    }

    async fn copy_keys(&self, target: &DeviceId, keys: &[String]) -> Result<()> {
        self.check_open()?;
        self.cluster.transfer(&self.device, target, keys)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.device.closes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// `Connector` handing out connections into an [`InMemoryCluster`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    cluster: InMemoryCluster,
}

impl InMemoryConnector {
    pub fn new(cluster: InMemoryCluster) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(
        &self,
        device: &DeviceId,
        _settings: &ConnectSettings,
    ) -> Result<Arc<dyn DeviceConnection>> {
        let conn = self.cluster.connection(device)?;
        match conn.device.fault() {
            Some(Fault::Unreachable) => {
                return Err(Error::Connection {
                    device: device.to_string(),
                    message: "device unreachable".to_string(),
                })
            }
            Some(Fault::RefuseConnect) => {
                return Err(Error::ConnectionRefused {
                    device: device.to_string(),
                })
            }
            _ => {}
        }
        conn.device.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(conn))
    }
}
