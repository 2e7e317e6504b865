//! Per-object handle.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use super::keyset::reclaim_older_versions;
use super::manager::DiskFileConfig;
use super::reader::DiskFileReader;
use super::writer::DiskFileWriter;
use super::{HeadRecord, Metadata, X_TIMESTAMP};
use crate::domain::keys::{HeadKind, Nonce, ObjectKey, Timestamp};
use crate::domain::ports::{Connector, DeviceConnection, DeviceId};
use crate::error::Result;

/// One object on one device.
///
/// The device connection is opened on first use and shared by every
/// reader and writer created from this handle.
pub struct DiskFile {
    device: DeviceId,
    partition: u32,
    policy_index: u32,
    hashpath: String,
    chunk_size: usize,
    config: Arc<DiskFileConfig>,
    connector: Arc<dyn Connector>,
    conn: OnceCell<Arc<dyn DeviceConnection>>,
}

impl DiskFile {
    pub(crate) fn new(
        device: DeviceId,
        partition: u32,
        policy_index: u32,
        hashpath: String,
        chunk_size: usize,
        config: Arc<DiskFileConfig>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            device,
            partition,
            policy_index,
            hashpath,
            chunk_size,
            config,
            connector,
            conn: OnceCell::new(),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn policy_index(&self) -> u32 {
        self.policy_index
    }

    pub fn hashpath(&self) -> &str {
        &self.hashpath
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    async fn connection(&self) -> Result<Arc<dyn DeviceConnection>> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                self.connector
                    .connect(&self.device, &self.config.connect_settings())
                    .await
            })
            .await?;
        Ok(conn.clone())
    }

    /// Start writing a new version.
    pub async fn create(&self) -> Result<DiskFileWriter> {
        let conn = self.connection().await?;
        Ok(DiskFileWriter::new(
            conn,
            self.policy_index,
            self.hashpath.clone(),
            self.chunk_size,
            self.config.clone(),
        ))
    }

    /// Open the newest version for reading.
    pub async fn open(&self) -> Result<DiskFileReader> {
        let conn = self.connection().await?;
        DiskFileReader::open(conn, self.policy_index, &self.hashpath).await
    }

    /// Write a tombstone at `timestamp`.
    #[instrument(skip(self), fields(device = %self.device, hashpath = %self.hashpath))]
    pub async fn delete(&self, timestamp: Timestamp) -> Result<()> {
        let conn = self.connection().await?;
        let key = ObjectKey::new(
            self.policy_index,
            self.hashpath.clone(),
            timestamp,
            HeadKind::Tombstone,
            Nonce::generate(None),
        );
        let mut metadata = Metadata::new();
        metadata.insert(X_TIMESTAMP.to_string(), timestamp.internal());
        let record = HeadRecord {
            metadata,
            chunk_count: 0,
        };
        conn.put(
            &key.to_key(),
            record.encode()?,
            self.config.synchronization.for_write(true),
        )
        .await?;
        debug!(key = %key, "Wrote tombstone");

        reclaim_superseded(conn, key, &self.config).await;
        Ok(())
    }

    /// Close the device connection if one was opened.
    pub async fn close(&self) -> Result<()> {
        match self.conn.get() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for DiskFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFile")
            .field("device", &self.device)
            .field("partition", &self.partition)
            .field("policy_index", &self.policy_index)
            .field("hashpath", &self.hashpath)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Remove versions older than `newest`, inline when `unlink_wait` is set
/// and on a background task otherwise. Failures are logged only; the next
/// replication pass picks up whatever is left.
pub(crate) async fn reclaim_superseded(
    conn: Arc<dyn DeviceConnection>,
    newest: ObjectKey,
    config: &DiskFileConfig,
) {
    let depth = config.delete_depth;
    let page = config.key_range_limit;
    if config.unlink_wait {
        if let Err(e) = reclaim_older_versions(conn.as_ref(), &newest, depth, page).await {
            warn!(key = %newest, error = %e, "Failed to reclaim superseded versions");
        }
    } else {
        tokio::spawn(async move {
            if let Err(e) = reclaim_older_versions(conn.as_ref(), &newest, depth, page).await {
                warn!(key = %newest, error = %e, "Failed to reclaim superseded versions");
            }
        });
    }
}
