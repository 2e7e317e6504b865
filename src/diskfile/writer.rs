//! Chunking writer.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use super::file::reclaim_superseded;
use super::manager::DiskFileConfig;
use super::{HeadRecord, Metadata, X_CHUNK_COUNT, X_FRAG_INDEX, X_TIMESTAMP};
use crate::domain::keys::{build_chunk_key, HeadKind, Nonce, ObjectKey, Timestamp};
use crate::domain::ports::DeviceConnection;
use crate::error::{Error, Result};

/// Buffers an object body and writes it out chunk by chunk.
///
/// Up to `write_depth` chunk puts run concurrently. Nothing becomes visible
/// to readers until [`put`](Self::put) writes the head record.
pub struct DiskFileWriter {
    conn: Arc<dyn DeviceConnection>,
    policy_index: u32,
    hashpath: String,
    chunk_size: usize,
    config: Arc<DiskFileConfig>,
    nonce: Nonce,
    buffer: BytesMut,
    sequence: u64,
    upload_size: u64,
    pending: FuturesUnordered<JoinHandle<Result<()>>>,
}

impl DiskFileWriter {
    pub(crate) fn new(
        conn: Arc<dyn DeviceConnection>,
        policy_index: u32,
        hashpath: String,
        chunk_size: usize,
        config: Arc<DiskFileConfig>,
    ) -> Self {
        Self {
            conn,
            policy_index,
            hashpath,
            chunk_size,
            config,
            nonce: Nonce::generate(None),
            buffer: BytesMut::with_capacity(chunk_size),
            sequence: 0,
            upload_size: 0,
            pending: FuturesUnordered::new(),
        }
    }

    /// Bytes accepted so far.
    pub fn upload_size(&self) -> u64 {
        self.upload_size
    }

    /// Chunks handed to the device so far.
    pub fn chunks_written(&self) -> u64 {
        self.sequence
    }

    /// Append to the object body, emitting every full chunk.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.extend_from_slice(data);
        self.upload_size += data.len() as u64;
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.submit_chunk(chunk).await?;
        }
        Ok(data.len())
    }

    async fn submit_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let key = build_chunk_key(&self.hashpath, &self.nonce, self.sequence);
        self.sequence += 1;
        let sync = self.config.synchronization.for_write(false);
        let conn = self.conn.clone();
        self.pending
            .push(tokio::spawn(async move { conn.put(&key, chunk, sync).await }));
        while self.pending.len() >= self.config.write_depth {
            self.wait_one().await?;
        }
        Ok(())
    }

    async fn wait_one(&mut self) -> Result<()> {
        match self.pending.next().await {
            Some(joined) => joined.map_err(|e| Error::Internal(format!("chunk write task: {}", e)))?,
            None => Ok(()),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.wait_one().await?;
        }
        Ok(())
    }

    /// Flush the tail chunk, wait for every chunk, then write the head
    /// record. Returns the key of the new version.
    ///
    /// `metadata` must carry `X-Timestamp`. A fragment index in
    /// `X-Object-Sysmeta-Ec-Frag-Index` is folded into the nonce, which is
    /// only possible while no chunk has been sent yet.
    #[instrument(skip(self, metadata), fields(device = %self.conn.device(), hashpath = %self.hashpath))]
    pub async fn put(mut self, mut metadata: Metadata) -> Result<ObjectKey> {
        let timestamp: Timestamp = metadata
            .get(X_TIMESTAMP)
            .ok_or_else(|| Error::InvalidMetadata(format!("missing {}", X_TIMESTAMP)))?
            .parse()?;
        let frag_index = match metadata.get(X_FRAG_INDEX) {
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| {
                Error::InvalidMetadata(format!("{} is not an integer: {:?}", X_FRAG_INDEX, raw))
            })?),
            None => None,
        };
        if frag_index != self.nonce.frag_index() {
            if self.sequence > 0 {
                return Err(Error::InvalidMetadata(
                    "fragment index must be known before the first chunk is written".into(),
                ));
            }
            self.nonce = Nonce::new(self.nonce.base(), frag_index)?;
        }

        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.submit_chunk(tail).await?;
        }
        self.drain().await?;

        let key = ObjectKey::new(
            self.policy_index,
            self.hashpath.clone(),
            timestamp,
            HeadKind::Data,
            self.nonce.clone(),
        );
        metadata.insert(X_CHUNK_COUNT.to_string(), self.sequence.to_string());
        let record = HeadRecord {
            metadata,
            chunk_count: self.sequence,
        };
        self.conn
            .put(
                &key.to_key(),
                record.encode()?,
                self.config.synchronization.for_write(true),
            )
            .await?;
        debug!(
            key = %key,
            chunks = self.sequence,
            bytes = self.upload_size,
            "Wrote object"
        );

        reclaim_superseded(self.conn.clone(), key.clone(), &self.config).await;
        Ok(key)
    }
}

impl std::fmt::Debug for DiskFileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileWriter")
            .field("hashpath", &self.hashpath)
            .field("nonce", &self.nonce)
            .field("sequence", &self.sequence)
            .field("upload_size", &self.upload_size)
            .finish()
    }
}
