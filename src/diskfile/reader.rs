//! Reader for the newest version of an object.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use super::{HeadRecord, Metadata, X_CHUNK_COUNT};
use crate::domain::keys::{latest_lookup_key, parse_key, ObjectKey, Timestamp};
use crate::domain::ports::DeviceConnection;
use crate::error::{Error, Result};

/// An opened object version: its head metadata and a chunk stream.
pub struct DiskFileReader {
    conn: Arc<dyn DeviceConnection>,
    key: ObjectKey,
    record: HeadRecord,
}

impl DiskFileReader {
    pub(crate) async fn open(
        conn: Arc<dyn DeviceConnection>,
        policy_index: u32,
        hashpath: &str,
    ) -> Result<Self> {
        let not_found = || Error::DiskFileNotExist {
            hashpath: hashpath.to_string(),
        };
        let entry = conn
            .get_previous(&latest_lookup_key(policy_index, hashpath))
            .await?
            .ok_or_else(not_found)?;

        // get-previous may land on a neighbouring object or a chunk key
        let key = match parse_key(&entry.key) {
            Ok(key) if key.policy_index == policy_index && key.hashpath == hashpath => key,
            _ => return Err(not_found()),
        };
        if key.is_tombstone() {
            return Err(Error::DiskFileDeleted {
                timestamp: key.timestamp,
            });
        }

        let mut record = HeadRecord::decode(&entry.value)?;
        record
            .metadata
            .insert(X_CHUNK_COUNT.to_string(), record.chunk_count.to_string());
        Ok(Self { conn, key, record })
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn timestamp(&self) -> Timestamp {
        self.key.timestamp
    }

    pub fn metadata(&self) -> &Metadata {
        &self.record.metadata
    }

    pub fn chunk_count(&self) -> u64 {
        self.record.chunk_count
    }

    /// Chunk payloads in sequence order, fetched lazily one at a time.
    pub fn into_chunks(self) -> BoxStream<'static, Result<Bytes>> {
        let conn = self.conn;
        let key = self.key;
        stream::iter(0..self.record.chunk_count)
            .then(move |sequence| {
                let conn = conn.clone();
                let chunk_key = key.chunk_key(sequence);
                let hashpath = key.hashpath.clone();
                async move {
                    match conn.get(&chunk_key).await? {
                        Some(entry) => Ok(entry.value),
                        None => Err(Error::MissingChunk {
                            hashpath,
                            key: chunk_key,
                        }),
                    }
                }
            })
            .boxed()
    }

    /// Whole body in memory.
    pub async fn read_to_end(self) -> Result<Bytes> {
        let body = self
            .into_chunks()
            .try_fold(BytesMut::new(), |mut body, chunk| async move {
                body.extend_from_slice(&chunk);
                Ok(body)
            })
            .await?;
        Ok(body.freeze())
    }
}

impl std::fmt::Debug for DiskFileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskFileReader")
            .field("key", &self.key)
            .field("chunk_count", &self.record.chunk_count)
            .finish()
    }
}
