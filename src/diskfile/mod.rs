//! Chunked Object Store
//!
//! Stores one logical object on one device as a head record plus a run of
//! fixed-size chunk records:
//!
//! ```text
//! objects.<hashpath>.<ts>.data.<nonce>     head: {metadata, chunk_count}
//! chunks.<hashpath>.<nonce>.00000000       chunk 0
//! chunks.<hashpath>.<nonce>.00000001       chunk 1
//! ...
//! objects.<hashpath>.<ts>.ts.<nonce>       tombstone (delete)
//! ```
//!
//! The head is always written after every chunk of its version has been
//! acknowledged, so a visible head never refers to missing chunks. Readers
//! resolve the newest head for a hashpath with a single get-previous on
//! `<policy>.<hashpath>/`.
//!
//! # Usage
//!
//! ```ignore
//! let df = manager.get_diskfile(&device, part, "a", "c", "o", &policy, None)?;
//! let mut writer = df.create().await?;
//! writer.write(b"hello").await?;
//! writer.put(metadata).await?;
//!
//! let body = df.open().await?.read_to_end().await?;
//! ```

mod file;
pub mod keyset;
mod manager;
mod reader;
mod writer;

#[cfg(test)]
mod proptest;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::DiskFile;
pub use manager::{DiskFileConfig, DiskFileManager, DiskFileRouter, DEFAULT_DISK_CHUNK_SIZE};
pub use reader::DiskFileReader;
pub use writer::DiskFileWriter;

/// Object metadata carried by the head record.
pub type Metadata = BTreeMap<String, String>;

/// Version timestamp of the object. Required on every put.
pub const X_TIMESTAMP: &str = "X-Timestamp";

/// Erasure-code fragment index, folded into the nonce when present.
pub const X_FRAG_INDEX: &str = "X-Object-Sysmeta-Ec-Frag-Index";

/// Number of chunk records, reported back to readers.
pub const X_CHUNK_COUNT: &str = "X-Kinetic-Chunk-Count";

/// Value stored under a head or tombstone key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadRecord {
    pub metadata: Metadata,
    pub chunk_count: u64,
}

impl HeadRecord {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
