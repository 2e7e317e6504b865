//! Property-Based Tests for the Chunked Object Store
//!
//! # Test Properties
//!
//! 1. **Chunk Count**: N bytes at chunk size C produce `ceil(N / C)` chunks,
//!    all of size C except possibly the last
//! 2. **Roundtrip**: bytes read back equal the bytes written, however the
//!    body was split across `write` calls

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::{DiskFileConfig, DiskFileManager, Metadata, X_TIMESTAMP};
use crate::adapters::{InMemoryCluster, InMemoryConnector, StaticRing};
use crate::config::HashConfig;
use crate::domain::keys::Timestamp;
use crate::domain::policy::{PolicyType, StoragePolicy};

// =============================================================================
// Property Strategies
// =============================================================================

fn body_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2000)
}

fn chunk_size_strategy() -> impl Strategy<Value = usize> {
    1usize..=256
}

/// Split points for feeding the body through several `write` calls.
fn write_size_strategy() -> impl Strategy<Value = usize> {
    1usize..=300
}

// =============================================================================
// Harness
// =============================================================================

/// Write `body` in `write_size` pieces and return the device's chunk sizes
/// plus the body read back.
fn write_and_read(body: &[u8], chunk_size: usize, write_size: usize) -> (Vec<usize>, Vec<u8>) {
    tokio_test::block_on(async {
        let cluster = InMemoryCluster::with_devices(["d:1"]);
        let config = DiskFileConfig {
            unlink_wait: true,
            ..Default::default()
        };
        let manager = DiskFileManager::new(
            config,
            HashConfig::default(),
            Arc::new(InMemoryConnector::new(cluster.clone())),
        )
        .unwrap();
        let ring = StaticRing::balanced(vec!["d:1".into()], 0, 1).unwrap();
        let policy = StoragePolicy::new(0, "gold", PolicyType::Replication, Arc::new(ring));

        let df = manager
            .get_diskfile(&"d:1".into(), 0, "a", "c", "o", &policy, Some(chunk_size))
            .unwrap();
        let mut writer = df.create().await.unwrap();
        for piece in body.chunks(write_size) {
            writer.write(piece).await.unwrap();
        }
        let mut metadata = Metadata::new();
        metadata.insert(X_TIMESTAMP.into(), Timestamp::from_secs_f64(1.0).internal());
        let key = writer.put(metadata).await.unwrap();

        let device = cluster.device(&"d:1".into()).unwrap();
        let sizes = device
            .keys_with_prefix(&key.chunk_prefix())
            .iter()
            .map(|k| device.value(k).unwrap().len())
            .collect();
        let read = df.open().await.unwrap().read_to_end().await.unwrap();
        (sizes, read.to_vec())
    })
}

// =============================================================================
// Chunking Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Chunk count and sizes follow ceil(N / C).
    #[test]
    fn prop_chunk_count_law(
        body in body_strategy(),
        chunk_size in chunk_size_strategy(),
        write_size in write_size_strategy(),
    ) {
        let (sizes, _) = write_and_read(&body, chunk_size, write_size);
        prop_assert_eq!(sizes.len(), body.len().div_ceil(chunk_size));
        if let Some((last, full)) = sizes.split_last() {
            prop_assert!(full.iter().all(|s| *s == chunk_size));
            prop_assert!(*last >= 1 && *last <= chunk_size);
        }
        prop_assert_eq!(sizes.iter().sum::<usize>(), body.len());
    }

    /// Reading returns exactly what was written.
    #[test]
    fn prop_roundtrip(
        body in body_strategy(),
        chunk_size in chunk_size_strategy(),
        write_size in write_size_strategy(),
    ) {
        let (_, read) = write_and_read(&body, chunk_size, write_size);
        prop_assert_eq!(read, body);
    }
}
