//! Range-scan helpers shared by the diskfile layer and the replicator.
//!
//! Every scan is paged: a page is requested with the configured limit and
//! the next page resumes strictly after the last key returned, until a page
//! comes back empty.

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, warn};

use crate::domain::keys::{head_prefix, key_range_for_prefix, parse_key, ObjectKey};
use crate::domain::ports::{DeviceConnection, KeyRange};
use crate::error::Result;

/// Every key under `prefix.`, in device order.
pub async fn scan_prefix(
    conn: &dyn DeviceConnection,
    prefix: &str,
    page_limit: usize,
) -> Result<Vec<String>> {
    let (start, end) = key_range_for_prefix(prefix);
    let mut range = KeyRange::new(start, end, page_limit.max(1));
    let mut keys = Vec::new();
    loop {
        let page = conn.get_key_range(&range).await?;
        let Some(last) = page.last().cloned() else {
            break;
        };
        keys.extend(page);
        range = range.after(last);
    }
    Ok(keys)
}

/// Head key of `key` followed by all of its chunk keys in sequence order.
pub async fn object_key_set(
    conn: &dyn DeviceConnection,
    key: &ObjectKey,
    page_limit: usize,
) -> Result<Vec<String>> {
    let mut keys = vec![key.to_key()];
    if !key.is_tombstone() {
        keys.extend(scan_prefix(conn, &key.chunk_prefix(), page_limit).await?);
    }
    Ok(keys)
}

/// All stored versions of a hashpath, oldest first. Keys that do not parse
/// are skipped.
pub async fn versions_of(
    conn: &dyn DeviceConnection,
    policy_index: u32,
    hashpath: &str,
    page_limit: usize,
) -> Result<Vec<ObjectKey>> {
    let keys = scan_prefix(conn, &head_prefix(policy_index, hashpath), page_limit).await?;
    Ok(keys
        .iter()
        .filter_map(|k| match parse_key(k) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key = %k, error = %e, "Skipping unparseable head key");
                None
            }
        })
        .collect())
}

/// Delete the key sets of `versions`, at most `depth` objects at a time.
pub async fn delete_versions(
    conn: &dyn DeviceConnection,
    versions: Vec<ObjectKey>,
    depth: usize,
    page_limit: usize,
) -> Result<usize> {
    let count = versions.len();
    stream::iter(versions)
        .map(|version| async move {
            // chunks first so a surviving head never points at nothing
            let mut keys = object_key_set(conn, &version, page_limit).await?;
            keys.rotate_left(1);
            conn.delete_keys(&keys).await
        })
        .buffer_unordered(depth.max(1))
        .try_collect::<Vec<()>>()
        .await?;
    Ok(count)
}

/// Delete every version of the hashpath older than `newest`.
///
/// Versions sharing `newest`'s timestamp are left alone; the read path
/// orders those by nonce.
pub async fn reclaim_older_versions(
    conn: &dyn DeviceConnection,
    newest: &ObjectKey,
    depth: usize,
    page_limit: usize,
) -> Result<usize> {
    let stale: Vec<ObjectKey> = versions_of(conn, newest.policy_index, &newest.hashpath, page_limit)
        .await?
        .into_iter()
        .filter(|v| v.timestamp < newest.timestamp)
        .collect();
    if stale.is_empty() {
        return Ok(0);
    }
    let removed = delete_versions(conn, stale, depth, page_limit).await?;
    debug!(
        device = %conn.device(),
        hashpath = %newest.hashpath,
        removed,
        "Reclaimed superseded versions"
    );
    Ok(removed)
}
