//! Key Codec
//!
//! Builds and parses the three key shapes stored on a kinetic device:
//!
//! ```text
//! head:       <policy>.<hashpath>.<secs>.<frac>.data.<nonce>
//! tombstone:  <policy>.<hashpath>.<secs>.<frac>.ts.<nonce>
//! chunk:      chunks.<hashpath>.<nonce>.<sequence>
//! ```
//!
//! `<policy>` is `objects` for policy 0 and `objects-<n>` otherwise. The
//! timestamp is fixed width so byte order on the device equals time order,
//! and chunk sequences are zero padded for the same reason. A nonce is a
//! dash-free hex UUID, optionally followed by `-<frag_index>`.
//!
//! Everything here is pure: no I/O, no state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Key-space field separator.
pub const FIELD_SEP: char = '.';

/// The byte immediately after [`FIELD_SEP`]; used as an exclusive range end.
pub const RANGE_END: char = '/';

/// Separator between a nonce and its fragment index.
pub const FRAG_SEP: char = '-';

/// Leading segment of every chunk key.
pub const CHUNK_PREFIX: &str = "chunks";

/// Base name of the per-policy head key namespace.
pub const OBJECTS_BASE: &str = "objects";

/// Width of the zero-padded chunk sequence.
const SEQUENCE_WIDTH: usize = 8;

/// Sub-second resolution of a [`Timestamp`] (five decimal places).
const TICKS_PER_SEC: u64 = 100_000;

/// Fractional digits kept in the internal form.
const FRAC_DIGITS: usize = 5;

/// Largest timestamp whose seconds still fit the ten-digit internal form.
const MAX_TICKS: u64 = 10_000_000_000 * TICKS_PER_SEC - 1;

// =============================================================================
// Timestamp
// =============================================================================

/// Object version timestamp with 10µs resolution.
///
/// Rendered in the fixed-width internal form `0001445528392.12345`
/// (`%016.05f`), which is how it appears inside keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp {
    ticks: u64,
}

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self { ticks: micros / 10 }
    }

    /// Build from fractional unix seconds.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self {
            ticks: ((secs.max(0.0) * TICKS_PER_SEC as f64).round() as u64).min(MAX_TICKS),
        }
    }

    /// Fractional unix seconds.
    pub fn as_secs_f64(&self) -> f64 {
        self.ticks as f64 / TICKS_PER_SEC as f64
    }

    /// Fixed-width form used in keys.
    pub fn internal(&self) -> String {
        format!(
            "{:010}.{:05}",
            self.ticks / TICKS_PER_SEC,
            self.ticks % TICKS_PER_SEC
        )
    }

    /// This timestamp moved forward by `secs` seconds.
    pub fn offset(&self, secs: f64) -> Self {
        Self::from_secs_f64(self.as_secs_f64() + secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.internal())
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    /// Accepts `1445528392`, `1445528392.1`, the internal form, and longer
    /// fractions such as `1445528392.123456789`, which round to 10µs.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidMetadata(format!("invalid timestamp {:?}", s));
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (s, ""),
        };
        if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let secs: u64 = secs.parse().map_err(|_| bad())?;

        let digits = &frac.as_bytes()[..frac.len().min(FRAC_DIGITS)];
        let mut ticks_frac = digits
            .iter()
            .chain(std::iter::repeat(&b'0'))
            .take(FRAC_DIGITS)
            .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
        if frac.as_bytes().get(FRAC_DIGITS).is_some_and(|d| *d >= b'5') {
            ticks_frac += 1;
        }

        let ticks = secs
            .checked_mul(TICKS_PER_SEC)
            .and_then(|t| t.checked_add(ticks_frac))
            .filter(|t| *t <= MAX_TICKS)
            .ok_or_else(bad)?;
        Ok(Self { ticks })
    }
}

impl TryFrom<String> for Timestamp {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.internal()
    }
}

// =============================================================================
// Nonce
// =============================================================================

/// Per-write disambiguator carried by head and chunk keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nonce {
    base: String,
    frag_index: Option<u32>,
}

impl Nonce {
    /// Fresh random nonce.
    pub fn generate(frag_index: Option<u32>) -> Self {
        Self {
            base: uuid::Uuid::new_v4().simple().to_string(),
            frag_index,
        }
    }

    /// Build from an existing base token.
    pub fn new(base: impl Into<String>, frag_index: Option<u32>) -> Result<Self> {
        let base = base.into();
        if base.is_empty() || base.contains([FIELD_SEP, FRAG_SEP, RANGE_END]) {
            return Err(Error::malformed(base, "nonce base must be a plain token"));
        }
        Ok(Self { base, frag_index })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn frag_index(&self) -> Option<u32> {
        self.frag_index
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frag_index {
            Some(idx) => write!(f, "{}{}{}", self.base, FRAG_SEP, idx),
            None => f.write_str(&self.base),
        }
    }
}

impl FromStr for Nonce {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(FRAG_SEP) {
            Some((base, frag)) => {
                let idx = frag
                    .parse::<u32>()
                    .map_err(|_| Error::malformed(s, "fragment index is not a number"))?;
                Nonce::new(base, Some(idx))
            }
            None => Nonce::new(s, None),
        }
    }
}

// =============================================================================
// Policy strings
// =============================================================================

/// Head key namespace for a storage policy index.
pub fn policy_string(policy_index: u32) -> String {
    if policy_index == 0 {
        OBJECTS_BASE.to_string()
    } else {
        format!("{}{}{}", OBJECTS_BASE, FRAG_SEP, policy_index)
    }
}

/// Inverse of [`policy_string`].
pub fn split_policy_string(s: &str) -> Result<u32> {
    if s == OBJECTS_BASE {
        return Ok(0);
    }
    s.strip_prefix(OBJECTS_BASE)
        .and_then(|rest| rest.strip_prefix(FRAG_SEP))
        .and_then(|idx| idx.parse::<u32>().ok())
        .filter(|idx| *idx > 0)
        .ok_or_else(|| Error::malformed(s, "unknown policy namespace"))
}

// =============================================================================
// Head keys
// =============================================================================

/// Whether a head key carries data or marks a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadKind {
    Data,
    Tombstone,
}

impl HeadKind {
    pub fn extension(&self) -> &'static str {
        match self {
            HeadKind::Data => "data",
            HeadKind::Tombstone => "ts",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "data" => Some(HeadKind::Data),
            "ts" => Some(HeadKind::Tombstone),
            _ => None,
        }
    }
}

/// Decoded head (or tombstone) key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub policy_index: u32,
    pub hashpath: String,
    pub timestamp: Timestamp,
    pub kind: HeadKind,
    pub nonce: Nonce,
}

impl ObjectKey {
    pub fn new(
        policy_index: u32,
        hashpath: impl Into<String>,
        timestamp: Timestamp,
        kind: HeadKind,
        nonce: Nonce,
    ) -> Self {
        Self {
            policy_index,
            hashpath: hashpath.into(),
            timestamp,
            kind,
            nonce,
        }
    }

    /// Encoded device key.
    pub fn to_key(&self) -> String {
        build_head_key(
            self.policy_index,
            &self.hashpath,
            self.timestamp,
            self.kind,
            &self.nonce,
        )
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == HeadKind::Tombstone
    }

    /// Prefix shared by every chunk of this version.
    pub fn chunk_prefix(&self) -> String {
        chunk_prefix(&self.hashpath, &self.nonce)
    }

    /// Key of chunk `sequence` of this version.
    pub fn chunk_key(&self, sequence: u64) -> String {
        build_chunk_key(&self.hashpath, &self.nonce, sequence)
    }

    /// Lookup key that sorts after every version of this hashpath.
    pub fn latest_lookup_key(&self) -> String {
        latest_lookup_key(self.policy_index, &self.hashpath)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// Encode a head or tombstone key.
pub fn build_head_key(
    policy_index: u32,
    hashpath: &str,
    timestamp: Timestamp,
    kind: HeadKind,
    nonce: &Nonce,
) -> String {
    format!(
        "{}.{}.{}.{}.{}",
        policy_string(policy_index),
        hashpath,
        timestamp.internal(),
        kind.extension(),
        nonce
    )
}

/// Decode a head or tombstone key.
pub fn parse_key(key: &str) -> Result<ObjectKey> {
    let parts: Vec<&str> = key.split(FIELD_SEP).collect();
    if parts.len() != 6 {
        return Err(Error::malformed(
            key,
            format!("expected 6 segments, found {}", parts.len()),
        ));
    }
    let policy_index = split_policy_string(parts[0])?;
    let hashpath = parts[1];
    if hashpath.is_empty() {
        return Err(Error::malformed(key, "empty hashpath"));
    }
    let timestamp: Timestamp = format!("{}.{}", parts[2], parts[3])
        .parse()
        .map_err(|_| Error::malformed(key, "bad timestamp"))?;
    let kind = HeadKind::from_extension(parts[4])
        .ok_or_else(|| Error::malformed(key, format!("unknown extension {:?}", parts[4])))?;
    let nonce: Nonce = parts[5].parse().map_err(|_| Error::malformed(key, "bad nonce"))?;

    Ok(ObjectKey {
        policy_index,
        hashpath: hashpath.to_string(),
        timestamp,
        kind,
        nonce,
    })
}

/// Prefix shared by every version of a hashpath under a policy.
pub fn head_prefix(policy_index: u32, hashpath: &str) -> String {
    format!("{}{}{}", policy_string(policy_index), FIELD_SEP, hashpath)
}

/// get-previous on this key yields the newest version of `hashpath`.
pub fn latest_lookup_key(policy_index: u32, hashpath: &str) -> String {
    format!("{}{}", head_prefix(policy_index, hashpath), RANGE_END)
}

// =============================================================================
// Chunk keys
// =============================================================================

/// Decoded chunk key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    pub hashpath: String,
    pub nonce: Nonce,
    pub sequence: u64,
}

/// Encode a chunk key.
pub fn build_chunk_key(hashpath: &str, nonce: &Nonce, sequence: u64) -> String {
    format!(
        "{}.{:0width$}",
        chunk_prefix(hashpath, nonce),
        sequence,
        width = SEQUENCE_WIDTH
    )
}

/// Prefix shared by every chunk of one version.
pub fn chunk_prefix(hashpath: &str, nonce: &Nonce) -> String {
    format!("{}.{}.{}", CHUNK_PREFIX, hashpath, nonce)
}

/// Decode a chunk key.
pub fn parse_chunk_key(key: &str) -> Result<ChunkKey> {
    let parts: Vec<&str> = key.split(FIELD_SEP).collect();
    if parts.len() != 4 || parts[0] != CHUNK_PREFIX {
        return Err(Error::malformed(key, "not a chunk key"));
    }
    let sequence = parts[3]
        .parse::<u64>()
        .map_err(|_| Error::malformed(key, "bad chunk sequence"))?;
    Ok(ChunkKey {
        hashpath: parts[1].to_string(),
        nonce: parts[2].parse()?,
        sequence,
    })
}

// =============================================================================
// Ranges, hashing and partitions
// =============================================================================

/// `[start, end)` bounds covering exactly the keys under `prefix.`.
pub fn key_range_for_prefix(prefix: &str) -> (String, String) {
    (
        format!("{}{}", prefix, FIELD_SEP),
        format!("{}{}", prefix, RANGE_END),
    )
}

/// Hex hashpath of `/account/container/object`, salted with the cluster's
/// prefix and suffix.
pub fn hash_path(prefix: &str, suffix: &str, account: &str, container: &str, object: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(format!("/{}/{}/{}", account, container, object).as_bytes());
    hasher.update(suffix.as_bytes());
    hex::encode(hasher.finalize())
}

/// Partition of a hashpath: its leading 32 bits shifted by `part_shift`.
pub fn hashpath_partition(hashpath: &str, part_shift: u32) -> Result<u32> {
    let head = hashpath
        .get(..8)
        .ok_or_else(|| Error::malformed(hashpath, "hashpath shorter than 32 bits"))?;
    let leading = u32::from_str_radix(head, 16)
        .map_err(|_| Error::malformed(hashpath, "hashpath is not hex"))?;
    Ok(leading.checked_shr(part_shift).unwrap_or(0))
}
