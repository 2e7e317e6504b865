//! Kinetic Object Store
//!
//! An object storage backend that keeps objects directly on network-attached
//! key-value (kinetic) devices and keeps device replicas consistent through
//! peer-to-peer replication.
//!
//! # Architecture
//!
//! ```text
//! Replicator (cycle) → ConnectionPool → KineticReplicator → DeviceConnection
//!                                              │
//! DiskFileManager → DiskFile (writer/reader) ──┘  (same key codec)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and TCP device adapters, static placement ring
//! - [`config`] - YAML daemon configuration
//! - [`diskfile`] - Chunked object store on one device
//! - [`domain`] - Key codec, storage policies and port traits
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus metrics and HTTP endpoints
//! - [`replicator`] - Replication engine and cycle scheduler

pub mod adapters;
pub mod config;
pub mod diskfile;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod replicator;

// Re-export commonly used types
pub use config::Config;
pub use diskfile::{DiskFile, DiskFileManager, DiskFileReader, DiskFileWriter};
pub use error::{Error, Result};
pub use replicator::{CycleStats, KineticReplicator, Replicator};
