//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      DeviceConnection │ Connector │ PlacementRing          │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryCluster/Connector │ TcpConnector │ StaticRing      │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use kinetic_objstore::adapters::{InMemoryCluster, InMemoryConnector};
//! use kinetic_objstore::domain::ports::Connector;
//!
//! let cluster = InMemoryCluster::with_devices(["127.0.0.1:8123"]);
//! let connector = InMemoryConnector::new(cluster.clone());
//! let conn = connector.connect(&"127.0.0.1:8123".into(), &Default::default()).await?;
//! ```

mod memory;
mod ring;
mod tcp;

pub use memory::{
    DeviceStats, Fault, InMemoryCluster, InMemoryConnection, InMemoryConnector, InMemoryDevice,
    DEFAULT_MAX_KEY_RANGE,
};
pub use ring::StaticRing;
pub use tcp::{serve_device, TcpConnection, TcpConnector};
