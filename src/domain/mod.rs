//! Domain Layer
//!
//! Value objects, the key codec and the port traits the engines depend on.
//!
//! - **Keys** (`keys.rs`) - encode/decode of head, chunk and tombstone keys
//! - **Ports** (`ports.rs`) - device protocol and placement ring abstractions
//! - **Policy** (`policy.rs`) - storage policies and their rings
//!
//! # Usage
//!
//! ```ignore
//! use kinetic_objstore::domain::keys::parse_key;
//! use kinetic_objstore::domain::ports::DeviceConnection;
//!
//! async fn newest(conn: &dyn DeviceConnection, key: &str) -> Result<()> {
//!     let info = parse_key(key)?;
//!     let entry = conn.get_previous(&info.latest_lookup_key()).await?;
//!     // ...
//! }
//! ```

pub mod keys;
pub mod policy;
pub mod ports;

pub use keys::{HeadKind, Nonce, ObjectKey, Timestamp};
pub use policy::{PolicyType, StoragePolicies, StoragePolicy};
pub use ports::{
    ConnectSettings, Connector, DeviceConnection, DeviceId, Entry, KeyRange, PlacementRing,
    Synchronization,
};
