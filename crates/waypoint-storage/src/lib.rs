//! # Waypoint Storage
//!
//! Durable state for the Waypoint DTN node:
//!
//! - [`tables`]: the redb database and its five tables (bundles, bundle
//!   details, links, registrations, pending aggregate custody signals)
//! - [`records`]: the serialized record per table, including the
//!   denormalized write-only bundle-detail row
//! - [`quota`]: payload quota accounting with atomic reserve/release
//! - [`fd_cache`]: an LRU cache bounding open payload file descriptors
//! - [`bundle_store`]: the store proper - bundle records keyed by local
//!   bundle id, one payload file per bundle named by that id
//!
//! ## Layout
//!
//! ```text
//! <db_path>               redb database (five tables)
//! <payload_dir>/<id>.pay  one durable payload file per bundle
//! ```

pub mod bundle_store;
pub mod error;
pub mod fd_cache;
pub mod quota;
pub mod records;
pub mod tables;

pub use bundle_store::{BundleStore, BundleStoreConfig};
pub use error::StorageError;
pub use fd_cache::FdCache;
pub use quota::PayloadQuota;
pub use records::{
    BundleDetailRecord, BundleRecord, LinkRecord, PendingAcsRecord, RegistrationRecord,
};
pub use tables::NodeDb;
