//! # Waypoint Core
//!
//! Core types for the Waypoint DTN node.
//!
//! This crate holds everything the rest of the workspace agrees on:
//!
//! - [`eid`]: Endpoint identifiers (`dtn:` and `ipn:` schemes) and wildcard
//!   patterns used for registration dispatch and route matching
//! - [`gbof`]: The globally-unique bundle identity (source + creation
//!   timestamp + fragment fields) and DTN-epoch time helpers
//! - [`bundle`]: The `Bundle` entity - identity, flags, payload handle,
//!   forwarding log, and the list-mapping set
//! - [`payload`]: In-memory or disk-spooled payload handles
//! - [`fwdlog`]: The per-bundle append-only forwarding log
//! - [`list`]: Lock-protected bundle collections (ordered list, integer
//!   keyed map, string keyed multimap) that keep the bundle's mapping set
//!   in step with membership
//! - [`seqid`]: Vector-clock style sequence identifiers carried opaquely
//!   for duplicate suppression by routers

pub mod bundle;
pub mod eid;
pub mod error;
pub mod fwdlog;
pub mod gbof;
pub mod list;
pub mod payload;
pub mod seqid;

pub use bundle::{Bundle, BundleRef, CarriedBlock, Priority, ReportFlags};
pub use eid::{EidError, EidPattern, EndpointId};
pub use error::CoreError;
pub use fwdlog::{ForwardingAction, ForwardingEntry, ForwardingLog, ForwardingState};
pub use gbof::{CreationTimestamp, GbofId, dtn_time_now, DTN_TIME_OFFSET};
pub use list::{BundleIntMap, BundleList, BundleStrMultiMap, ListId};
pub use payload::{Payload, PayloadLocation};
pub use seqid::SequenceId;
