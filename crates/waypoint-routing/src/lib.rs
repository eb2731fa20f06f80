//! # Waypoint Routing
//!
//! The route table for the Waypoint DTN node: destination patterns mapped
//! to next hops (a link, or another endpoint for recursive resolution),
//! with longest-match selection and `ipn:` range expansion.
//!
//! The router *contract* - the pluggable component that consumes daemon
//! events and queues bundles on links - lives in the daemon crate, where
//! links and events are visible. This crate is the pure routing state it
//! consults.

pub mod error;
pub mod route;
pub mod table;

pub use error::RoutingError;
pub use route::{NextHop, ResolvedRoute, RouteEntry};
pub use table::RouteTable;
