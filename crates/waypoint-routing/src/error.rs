//! Routing error types

use thiserror::Error;

/// Errors from route table operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Recursive route-to-endpoint resolution went too deep
    #[error("route resolution chain exceeded {max} hops for '{dest}'")]
    ChainTooLong { dest: String, max: usize },

    /// An ipn range expansion that would create too many routes
    #[error("ipn route range {start}..={end} too large (limit {limit})")]
    RangeTooLarge { start: u64, end: u64, limit: u64 },

    /// An ipn range with end < start
    #[error("ipn route range {start}..={end} is empty")]
    EmptyRange { start: u64, end: u64 },

    /// Pattern or endpoint parse failure
    #[error(transparent)]
    Eid(#[from] waypoint_core::EidError),
}
