//! Daemon error types

use thiserror::Error;

/// Errors from daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Wire-format problems
    #[error("protocol error: {0}")]
    Codec(#[from] waypoint_codec::CodecError),

    /// Durable store problems
    #[error("storage error: {0}")]
    Storage(#[from] waypoint_storage::StorageError),

    /// Route table problems
    #[error("routing error: {0}")]
    Routing(#[from] waypoint_routing::RoutingError),

    /// Core type problems
    #[error("core error: {0}")]
    Core(#[from] waypoint_core::CoreError),

    /// Endpoint parse problems
    #[error("endpoint error: {0}")]
    Eid(#[from] waypoint_core::EidError),

    /// Convergence-layer failure
    #[error("convergence layer error: {0}")]
    ConvergenceLayer(String),

    /// The event bus is shut down
    #[error("event bus closed")]
    BusClosed,

    /// An event referenced a link we do not have
    #[error("no such link: '{0}'")]
    NoSuchLink(String),

    /// Invalid administrative command or configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
