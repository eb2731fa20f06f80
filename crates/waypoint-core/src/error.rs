//! Core error types

use thiserror::Error;

/// Errors from core bundle and list operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A null-source bundle requested reports, custody, or fragmentation
    #[error("bundle {bundle_id} has a null source but requests reports, custody, or fragmentation")]
    AnonymousBundleViolation { bundle_id: u64 },

    /// A bundle was added twice to the same list
    #[error("bundle {bundle_id} is already on list '{list}'")]
    DuplicateListEntry { bundle_id: u64, list: String },

    /// Endpoint id problems
    #[error(transparent)]
    Eid(#[from] crate::eid::EidError),

    /// Payload access problems
    #[error(transparent)]
    Payload(#[from] crate::payload::PayloadError),
}
