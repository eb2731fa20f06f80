//! The Bundle entity
//!
//! A `Bundle` is the atomic data unit the daemon stores and forwards. The
//! identity and delivery attributes are fixed at creation; everything the
//! daemon mutates afterwards (custodian, payload handle, forwarding log,
//! parsed blocks, custody state) lives behind the bundle's own lock, and
//! the list-mapping set has a second small lock so list membership can be
//! tracked without touching daemon state.
//!
//! Bundles are shared as [`BundleRef`] (`Arc<Bundle>`). Destruction is
//! driven by the daemon: when the last list mapping is gone and the daemon
//! decides to drop the bundle, it marks it freed (exactly once) and posts
//! the free event that deletes it from the store.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::eid::EndpointId;
use crate::error::CoreError;
use crate::fwdlog::ForwardingLog;
use crate::gbof::{dtn_time_now, CreationTimestamp, GbofId};
use crate::list::ListId;
use crate::payload::Payload;

/// Shared handle to a bundle
pub type BundleRef = Arc<Bundle>;

/// Bundle class of service
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Priority {
    /// Bulk transfer, lowest precedence
    Bulk,
    /// Normal delivery (default)
    #[default]
    Normal,
    /// Expedited, highest deliverable precedence
    Expedited,
    /// Reserved encoding, carried but never originated
    Reserved,
}

impl Priority {
    /// Wire encoding (primary block class-of-service bits)
    pub fn as_u8(self) -> u8 {
        match self {
            Priority::Bulk => 0,
            Priority::Normal => 1,
            Priority::Expedited => 2,
            Priority::Reserved => 3,
        }
    }

    /// Decode from the two class-of-service bits
    pub fn from_u8(v: u8) -> Self {
        match v & 0x3 {
            0 => Priority::Bulk,
            1 => Priority::Normal,
            2 => Priority::Expedited,
            _ => Priority::Reserved,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Bulk => "bulk",
            Priority::Normal => "normal",
            Priority::Expedited => "expedited",
            Priority::Reserved => "reserved",
        };
        write!(f, "{s}")
    }
}

/// The six status-report request flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFlags {
    /// Report bundle reception
    pub receive: bool,
    /// Report custody acceptance
    pub custody: bool,
    /// Report forwarding
    pub forward: bool,
    /// Report delivery
    pub delivery: bool,
    /// Report deletion
    pub deletion: bool,
    /// Report acknowledgement by the application
    pub app_ack: bool,
}

impl ReportFlags {
    /// Whether any report is requested
    pub fn any(&self) -> bool {
        self.receive || self.custody || self.forward || self.delivery || self.deletion
            || self.app_ack
    }
}

/// An extension block carried by a bundle, in decoded-but-opaque form
///
/// The codec layer frames these on the wire; the daemon interprets the
/// kinds it knows and carries the rest through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarriedBlock {
    /// Block type code
    pub block_type: u8,
    /// Block processing flags (raw SDNV value)
    pub flags: u64,
    /// Block type-specific data
    pub data: Bytes,
}

/// Mutable bundle state, guarded by the bundle's lock
#[derive(Debug)]
pub struct BundleState {
    /// Current custodian endpoint (null when no custodian)
    pub custodian: EndpointId,
    /// Previous hop, when a previous-hop block was received
    pub prevhop: Option<EndpointId>,
    /// Payload handle
    pub payload: Payload,
    /// Forwarding decisions and outcomes
    pub fwdlog: ForwardingLog,
    /// Extension blocks received from the wire, in wire order
    pub recv_blocks: Vec<CarriedBlock>,
    /// Extension blocks supplied by the local application
    pub api_blocks: Vec<CarriedBlock>,
    /// Whether this node currently holds custody
    pub local_custody: bool,
    /// Node-local custody id (0 = none allocated)
    pub custody_id: u64,
    /// Whether a valid custody-transfer-enhancement block was received
    pub cteb_valid: bool,
    /// Custody id asserted by the previous custodian's CTEB
    pub cteb_custody_id: u64,
    /// Accumulated age in seconds (age extension block)
    pub age_secs: u64,
    /// Whether payload quota has been reserved for this bundle
    pub space_reserved: bool,
    /// Set once the daemon has started deleting the bundle
    pub deleting: bool,
}

/// The atomic data unit of the bundle protocol
#[derive(Debug)]
pub struct Bundle {
    id: u64,
    gbof: GbofId,
    dest: EndpointId,
    replyto: EndpointId,
    priority: Priority,
    is_admin: bool,
    do_not_fragment: bool,
    custody_requested: bool,
    singleton_dest: bool,
    reports: ReportFlags,
    expiration_secs: u64,
    /// Total application data unit length; equals payload length unless
    /// this bundle is a fragment
    orig_length: u64,
    state: Mutex<BundleState>,
    mappings: Mutex<BTreeSet<ListId>>,
    freed: AtomicBool,
}

impl Bundle {
    /// Create a bundle with default flags
    pub fn new(
        id: u64,
        gbof: GbofId,
        dest: EndpointId,
        payload: Payload,
        expiration_secs: u64,
    ) -> Self {
        let orig_length = if gbof.is_fragment {
            // Caller sets the real ADU length via with_orig_length
            0
        } else {
            payload.len()
        };
        Self {
            id,
            gbof,
            dest,
            replyto: EndpointId::null(),
            priority: Priority::Normal,
            is_admin: false,
            do_not_fragment: false,
            custody_requested: false,
            singleton_dest: true,
            reports: ReportFlags::default(),
            expiration_secs,
            orig_length,
            state: Mutex::new(BundleState {
                custodian: EndpointId::null(),
                prevhop: None,
                payload,
                fwdlog: ForwardingLog::new(),
                recv_blocks: Vec::new(),
                api_blocks: Vec::new(),
                local_custody: false,
                custody_id: 0,
                cteb_valid: false,
                cteb_custody_id: 0,
                age_secs: 0,
                space_reserved: false,
                deleting: false,
            }),
            mappings: Mutex::new(BTreeSet::new()),
            freed: AtomicBool::new(false),
        }
    }

    /// Set the class of service
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as an administrative record bundle
    pub fn with_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    /// Request custody transfer
    pub fn with_custody(mut self) -> Self {
        self.custody_requested = true;
        self
    }

    /// Forbid fragmentation
    pub fn with_do_not_fragment(mut self) -> Self {
        self.do_not_fragment = true;
        self
    }

    /// Set the singleton-destination flag
    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton_dest = singleton;
        self
    }

    /// Set the reply-to endpoint
    pub fn with_replyto(mut self, replyto: EndpointId) -> Self {
        self.replyto = replyto;
        self
    }

    /// Set report-request flags
    pub fn with_reports(mut self, reports: ReportFlags) -> Self {
        self.reports = reports;
        self
    }

    /// Set the original ADU length (fragments only)
    pub fn with_orig_length(mut self, orig_length: u64) -> Self {
        self.orig_length = orig_length;
        self
    }

    /// Node-local bundle id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Globally-unique identity
    pub fn gbof(&self) -> &GbofId {
        &self.gbof
    }

    /// Source endpoint
    pub fn source(&self) -> &EndpointId {
        &self.gbof.source
    }

    /// Destination endpoint
    pub fn dest(&self) -> &EndpointId {
        &self.dest
    }

    /// Reply-to endpoint (null when reports go to the source)
    pub fn replyto(&self) -> &EndpointId {
        &self.replyto
    }

    /// Endpoint that reports and signals about this bundle go to
    pub fn report_dest(&self) -> &EndpointId {
        if self.replyto.is_null() {
            self.source()
        } else {
            &self.replyto
        }
    }

    /// Creation timestamp
    pub fn creation_ts(&self) -> CreationTimestamp {
        self.gbof.creation_ts
    }

    /// Class of service
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether this is an administrative record bundle
    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// Whether fragmentation is forbidden
    pub fn do_not_fragment(&self) -> bool {
        self.do_not_fragment
    }

    /// Whether custody transfer is requested
    pub fn custody_requested(&self) -> bool {
        self.custody_requested
    }

    /// Whether the destination is a singleton endpoint
    pub fn singleton_dest(&self) -> bool {
        self.singleton_dest
    }

    /// Report-request flags
    pub fn reports(&self) -> ReportFlags {
        self.reports
    }

    /// Lifetime in seconds past the creation timestamp
    pub fn expiration_secs(&self) -> u64 {
        self.expiration_secs
    }

    /// Whether this bundle is a fragment
    pub fn is_fragment(&self) -> bool {
        self.gbof.is_fragment
    }

    /// Fragment payload offset within the original ADU
    pub fn frag_offset(&self) -> u64 {
        self.gbof.frag_offset
    }

    /// Total length of the original ADU
    pub fn orig_length(&self) -> u64 {
        self.orig_length
    }

    /// Lock and access the mutable state
    pub fn state(&self) -> MutexGuard<'_, BundleState> {
        self.state.lock()
    }

    /// Current payload length
    pub fn payload_len(&self) -> u64 {
        self.state.lock().payload.len()
    }

    /// Whether this node currently holds custody
    pub fn has_local_custody(&self) -> bool {
        self.state.lock().local_custody
    }

    /// The allocated node-local custody id (0 = none)
    pub fn custody_id(&self) -> u64 {
        self.state.lock().custody_id
    }

    /// Whether the bundle's lifetime has elapsed
    ///
    /// Age-block time (for nodes without synchronized clocks) counts
    /// against the lifetime as well.
    pub fn is_expired(&self) -> bool {
        self.time_to_expiration() == 0
    }

    /// Seconds until expiration (0 when already expired)
    pub fn time_to_expiration(&self) -> u64 {
        let age_secs = self.state.lock().age_secs;
        let now = dtn_time_now();
        let elapsed = now.saturating_sub(self.gbof.creation_ts.secs) + age_secs;
        self.expiration_secs.saturating_sub(elapsed)
    }

    /// Enforce creation-time invariants
    ///
    /// A bundle with a null source must not request reports or custody and
    /// must not be fragmentable.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.source().is_null()
            && (self.reports.any() || self.custody_requested || !self.do_not_fragment)
        {
            return Err(CoreError::AnonymousBundleViolation { bundle_id: self.id });
        }
        Ok(())
    }

    // --- list mapping set -------------------------------------------------

    /// Record membership on a list; false if already present
    pub fn add_mapping(&self, list: ListId) -> bool {
        self.mappings.lock().insert(list)
    }

    /// Clear membership on a list; false if it was not recorded
    pub fn remove_mapping(&self, list: ListId) -> bool {
        self.mappings.lock().remove(&list)
    }

    /// Whether membership on `list` is recorded
    pub fn is_on_list(&self, list: ListId) -> bool {
        self.mappings.lock().contains(&list)
    }

    /// Number of lists this bundle is on
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Snapshot of the mapping set
    pub fn mappings(&self) -> Vec<ListId> {
        self.mappings.lock().iter().copied().collect()
    }

    // --- destruction ------------------------------------------------------

    /// Mark the bundle freed; true only for the first caller
    ///
    /// The caller that wins posts the free event. Subsequent calls are
    /// no-ops so the event fires exactly once.
    pub fn mark_freed(&self) -> bool {
        !self.freed.swap(true, Ordering::SeqCst)
    }

    /// Whether the free event has been posted
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Display for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bundle-{} [{}]", self.id, self.gbof)
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Bundle {}

impl std::hash::Hash for Bundle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bundle(id: u64) -> Bundle {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::now(id),
        );
        Bundle::new(
            id,
            gbof,
            EndpointId::parse("dtn://node-b/sink").unwrap(),
            Payload::memory(&b"payload"[..]),
            3600,
        )
    }

    #[test]
    fn test_bundle_defaults() {
        let b = make_bundle(1);
        assert_eq!(b.priority(), Priority::Normal);
        assert!(!b.custody_requested());
        assert!(!b.is_admin());
        assert!(b.replyto().is_null());
        assert_eq!(b.report_dest(), b.source());
        assert_eq!(b.orig_length(), 7);
        assert!(!b.is_expired());
    }

    #[test]
    fn test_builders() {
        let b = make_bundle(2)
            .with_priority(Priority::Expedited)
            .with_custody()
            .with_do_not_fragment();
        assert_eq!(b.priority(), Priority::Expedited);
        assert!(b.custody_requested());
        assert!(b.do_not_fragment());
    }

    #[test]
    fn test_null_source_constraints() {
        let gbof = GbofId::new(EndpointId::null(), CreationTimestamp::now(1));
        let dest = EndpointId::parse("dtn://node-b/sink").unwrap();

        // Null source with custody requested is invalid
        let bad = Bundle::new(10, gbof.clone(), dest.clone(), Payload::empty(), 60).with_custody();
        assert!(bad.validate().is_err());

        // Null source without do-not-fragment is invalid
        let bad = Bundle::new(11, gbof.clone(), dest.clone(), Payload::empty(), 60);
        assert!(bad.validate().is_err());

        let ok = Bundle::new(12, gbof, dest, Payload::empty(), 60).with_do_not_fragment();
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_mappings() {
        let b = make_bundle(3);
        assert!(b.add_mapping(7));
        assert!(!b.add_mapping(7)); // double add rejected
        assert!(b.is_on_list(7));
        assert_eq!(b.mapping_count(), 1);
        assert!(b.remove_mapping(7));
        assert!(!b.remove_mapping(7));
        assert_eq!(b.mapping_count(), 0);
    }

    #[test]
    fn test_mark_freed_once() {
        let b = make_bundle(4);
        assert!(b.mark_freed());
        assert!(!b.mark_freed());
        assert!(b.is_freed());
    }

    #[test]
    fn test_priority_encoding() {
        for p in [
            Priority::Bulk,
            Priority::Normal,
            Priority::Expedited,
            Priority::Reserved,
        ] {
            assert_eq!(Priority::from_u8(p.as_u8()), p);
        }
    }
}
