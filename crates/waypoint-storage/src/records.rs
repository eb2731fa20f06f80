//! Persisted record types
//!
//! One serde record per durable table, encoded with postcard. Records are
//! deliberately plain data - the daemon's live types convert to and from
//! them at the storage boundary.

use serde::{Deserialize, Serialize};

use waypoint_core::{
    Bundle, BundleRef, EndpointId, ForwardingLog, GbofId, Payload, PayloadLocation, Priority,
    ReportFlags,
};

/// The durable form of a bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Node-local bundle id (the table key)
    pub id: u64,
    /// Globally-unique identity
    pub gbof: GbofId,
    /// Destination endpoint
    pub dest: EndpointId,
    /// Reply-to endpoint
    pub replyto: EndpointId,
    /// Current custodian endpoint
    pub custodian: EndpointId,
    /// Previous hop, when one was recorded
    pub prevhop: Option<EndpointId>,
    /// Class of service
    pub priority: Priority,
    /// Administrative-record flag
    pub is_admin: bool,
    /// Must-not-fragment flag
    pub do_not_fragment: bool,
    /// Custody-requested flag
    pub custody_requested: bool,
    /// Singleton-destination flag
    pub singleton_dest: bool,
    /// Report-request flags
    pub reports: ReportFlags,
    /// Lifetime in seconds
    pub expiration_secs: u64,
    /// Total ADU length
    pub orig_length: u64,
    /// Durable payload length
    pub payload_len: u64,
    /// Accumulated age seconds
    pub age_secs: u64,
    /// Whether this node holds custody
    pub local_custody: bool,
    /// Allocated custody id (0 = none)
    pub custody_id: u64,
    /// Whether a valid CTEB was received
    pub cteb_valid: bool,
    /// The previous custodian's custody id
    pub cteb_custody_id: u64,
    /// Forwarding decisions and outcomes
    pub fwdlog: ForwardingLog,
}

impl BundleRecord {
    /// Snapshot a live bundle into its durable form
    pub fn from_bundle(bundle: &BundleRef) -> Self {
        let state = bundle.state();
        Self {
            id: bundle.id(),
            gbof: bundle.gbof().clone(),
            dest: bundle.dest().clone(),
            replyto: bundle.replyto().clone(),
            custodian: state.custodian.clone(),
            prevhop: state.prevhop.clone(),
            priority: bundle.priority(),
            is_admin: bundle.is_admin(),
            do_not_fragment: bundle.do_not_fragment(),
            custody_requested: bundle.custody_requested(),
            singleton_dest: bundle.singleton_dest(),
            reports: bundle.reports(),
            expiration_secs: bundle.expiration_secs(),
            orig_length: bundle.orig_length(),
            payload_len: state.payload.len(),
            age_secs: state.age_secs,
            local_custody: state.local_custody,
            custody_id: state.custody_id,
            cteb_valid: state.cteb_valid,
            cteb_custody_id: state.cteb_custody_id,
            fwdlog: state.fwdlog.clone(),
        }
    }

    /// Reconstruct a live bundle around the given payload handle
    ///
    /// Reloaded bundles mark their payload space as already reserved, so
    /// quota accounting is idempotent across restarts.
    pub fn into_bundle(self, payload: Payload) -> Bundle {
        let space_reserved = payload.location() == PayloadLocation::Disk;
        let mut bundle = Bundle::new(
            self.id,
            self.gbof,
            self.dest,
            payload,
            self.expiration_secs,
        )
        .with_priority(self.priority)
        .with_singleton(self.singleton_dest)
        .with_replyto(self.replyto)
        .with_reports(self.reports)
        .with_orig_length(self.orig_length);
        if self.is_admin {
            bundle = bundle.with_admin();
        }
        if self.do_not_fragment {
            bundle = bundle.with_do_not_fragment();
        }
        if self.custody_requested {
            bundle = bundle.with_custody();
        }

        {
            let mut state = bundle.state();
            state.custodian = self.custodian;
            state.prevhop = self.prevhop;
            state.local_custody = self.local_custody;
            state.custody_id = self.custody_id;
            state.cteb_valid = self.cteb_valid;
            state.cteb_custody_id = self.cteb_custody_id;
            state.age_secs = self.age_secs;
            state.fwdlog = self.fwdlog;
            state.space_reserved = space_reserved;
        }
        bundle
    }
}

/// Denormalized bundle columns for external inspection
///
/// Kept in step with [`BundleRecord`] on every add/update/delete; nothing
/// in the daemon reads it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDetailRecord {
    /// Node-local bundle id
    pub bundle_id: u64,
    /// GBOF key string
    pub gbof_key: String,
    /// Source endpoint string
    pub source: String,
    /// Destination endpoint string
    pub dest: String,
    /// Class of service
    pub priority: Priority,
    /// Durable payload length
    pub payload_len: u64,
    /// Whether the bundle is a fragment
    pub is_fragment: bool,
    /// Fragment offset
    pub frag_offset: u64,
    /// Fragment payload length
    pub frag_length: u64,
    /// Creation time, DTN-epoch seconds
    pub creation_secs: u64,
    /// Lifetime in seconds
    pub expiration_secs: u64,
    /// Whether this node holds custody
    pub local_custody: bool,
}

impl BundleDetailRecord {
    /// Derive the detail row from the durable record
    pub fn from_record(record: &BundleRecord) -> Self {
        Self {
            bundle_id: record.id,
            gbof_key: record.gbof.to_key(),
            source: record.gbof.source.as_str().to_string(),
            dest: record.dest.as_str().to_string(),
            priority: record.priority,
            payload_len: record.payload_len,
            is_fragment: record.gbof.is_fragment,
            frag_offset: record.gbof.frag_offset,
            frag_length: record.gbof.frag_length,
            creation_secs: record.gbof.creation_ts.secs,
            expiration_secs: record.expiration_secs,
            local_custody: record.local_custody,
        }
    }
}

/// The durable form of a link definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Unique link name (the table key)
    pub name: String,
    /// Link type string (alwayson, ondemand, scheduled, opportunistic)
    pub link_type: String,
    /// Next-hop address understood by the convergence layer
    pub nexthop: String,
    /// Convergence layer name
    pub cl_name: String,
    /// Remote endpoint pattern
    pub remote_eid: String,
    /// Whether the convergence layer is reliable
    pub reliable: bool,
    /// MTU in bytes (0 = unlimited)
    pub mtu: u64,
    /// Minimum retry interval seconds
    pub min_retry_interval: u32,
    /// Maximum retry interval seconds
    pub max_retry_interval: u32,
    /// Idle close time seconds (0 = never)
    pub idle_close_time: u32,
    /// Potential downtime hint for routers, seconds
    pub potential_downtime: u32,
    /// Whether to emit a previous-hop block on this link
    pub prevhop_hdr: bool,
    /// Routing cost
    pub cost: u32,
    /// Whether queue limits are enforced
    pub qlimit_enabled: bool,
    /// High watermark, bundles
    pub qlimit_bundles_high: u64,
    /// High watermark, bytes
    pub qlimit_bytes_high: u64,
    /// Low watermark, bundles
    pub qlimit_bundles_low: u64,
    /// Low watermark, bytes
    pub qlimit_bytes_low: u64,
}

/// The durable form of a registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Unique registration id (the table key)
    pub regid: u32,
    /// Endpoint pattern string
    pub pattern: String,
    /// Failure action: 0 defer, 1 drop, 2 exec
    pub failure_action: u8,
    /// Script to run for the exec failure action
    pub script: Option<String>,
    /// Expiration, seconds from creation (0 = never)
    pub expiration_secs: u64,
    /// DTN-epoch second the registration was created
    pub created_secs: u64,
}

/// A pending aggregate custody signal, persisted to survive restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAcsRecord {
    /// Custodian the signal will be sent to
    pub custodian: String,
    /// Whether the covered transfers succeeded
    pub succeeded: bool,
    /// Shared reason code
    pub reason: u8,
    /// Covered custody ids, ascending
    pub ids: Vec<u64>,
}

impl PendingAcsRecord {
    /// Composite table key: custodian, succeeded, reason
    pub fn key(&self) -> Vec<u8> {
        Self::key_for(&self.custodian, self.succeeded, self.reason)
    }

    /// Build the composite key from parts
    pub fn key_for(custodian: &str, succeeded: bool, reason: u8) -> Vec<u8> {
        let mut key = custodian.as_bytes().to_vec();
        key.push(0);
        key.push(succeeded as u8);
        key.push(reason);
        key
    }
}
