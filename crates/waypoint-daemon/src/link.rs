//! Links
//!
//! A link is a one-way forwarding channel to a next-hop node, implemented
//! by a convergence layer. The immutable identity (name, type, next hop,
//! convergence layer, remote endpoint pattern) is fixed at creation; the
//! state machine, queues, counters, and retry interval live behind the
//! link's lock or in atomics.
//!
//! State transitions are driven solely by `LinkStateChangeRequest` events
//! on the main processor; convergence layers post events instead of
//! mutating links directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use waypoint_core::{BundleList, BundleRef, EidPattern};
use waypoint_storage::LinkRecord;

use crate::contact::ContactRef;
use crate::error::DaemonError;

/// Shared handle to a link
pub type LinkRef = Arc<Link>;

/// The four link types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    /// Expected to be open whenever the daemon runs; reopened on failure
    AlwaysOn,
    /// Opened when traffic needs it, may close when idle
    OnDemand,
    /// Availability dictated by a contact schedule
    Scheduled,
    /// Discovered opportunistically; availability set by discovery
    Opportunistic,
}

impl LinkType {
    /// Parse the configuration string form
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alwayson" => Some(LinkType::AlwaysOn),
            "ondemand" => Some(LinkType::OnDemand),
            "scheduled" => Some(LinkType::Scheduled),
            "opportunistic" => Some(LinkType::Opportunistic),
            _ => None,
        }
    }

    /// The configuration string form
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::AlwaysOn => "alwayson",
            LinkType::OnDemand => "ondemand",
            LinkType::Scheduled => "scheduled",
            LinkType::Opportunistic => "opportunistic",
        }
    }
}

/// Link state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Closed and not openable
    Unavailable,
    /// Closed but openable
    Available,
    /// A convergence-layer session is being established
    Opening,
    /// A session is established; the link has a contact
    Open,
}

impl LinkState {
    /// The display string form
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unavailable => "unavailable",
            LinkState::Available => "available",
            LinkState::Opening => "opening",
            LinkState::Open => "open",
        }
    }
}

/// Tunable per-link parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkParams {
    /// Remote endpoint pattern reached over this link
    pub remote_eid: EidPattern,
    /// Whether the convergence layer acknowledges delivery
    pub reliable: bool,
    /// MTU in bytes; bundles larger than this fragment (0 = unlimited)
    pub mtu: u64,
    /// Retry floor, seconds
    pub min_retry_interval: u32,
    /// Retry ceiling, seconds
    pub max_retry_interval: u32,
    /// Close after this many idle seconds (0 = never; required 0 for alwayson)
    pub idle_close_time: u32,
    /// Downtime hint for routers, seconds
    pub potential_downtime: u32,
    /// Emit a previous-hop block on this link
    pub prevhop_hdr: bool,
    /// Routing cost
    pub cost: u32,
    /// Enforce queue watermarks
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

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            remote_eid: EidPattern::parse("dtn://*").expect("valid pattern"),
            reliable: false,
            mtu: 0,
            min_retry_interval: 5,
            max_retry_interval: 600,
            idle_close_time: 0,
            potential_downtime: 30,
            prevhop_hdr: false,
            cost: 0,
            qlimit_enabled: false,
            qlimit_bundles_high: 256,
            qlimit_bytes_high: 16 * 1024 * 1024,
            qlimit_bundles_low: 64,
            qlimit_bytes_low: 4 * 1024 * 1024,
        }
    }
}

impl LinkParams {
    /// Reject invalid parameter combinations for the given link type
    pub fn validate(&self, link_type: LinkType) -> Result<(), DaemonError> {
        if link_type == LinkType::AlwaysOn && self.idle_close_time != 0 {
            return Err(DaemonError::Configuration(
                "alwayson links must have idle_close_time = 0".into(),
            ));
        }
        if self.min_retry_interval == 0 {
            return Err(DaemonError::Configuration(
                "min_retry_interval must be positive".into(),
            ));
        }
        if self.max_retry_interval < self.min_retry_interval {
            return Err(DaemonError::Configuration(
                "max_retry_interval must be >= min_retry_interval".into(),
            ));
        }
        if self.qlimit_enabled
            && (self.qlimit_bundles_low > self.qlimit_bundles_high
                || self.qlimit_bytes_low > self.qlimit_bytes_high)
        {
            return Err(DaemonError::Configuration(
                "queue low watermarks must not exceed high watermarks".into(),
            ));
        }
        Ok(())
    }
}

/// Per-link transmission statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkStats {
    /// Times an open was attempted
    pub contact_attempts: u64,
    /// Times a contact reached the open state
    pub contacts_opened: u64,
    /// Bundles fully transmitted
    pub bundles_transmitted: u64,
    /// Payload bytes transmitted
    pub bytes_transmitted: u64,
    /// Bundles cancelled before transmission
    pub bundles_cancelled: u64,
    /// Accumulated open time, seconds
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct LinkInner {
    state: LinkState,
    deleted: bool,
    usable: bool,
    contact: Option<ContactRef>,
    retry_interval: u32,
}

/// A one-way forwarding channel to a next-hop node
#[derive(Debug)]
pub struct Link {
    name: String,
    link_type: LinkType,
    nexthop: String,
    cl_name: String,
    params: LinkParams,
    inner: Mutex<LinkInner>,
    /// Bundles awaiting transmission
    pub queue: BundleList,
    /// Bundles handed to the convergence layer, not yet acknowledged
    pub inflight: BundleList,
    bundles_queued: AtomicU64,
    bytes_queued: AtomicU64,
    bundles_inflight: AtomicU64,
    bytes_inflight: AtomicU64,
    deferred: Mutex<HashMap<u64, (BundleRef, String)>>,
    stats: Mutex<LinkStats>,
}

impl Link {
    /// Create a link, validating its parameters
    pub fn create(
        name: impl Into<String>,
        link_type: LinkType,
        nexthop: impl Into<String>,
        cl_name: impl Into<String>,
        params: LinkParams,
    ) -> Result<LinkRef, DaemonError> {
        params.validate(link_type)?;
        let name = name.into();
        let initial_state = match link_type {
            // A demand-opened link starts openable; everything else waits
            // for its trigger (admin up, schedule, discovery)
            LinkType::OnDemand | LinkType::AlwaysOn => LinkState::Available,
            LinkType::Scheduled | LinkType::Opportunistic => LinkState::Unavailable,
        };
        Ok(Arc::new(Self {
            queue: BundleList::new(format!("{name}:queue")),
            inflight: BundleList::new(format!("{name}:inflight")),
            inner: Mutex::new(LinkInner {
                state: initial_state,
                deleted: false,
                usable: true,
                contact: None,
                retry_interval: params.min_retry_interval,
            }),
            name,
            link_type,
            nexthop: nexthop.into(),
            cl_name: cl_name.into(),
            params,
            bundles_queued: AtomicU64::new(0),
            bytes_queued: AtomicU64::new(0),
            bundles_inflight: AtomicU64::new(0),
            bytes_inflight: AtomicU64::new(0),
            deferred: Mutex::new(HashMap::new()),
            stats: Mutex::new(LinkStats::default()),
        }))
    }

    /// Unique link name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link type
    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Next-hop address for the convergence layer
    pub fn nexthop(&self) -> &str {
        &self.nexthop
    }

    /// Convergence layer name
    pub fn cl_name(&self) -> &str {
        &self.cl_name
    }

    /// Tunable parameters
    pub fn params(&self) -> &LinkParams {
        &self.params
    }

    // --- state machine ----------------------------------------------------

    /// Current state
    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Whether a contact is open
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == LinkState::Open
    }

    /// Whether the link is openable or better
    pub fn is_available(&self) -> bool {
        self.inner.lock().state != LinkState::Unavailable
    }

    /// Whether the link has been removed from service
    pub fn is_deleted(&self) -> bool {
        self.inner.lock().deleted
    }

    /// Whether the router may use the link
    pub fn is_usable(&self) -> bool {
        let inner = self.inner.lock();
        inner.usable && !inner.deleted
    }

    /// Set router usability
    pub fn set_usable(&self, usable: bool) {
        self.inner.lock().usable = usable;
    }

    /// Remove the link from service
    pub fn mark_deleted(&self) {
        self.inner.lock().deleted = true;
    }

    /// The open contact, if any
    pub fn contact(&self) -> Option<ContactRef> {
        self.inner.lock().contact.clone()
    }

    /// Transition to a new state, maintaining `open <=> contact present`
    ///
    /// Only the daemon's link state machine calls this.
    pub(crate) fn set_state(&self, state: LinkState, contact: Option<ContactRef>) {
        let mut inner = self.inner.lock();
        debug_assert!(
            (state == LinkState::Open) == contact.is_some(),
            "contact present iff open"
        );
        inner.state = state;
        inner.contact = contact;
    }

    // --- retry backoff ----------------------------------------------------

    /// Current retry interval, seconds
    pub fn retry_interval(&self) -> u32 {
        self.inner.lock().retry_interval
    }

    /// Double the retry interval up to the configured ceiling
    pub fn backoff_retry(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.retry_interval = inner
            .retry_interval
            .saturating_mul(2)
            .min(self.params.max_retry_interval);
        inner.retry_interval
    }

    /// Reset the retry interval to the floor (successful open)
    pub fn reset_retry(&self) {
        self.inner.lock().retry_interval = self.params.min_retry_interval;
    }

    // --- queues and backpressure -------------------------------------------

    /// Bundles awaiting transmission
    pub fn bundles_queued(&self) -> u64 {
        self.bundles_queued.load(Ordering::Relaxed)
    }

    /// Payload bytes awaiting transmission
    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued.load(Ordering::Relaxed)
    }

    /// Bundles handed to the convergence layer
    pub fn bundles_inflight(&self) -> u64 {
        self.bundles_inflight.load(Ordering::Relaxed)
    }

    /// Payload bytes handed to the convergence layer
    pub fn bytes_inflight(&self) -> u64 {
        self.bytes_inflight.load(Ordering::Relaxed)
    }

    /// Whether admission is above the high watermarks
    pub fn queue_is_full(&self) -> bool {
        if !self.params.qlimit_enabled {
            return false;
        }
        self.bundles_queued() > self.params.qlimit_bundles_high
            || self.bytes_queued() > self.params.qlimit_bytes_high
    }

    /// Whether admission is below both low watermarks
    pub fn queue_has_space(&self) -> bool {
        if !self.params.qlimit_enabled {
            return true;
        }
        self.bundles_queued() < self.params.qlimit_bundles_low
            && self.bytes_queued() < self.params.qlimit_bytes_low
    }

    /// Append to the transmission queue, updating counters
    pub fn add_to_queue(&self, bundle: &BundleRef) -> bool {
        if !self.queue.push_back(bundle.clone()) {
            return false;
        }
        self.bundles_queued.fetch_add(1, Ordering::Relaxed);
        self.bytes_queued
            .fetch_add(bundle.payload_len(), Ordering::Relaxed);
        true
    }

    /// Remove from the transmission queue, updating counters
    pub fn del_from_queue(&self, bundle: &BundleRef) -> bool {
        if !self.queue.erase(bundle) {
            return false;
        }
        self.bundles_queued.fetch_sub(1, Ordering::Relaxed);
        self.bytes_queued
            .fetch_sub(bundle.payload_len(), Ordering::Relaxed);
        true
    }

    /// Append to the in-flight list, updating counters
    pub fn add_to_inflight(&self, bundle: &BundleRef) -> bool {
        if !self.inflight.push_back(bundle.clone()) {
            return false;
        }
        self.bundles_inflight.fetch_add(1, Ordering::Relaxed);
        self.bytes_inflight
            .fetch_add(bundle.payload_len(), Ordering::Relaxed);
        true
    }

    /// Remove from the in-flight list, updating counters
    pub fn del_from_inflight(&self, bundle: &BundleRef) -> bool {
        if !self.inflight.erase(bundle) {
            return false;
        }
        self.bundles_inflight.fetch_sub(1, Ordering::Relaxed);
        self.bytes_inflight
            .fetch_sub(bundle.payload_len(), Ordering::Relaxed);
        true
    }

    // --- deferred bundles --------------------------------------------------

    /// Record a bundle the router deferred for this link
    ///
    /// Returns the deferred count after insertion.
    pub fn defer_bundle(&self, bundle: &BundleRef, reason: impl Into<String>) -> usize {
        let mut deferred = self.deferred.lock();
        deferred.insert(bundle.id(), (bundle.clone(), reason.into()));
        deferred.len()
    }

    /// Drop a bundle from the deferred set
    pub fn undefer_bundle(&self, bundle_id: u64) -> bool {
        self.deferred.lock().remove(&bundle_id).is_some()
    }

    /// Number of deferred bundles
    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Snapshot of the deferred set
    pub fn deferred_bundles(&self) -> Vec<BundleRef> {
        self.deferred.lock().values().map(|(b, _)| b.clone()).collect()
    }

    // --- statistics --------------------------------------------------------

    /// Mutate the statistics under the stats lock
    pub fn update_stats(&self, f: impl FnOnce(&mut LinkStats)) {
        f(&mut self.stats.lock());
    }

    /// Snapshot the statistics
    pub fn stats(&self) -> LinkStats {
        *self.stats.lock()
    }

    /// The durable record form of this link
    pub fn to_record(&self) -> LinkRecord {
        LinkRecord {
            name: self.name.clone(),
            link_type: self.link_type.as_str().to_string(),
            nexthop: self.nexthop.clone(),
            cl_name: self.cl_name.clone(),
            remote_eid: self.params.remote_eid.as_str().to_string(),
            reliable: self.params.reliable,
            mtu: self.params.mtu,
            min_retry_interval: self.params.min_retry_interval,
            max_retry_interval: self.params.max_retry_interval,
            idle_close_time: self.params.idle_close_time,
            potential_downtime: self.params.potential_downtime,
            prevhop_hdr: self.params.prevhop_hdr,
            cost: self.params.cost,
            qlimit_enabled: self.params.qlimit_enabled,
            qlimit_bundles_high: self.params.qlimit_bundles_high,
            qlimit_bytes_high: self.params.qlimit_bytes_high,
            qlimit_bundles_low: self.params.qlimit_bundles_low,
            qlimit_bytes_low: self.params.qlimit_bytes_low,
        }
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "link {} ({} via {}, {})",
            self.name,
            self.link_type.as_str(),
            self.cl_name,
            self.state().as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Contact;
    use std::sync::Arc;
    use waypoint_core::{
        Bundle, CreationTimestamp, EndpointId, GbofId, Payload,
    };

    fn make_link(link_type: LinkType, params: LinkParams) -> LinkRef {
        Link::create("uplink", link_type, "10.0.0.2:4556", "tcp", params).unwrap()
    }

    fn make_bundle(id: u64, payload_len: usize) -> BundleRef {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, id),
        );
        Arc::new(Bundle::new(
            id,
            gbof,
            EndpointId::parse("dtn://node-b/sink").unwrap(),
            Payload::memory(vec![0u8; payload_len]),
            3600,
        ))
    }

    #[test]
    fn test_initial_states_by_type() {
        assert_eq!(
            make_link(LinkType::OnDemand, LinkParams::default()).state(),
            LinkState::Available
        );
        assert_eq!(
            make_link(LinkType::Opportunistic, LinkParams::default()).state(),
            LinkState::Unavailable
        );
    }

    #[test]
    fn test_alwayson_rejects_idle_close() {
        let params = LinkParams {
            idle_close_time: 30,
            ..Default::default()
        };
        assert!(Link::create("l", LinkType::AlwaysOn, "x", "tcp", params).is_err());
    }

    #[test]
    fn test_open_iff_contact() {
        let link = make_link(LinkType::OnDemand, LinkParams::default());
        assert!(link.contact().is_none());

        link.set_state(LinkState::Open, Some(Contact::new("uplink")));
        assert!(link.is_open());
        assert!(link.contact().is_some());

        link.set_state(LinkState::Available, None);
        assert!(!link.is_open());
        assert!(link.contact().is_none());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        let params = LinkParams {
            min_retry_interval: 5,
            max_retry_interval: 35,
            ..Default::default()
        };
        let link = make_link(LinkType::OnDemand, params);

        assert_eq!(link.retry_interval(), 5);
        assert_eq!(link.backoff_retry(), 10);
        assert_eq!(link.backoff_retry(), 20);
        assert_eq!(link.backoff_retry(), 35); // capped
        assert_eq!(link.backoff_retry(), 35);

        link.reset_retry();
        assert_eq!(link.retry_interval(), 5);
    }

    #[test]
    fn test_queue_counters_match_contents() {
        let link = make_link(LinkType::OnDemand, LinkParams::default());
        let a = make_bundle(1, 100);
        let b = make_bundle(2, 200);

        link.add_to_queue(&a);
        link.add_to_queue(&b);
        assert_eq!(link.bundles_queued(), 2);
        assert_eq!(link.bytes_queued(), 300);
        assert_eq!(link.queue.len(), 2);

        link.del_from_queue(&a);
        assert_eq!(link.bundles_queued(), 1);
        assert_eq!(link.bytes_queued(), 200);

        link.add_to_inflight(&b);
        link.del_from_queue(&b);
        assert_eq!(link.bundles_inflight(), 1);
        assert_eq!(link.bytes_inflight(), 200);
    }

    #[test]
    fn test_watermarks() {
        let params = LinkParams {
            qlimit_enabled: true,
            qlimit_bundles_high: 2,
            qlimit_bytes_high: 1000,
            qlimit_bundles_low: 1,
            qlimit_bytes_low: 500,
            ..Default::default()
        };
        let link = make_link(LinkType::OnDemand, params);

        assert!(!link.queue_is_full());
        assert!(link.queue_has_space());

        link.add_to_queue(&make_bundle(1, 100));
        assert!(!link.queue_is_full());
        assert!(!link.queue_has_space()); // at the low bundle watermark

        link.add_to_queue(&make_bundle(2, 100));
        link.add_to_queue(&make_bundle(3, 100));
        assert!(link.queue_is_full()); // past the high bundle watermark
    }

    #[test]
    fn test_deferred_set() {
        let link = make_link(LinkType::OnDemand, LinkParams::default());
        let bundle = make_bundle(1, 10);

        assert_eq!(link.defer_bundle(&bundle, "no contact"), 1);
        assert_eq!(link.deferred_count(), 1);
        assert!(link.undefer_bundle(1));
        assert!(!link.undefer_bundle(1));
        assert_eq!(link.deferred_count(), 0);
    }
}
