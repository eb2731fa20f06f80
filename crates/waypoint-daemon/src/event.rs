//! The daemon event taxonomy
//!
//! Every state change in the node is an event on one of the five
//! processor queues. An event declares which processor handles it; the
//! `daemon_only` flag suppresses forwarding to routers after handling.

use bytes::Bytes;
use tokio::sync::oneshot;

use waypoint_codec::{AggregateCustodySignal, CustodySignal, StatusReason};
use waypoint_core::{BundleRef, EndpointId, ForwardingAction};
use waypoint_routing::RouteEntry;

use crate::link::LinkState;
use crate::stats::DaemonStatsSnapshot;

/// The five event processors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Processor {
    /// Central dispatcher and state machine owner
    Main,
    /// Arrival validation, dedup, block consumption
    Input,
    /// Serialization and convergence-layer handoff
    Output,
    /// Asynchronous persistence
    Storage,
    /// Aggregate custody signal batching
    Acs,
}

/// Where a received bundle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// A convergence layer (network arrival)
    Peer,
    /// A local application registration
    App,
    /// Reloaded from the durable store at startup
    Store,
    /// Generated by this node (admin records, fragments, reassembly)
    Admin,
}

/// Reason attached to contact and link state events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactReason {
    /// No information
    NoInfo,
    /// Administrative action
    User,
    /// The underlying session broke
    Broken,
    /// The daemon is shutting down
    Shutdown,
    /// Closed for idleness
    Idle,
    /// The open attempt timed out
    Timeout,
}

/// A daemon event
///
/// The taxonomy mirrors the node's externally meaningful state changes;
/// a few variants are internal plumbing between processors (and say so).
#[derive(Debug)]
pub enum BundleEvent {
    // --- bundle arrival and disposition ---------------------------------
    /// A bundle arrived (network, application, reload, or self-generated)
    BundleReceived {
        bundle: BundleRef,
        source: EventSource,
        /// Receiving link for network arrivals
        link: Option<String>,
    },
    /// The router chose a link for a bundle
    BundleSend {
        bundle: BundleRef,
        link: String,
        action: ForwardingAction,
    },
    /// Internal: main handed a queued bundle to the output processor
    BundleTransmitReady { bundle: BundleRef, link: String },
    /// The convergence layer finished (or partially finished) transmission
    BundleTransmitted {
        bundle: BundleRef,
        link: String,
        bytes_sent: u64,
        reliably: bool,
    },
    /// A bundle was handed to a local registration
    BundleDelivered { bundle: BundleRef, regid: u32 },
    /// Internal: deliver a bundle to a specific registration
    DeliverBundleToReg { bundle: BundleRef, regid: u32 },
    /// A bundle's lifetime elapsed
    BundleExpired { bundle: BundleRef },
    /// The last holder of a bundle let go; delete it from the store
    BundleFree { bundle: BundleRef },
    /// Cancel a bundle's transmission on a link
    BundleCancel { bundle: BundleRef, link: String },
    /// A queued or in-flight transmission was cancelled
    BundleSendCancelled { bundle: BundleRef, link: String },
    /// Ask the daemon to delete a bundle
    BundleDelete {
        bundle: BundleRef,
        reason: StatusReason,
    },
    /// Request creation of a new bundle (external router / admin surface)
    BundleInject {
        dest: EndpointId,
        payload: Bytes,
        expiration_secs: u64,
        custody: bool,
    },
    /// A requested injection completed
    BundleInjected { bundle: BundleRef },
    /// Ask the router whether to accept an inbound bundle, with a reply
    BundleAcceptRequest {
        bundle: BundleRef,
        reply: oneshot::Sender<Result<(), StatusReason>>,
    },
    /// A reassembly completed; the synthesized original follows the
    /// arrival path
    ReassemblyCompleted { bundle: BundleRef },

    // --- custody ---------------------------------------------------------
    /// Take custody of a bundle (router accepted)
    BundleTakeCustody { bundle: BundleRef },
    /// Custody was accepted locally
    BundleCustodyAccepted { bundle: BundleRef, custody_id: u64 },
    /// A custody signal arrived
    CustodySignal { signal: CustodySignal },
    /// A custody timer fired
    CustodyTimeout {
        bundle_id: u64,
        link: String,
        retries: u32,
    },
    /// An aggregate custody signal arrived
    AggregateCustodySignal { signal: AggregateCustodySignal },
    /// Batch a custody acknowledgement into the pending ACS set
    IssueAggregateCustodySignal {
        custodian: String,
        succeeded: bool,
        reason: u8,
        custody_id: u64,
    },
    /// A pending ACS window elapsed; flush it
    AcsExpired {
        custodian: String,
        succeeded: bool,
        reason: u8,
    },

    // --- links and contacts ----------------------------------------------
    /// A contact reached the open state
    ContactUp { link: String },
    /// A contact ended
    ContactDown { link: String, reason: ContactReason },
    /// A link was created
    LinkCreated { link: String },
    /// A link was deleted
    LinkDeleted { link: String },
    /// A link became available
    LinkAvailable { link: String, reason: ContactReason },
    /// A link became unavailable
    LinkUnavailable { link: String, reason: ContactReason },
    /// Request a link state transition (the only way state changes)
    LinkStateChangeRequest {
        link: String,
        state: LinkState,
        reason: ContactReason,
    },
    /// The deferred-bundle timer ticked; let the router re-evaluate
    LinkCheckDeferred { link: String },
    /// Drain a link's queue and in-flight list
    LinkCancelAllBundles { link: String },

    // --- registrations ----------------------------------------------------
    /// A registration was added
    RegistrationAdded { regid: u32 },
    /// A registration was removed
    RegistrationRemoved { regid: u32 },
    /// A registration expired
    RegistrationExpired { regid: u32 },

    // --- routes ------------------------------------------------------------
    /// Add a route
    RouteAdd { entry: RouteEntry },
    /// Delete routes by pattern string
    RouteDel { pattern: String },
    /// Re-evaluate pending bundles against the route table
    RouteRecompute,

    // --- storage -----------------------------------------------------------
    /// Persist (or re-persist) a bundle
    StoreBundleUpdate { bundle: BundleRef },
    /// Remove a bundle from the store
    StoreBundleDelete { bundle: BundleRef },
    /// Persist a link definition
    StoreLinkUpdate { link: String },
    /// Remove a link definition
    StoreLinkDelete { link: String },
    /// Persist a registration
    StoreRegistrationUpdate { regid: u32 },
    /// Remove a registration
    StoreRegistrationDelete { regid: u32 },

    // --- daemon ------------------------------------------------------------
    /// Begin orderly shutdown
    ShutdownRequest,
    /// Query daemon counters, with a reply
    StatusRequest {
        reply: oneshot::Sender<DaemonStatsSnapshot>,
    },
}

impl BundleEvent {
    /// The processor that handles this event
    pub fn processor(&self) -> Processor {
        use BundleEvent::*;
        match self {
            BundleReceived { .. } | ReassemblyCompleted { .. } => Processor::Input,
            BundleTransmitReady { .. } => Processor::Output,
            StoreBundleUpdate { .. }
            | StoreBundleDelete { .. }
            | StoreLinkUpdate { .. }
            | StoreLinkDelete { .. }
            | StoreRegistrationUpdate { .. }
            | StoreRegistrationDelete { .. } => Processor::Storage,
            IssueAggregateCustodySignal { .. } | AcsExpired { .. } => Processor::Acs,
            _ => Processor::Main,
        }
    }

    /// Whether routers should not see this event
    pub fn daemon_only(&self) -> bool {
        use BundleEvent::*;
        !matches!(
            self,
            BundleReceived { .. }
                | BundleTransmitted { .. }
                | BundleDelivered { .. }
                | BundleExpired { .. }
                | BundleInjected { .. }
                | BundleSendCancelled { .. }
                | BundleCustodyAccepted { .. }
                | ReassemblyCompleted { .. }
                | ContactUp { .. }
                | ContactDown { .. }
                | LinkCreated { .. }
                | LinkDeleted { .. }
                | LinkAvailable { .. }
                | LinkUnavailable { .. }
                | LinkCheckDeferred { .. }
                | RegistrationAdded { .. }
                | RegistrationRemoved { .. }
                | RegistrationExpired { .. }
                | RouteAdd { .. }
                | RouteDel { .. }
                | RouteRecompute
                | CustodyTimeout { .. }
        )
    }

    /// Short name for logs
    pub fn type_str(&self) -> &'static str {
        use BundleEvent::*;
        match self {
            BundleReceived { .. } => "bundle_received",
            BundleSend { .. } => "bundle_send",
            BundleTransmitReady { .. } => "bundle_transmit_ready",
            BundleTransmitted { .. } => "bundle_transmitted",
            BundleDelivered { .. } => "bundle_delivered",
            DeliverBundleToReg { .. } => "deliver_bundle_to_reg",
            BundleExpired { .. } => "bundle_expired",
            BundleFree { .. } => "bundle_free",
            BundleCancel { .. } => "bundle_cancel",
            BundleSendCancelled { .. } => "bundle_send_cancelled",
            BundleDelete { .. } => "bundle_delete",
            BundleInject { .. } => "bundle_inject",
            BundleInjected { .. } => "bundle_injected",
            BundleAcceptRequest { .. } => "bundle_accept_request",
            ReassemblyCompleted { .. } => "reassembly_completed",
            BundleTakeCustody { .. } => "bundle_take_custody",
            BundleCustodyAccepted { .. } => "bundle_custody_accepted",
            CustodySignal { .. } => "custody_signal",
            CustodyTimeout { .. } => "custody_timeout",
            AggregateCustodySignal { .. } => "aggregate_custody_signal",
            IssueAggregateCustodySignal { .. } => "issue_aggregate_custody_signal",
            AcsExpired { .. } => "acs_expired",
            ContactUp { .. } => "contact_up",
            ContactDown { .. } => "contact_down",
            LinkCreated { .. } => "link_created",
            LinkDeleted { .. } => "link_deleted",
            LinkAvailable { .. } => "link_available",
            LinkUnavailable { .. } => "link_unavailable",
            LinkStateChangeRequest { .. } => "link_state_change_request",
            LinkCheckDeferred { .. } => "link_check_deferred",
            LinkCancelAllBundles { .. } => "link_cancel_all_bundles",
            RegistrationAdded { .. } => "registration_added",
            RegistrationRemoved { .. } => "registration_removed",
            RegistrationExpired { .. } => "registration_expired",
            RouteAdd { .. } => "route_add",
            RouteDel { .. } => "route_del",
            RouteRecompute => "route_recompute",
            StoreBundleUpdate { .. } => "store_bundle_update",
            StoreBundleDelete { .. } => "store_bundle_delete",
            StoreLinkUpdate { .. } => "store_link_update",
            StoreLinkDelete { .. } => "store_link_delete",
            StoreRegistrationUpdate { .. } => "store_registration_update",
            StoreRegistrationDelete { .. } => "store_registration_delete",
            ShutdownRequest => "shutdown_request",
            StatusRequest { .. } => "status_request",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypoint_core::{Bundle, CreationTimestamp, GbofId, Payload};

    fn make_bundle() -> BundleRef {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, 1),
        );
        Arc::new(Bundle::new(
            1,
            gbof,
            EndpointId::parse("dtn://node-b/sink").unwrap(),
            Payload::empty(),
            60,
        ))
    }

    #[test]
    fn test_processor_assignment() {
        let bundle = make_bundle();
        assert_eq!(
            BundleEvent::BundleReceived {
                bundle: bundle.clone(),
                source: EventSource::Peer,
                link: None
            }
            .processor(),
            Processor::Input
        );
        assert_eq!(
            BundleEvent::StoreBundleUpdate {
                bundle: bundle.clone()
            }
            .processor(),
            Processor::Storage
        );
        assert_eq!(
            BundleEvent::AcsExpired {
                custodian: "ipn:1.0".into(),
                succeeded: true,
                reason: 0
            }
            .processor(),
            Processor::Acs
        );
        assert_eq!(BundleEvent::ShutdownRequest.processor(), Processor::Main);
    }

    #[test]
    fn test_daemon_only_flags() {
        let bundle = make_bundle();
        assert!(!BundleEvent::BundleDelivered { bundle: bundle.clone(), regid: 1 }.daemon_only());
        assert!(BundleEvent::BundleFree { bundle }.daemon_only());
        assert!(BundleEvent::ShutdownRequest.daemon_only());
    }
}
