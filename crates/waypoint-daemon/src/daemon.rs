//! The bundle daemon
//!
//! [`DaemonCore`] owns every piece of node state - the bundle collections,
//! links, registrations, routes, custody state, and the event bus - and
//! the main processor's event handlers. The other processors (input,
//! output, storage, ACS) run against the same core from their own tasks;
//! see the sibling modules.
//!
//! Construction order: store, event bus, core, router, convergence
//! layers, registrations - then [`BundleDaemon::launch`] starts the
//! processor tasks and reloads persisted state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use waypoint_codec::{
    AdminRecord, CustodySignal, CustodySignalReason, StatusReason, StatusReport,
    FragmentInfo,
};
use waypoint_core::{
    Bundle, BundleIntMap, BundleList, BundleRef, BundleStrMultiMap, CreationTimestamp,
    EndpointId, ForwardingAction, ForwardingState, GbofId, Payload, Priority, ReportFlags,
};
use waypoint_routing::RouteTable;
use waypoint_storage::{BundleStore, BundleStoreConfig};

use crate::acs::AcsEngine;
use crate::bus::{EventBus, EventEnvelope, ProcessorQueues};
use crate::clayer::ConvergenceLayer;
use crate::config::NodeConfig;
use crate::contact::Contact;
use crate::custody::CustodyTimers;
use crate::event::{BundleEvent, ContactReason, EventSource, Processor};
use crate::error::{DaemonError, DaemonResult};
use crate::fragmentation::ReassemblyTracker;
use crate::link::{LinkRef, LinkState, LinkType};
use crate::registration::{FailureAction, Registration, RegistrationTable};
use crate::router::Router;
use crate::stats::{DaemonStats, DaemonStatsSnapshot};

/// Options for locally submitted bundles
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Source endpoint (defaults to the node EID)
    pub source: Option<EndpointId>,
    /// Reply-to endpoint
    pub replyto: Option<EndpointId>,
    /// Class of service
    pub priority: Priority,
    /// Request custody transfer
    pub custody: bool,
    /// Report-request flags
    pub reports: ReportFlags,
    /// Forbid fragmentation
    pub do_not_fragment: bool,
    /// Singleton destination
    pub singleton: bool,
    /// Lifetime in seconds
    pub expiration_secs: u64,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            source: None,
            replyto: None,
            priority: Priority::Normal,
            custody: false,
            reports: ReportFlags::default(),
            do_not_fragment: false,
            singleton: true,
            expiration_secs: 3600,
        }
    }
}

/// Which status-report assertion a report carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Bundle reception
    Received,
    /// Custody acceptance
    CustodyAccepted,
    /// Forwarding
    Forwarded,
    /// Delivery
    Delivered,
    /// Deletion
    Deleted,
}

/// The daemon's shared state and main-processor logic
pub struct DaemonCore {
    config: NodeConfig,
    local_eid: EndpointId,
    store: Arc<BundleStore>,
    bus: EventBus,

    /// Every live bundle, by node-local id
    pub all_bundles: BundleIntMap,
    /// Bundles awaiting routing, delivery, or expiration
    pub pending_bundles: BundleList,
    /// Bundles this node holds custody of, by custody id
    pub custody_bundles: BundleIntMap,
    /// Duplicate detection by GBOF key
    pub dupefinder: BundleStrMultiMap,

    links: DashMap<String, LinkRef>,
    /// Local delivery registrations
    pub regs: RegistrationTable,
    /// The route table
    pub routes: RouteTable,
    router: OnceLock<Arc<dyn Router>>,
    cls: DashMap<String, Arc<dyn ConvergenceLayer>>,

    /// Armed custody timers
    pub custody_timers: CustodyTimers,
    /// Pending aggregate custody signals
    pub acs: AcsEngine,
    /// Partially reassembled bundles
    pub reassembly: ReassemblyTracker,

    expiry_timers: DashMap<u64, AbortHandle>,
    deferred_tickers: DashMap<String, AbortHandle>,

    /// Daemon counters
    pub stats: DaemonStats,
    next_bundle_id: AtomicU64,
    next_custody_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl DaemonCore {
    /// Build the core: open the store and create the bus
    ///
    /// Bundle and custody id allocation resumes past the highest persisted
    /// ids, so reloaded state stays consistent.
    pub fn new(config: NodeConfig) -> DaemonResult<(Arc<Self>, ProcessorQueues)> {
        let store = Arc::new(BundleStore::open(BundleStoreConfig {
            db_path: config.storage.db_path.clone(),
            payload_dir: config.storage.payload_dir.clone(),
            payload_quota: config.storage.payload_quota,
            fd_cache_capacity: config.storage.fd_cache_capacity,
        })?);
        let (max_bundle_id, max_custody_id) = store.max_ids()?;

        let (bus, queues) = EventBus::new(config.event_queue_capacity);
        let (shutdown_tx, _) = broadcast::channel(4);

        let core = Arc::new(Self {
            local_eid: config.local_eid.clone(),
            routes: RouteTable::new(config.max_route_to_chain),
            custody_timers: CustodyTimers::new(config.custody.clone()),
            acs: AcsEngine::new(config.acs.clone()),
            config,
            store,
            bus,
            all_bundles: BundleIntMap::new("all_bundles"),
            pending_bundles: BundleList::new("pending_bundles"),
            custody_bundles: BundleIntMap::new("custody_bundles"),
            dupefinder: BundleStrMultiMap::new("dupefinder"),
            links: DashMap::new(),
            regs: RegistrationTable::new(),
            router: OnceLock::new(),
            cls: DashMap::new(),
            reassembly: ReassemblyTracker::new(),
            expiry_timers: DashMap::new(),
            deferred_tickers: DashMap::new(),
            stats: DaemonStats::default(),
            next_bundle_id: AtomicU64::new(max_bundle_id + 1),
            next_custody_id: AtomicU64::new(max_custody_id + 1),
            shutdown_tx,
        });
        Ok((core, queues))
    }

    /// The node's endpoint id
    pub fn local_eid(&self) -> &EndpointId {
        &self.local_eid
    }

    /// The configuration in effect
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The posting half of the event bus
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The durable store
    pub fn store(&self) -> &Arc<BundleStore> {
        &self.store
    }

    /// Install the router (once, before launch)
    pub fn set_router(&self, router: Arc<dyn Router>) {
        if self.router.set(router).is_err() {
            warn!("router already installed");
        }
    }

    /// The installed router
    pub fn router(&self) -> Arc<dyn Router> {
        self.router
            .get()
            .expect("router installed before launch")
            .clone()
    }

    /// Register a convergence layer by its name
    pub fn register_cl(&self, cl: Arc<dyn ConvergenceLayer>) {
        self.cls.insert(cl.name().to_string(), cl);
    }

    /// The convergence layer a link uses
    pub fn cl_for(&self, link: &LinkRef) -> Option<Arc<dyn ConvergenceLayer>> {
        self.cls.get(link.cl_name()).map(|c| c.clone())
    }

    /// Subscribe to the shutdown broadcast
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Allocate a node-local bundle id
    pub fn alloc_bundle_id(&self) -> u64 {
        self.next_bundle_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate a node-local custody id
    pub fn alloc_custody_id(&self) -> u64 {
        self.next_custody_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Current counter snapshot
    pub fn stats_snapshot(&self) -> DaemonStatsSnapshot {
        self.stats.snapshot()
    }

    // --- links ------------------------------------------------------------

    /// Add a link and announce it
    pub async fn add_link(&self, link: LinkRef) -> DaemonResult<()> {
        let name = link.name().to_string();
        if self.links.contains_key(&name) {
            return Err(DaemonError::Configuration(format!(
                "link '{name}' already exists"
            )));
        }
        self.links.insert(name.clone(), link);
        self.bus
            .post(BundleEvent::LinkCreated { link: name.clone() })
            .await?;
        self.bus
            .post(BundleEvent::StoreLinkUpdate { link: name })
            .await?;
        Ok(())
    }

    /// Look up a link by name
    pub fn get_link(&self, name: &str) -> Option<LinkRef> {
        self.links.get(name).map(|l| l.clone())
    }

    /// Snapshot of all links
    pub fn link_names(&self) -> Vec<String> {
        self.links.iter().map(|l| l.key().clone()).collect()
    }

    /// Ask the state machine to open a link
    pub async fn request_link_open(&self, name: &str) -> DaemonResult<()> {
        self.bus
            .post(BundleEvent::LinkStateChangeRequest {
                link: name.to_string(),
                state: LinkState::Open,
                reason: ContactReason::NoInfo,
            })
            .await
    }

    // --- registrations ----------------------------------------------------

    /// Add a registration and announce it
    pub async fn add_registration(
        &self,
        pattern: waypoint_core::EidPattern,
        failure_action: FailureAction,
        script: Option<String>,
        expiration_secs: u64,
    ) -> DaemonResult<Arc<Registration>> {
        let reg = self
            .regs
            .add(pattern, failure_action, script, expiration_secs);
        self.bus
            .post(BundleEvent::RegistrationAdded { regid: reg.regid() })
            .await?;
        self.bus
            .post(BundleEvent::StoreRegistrationUpdate { regid: reg.regid() })
            .await?;
        Ok(reg)
    }

    // --- bundle creation paths ---------------------------------------------

    /// Submit a bundle from a local application
    pub async fn submit_bundle(
        &self,
        dest: EndpointId,
        payload: Bytes,
        opts: SubmitOptions,
    ) -> DaemonResult<BundleRef> {
        let id = self.alloc_bundle_id();
        let source = opts.source.unwrap_or_else(|| self.local_eid.clone());
        let gbof = GbofId::new(source, CreationTimestamp::now(id));

        let mut bundle = Bundle::new(id, gbof, dest, Payload::memory(payload), opts.expiration_secs)
            .with_priority(opts.priority)
            .with_singleton(opts.singleton)
            .with_reports(opts.reports);
        if let Some(replyto) = opts.replyto {
            bundle = bundle.with_replyto(replyto);
        }
        if opts.custody {
            bundle = bundle.with_custody();
        }
        if opts.do_not_fragment {
            bundle = bundle.with_do_not_fragment();
        }
        let bundle = Arc::new(bundle);
        bundle.validate()?;

        self.bus
            .post(BundleEvent::BundleReceived {
                bundle: bundle.clone(),
                source: EventSource::App,
                link: None,
            })
            .await?;
        Ok(bundle)
    }

    /// Ingest wire bytes from a convergence layer
    pub async fn receive_wire(&self, wire: &[u8], link: &str) -> DaemonResult<BundleRef> {
        let (decoded, _consumed) = waypoint_codec::decode_bundle(wire)?;
        let primary = decoded.primary;
        let flags = primary.flags;

        let gbof = match &primary.fragment {
            Some(frag) => GbofId {
                source: primary.source.clone(),
                creation_ts: primary.creation_ts,
                is_fragment: true,
                frag_offset: frag.offset,
                frag_length: decoded.payload.len() as u64,
            },
            None => GbofId::new(primary.source.clone(), primary.creation_ts),
        };
        let orig_length = primary
            .fragment
            .map(|f| f.total_length)
            .unwrap_or(decoded.payload.len() as u64);

        let mut bundle = Bundle::new(
            self.alloc_bundle_id(),
            gbof,
            primary.dest.clone(),
            Payload::memory(decoded.payload),
            primary.lifetime,
        )
        .with_priority(flags.priority())
        .with_singleton(flags.singleton_dest())
        .with_reports(flags.reports())
        .with_replyto(primary.replyto.clone())
        .with_orig_length(orig_length);
        if flags.is_admin() {
            bundle = bundle.with_admin();
        }
        if flags.do_not_fragment() {
            bundle = bundle.with_do_not_fragment();
        }
        if flags.custody_requested() {
            bundle = bundle.with_custody();
        }

        let bundle = Arc::new(bundle);
        {
            let mut state = bundle.state();
            state.custodian = primary.custodian;
            state.recv_blocks = decoded.ext_blocks.iter().map(|b| b.to_carried()).collect();
        }

        self.bus
            .post(BundleEvent::BundleReceived {
                bundle: bundle.clone(),
                source: EventSource::Peer,
                link: Some(link.to_string()),
            })
            .await?;
        Ok(bundle)
    }

    /// Build a locally sourced administrative bundle
    pub fn create_admin_bundle(&self, dest: EndpointId, payload: Bytes) -> BundleRef {
        let id = self.alloc_bundle_id();
        let gbof = GbofId::new(self.local_eid.clone(), CreationTimestamp::now(id));
        let bundle = Bundle::new(
            id,
            gbof,
            dest,
            Payload::memory(payload),
            self.config.admin_lifetime_secs,
        )
        .with_admin();
        Arc::new(bundle)
    }

    /// Inject a generated admin bundle into the arrival path
    pub async fn inject_admin(&self, dest: EndpointId, payload: Bytes) -> DaemonResult<()> {
        if dest.is_null() {
            return Ok(());
        }
        DaemonStats::bump(&self.stats.generated);
        let bundle = self.create_admin_bundle(dest, payload);
        self.bus
            .post(BundleEvent::BundleReceived {
                bundle,
                source: EventSource::Admin,
                link: None,
            })
            .await
    }

    /// Generate a status report about `bundle` if its flags ask for one
    pub async fn send_status_report(
        &self,
        bundle: &BundleRef,
        kind: ReportKind,
        reason: StatusReason,
    ) -> DaemonResult<()> {
        let requested = match kind {
            ReportKind::Received => bundle.reports().receive,
            ReportKind::CustodyAccepted => bundle.reports().custody,
            ReportKind::Forwarded => bundle.reports().forward,
            ReportKind::Delivered => bundle.reports().delivery,
            ReportKind::Deleted => bundle.reports().deletion,
        };
        if !requested || bundle.report_dest().is_null() {
            return Ok(());
        }

        let fragment = bundle.is_fragment().then(|| FragmentInfo {
            offset: bundle.frag_offset(),
            total_length: bundle.orig_length(),
        });
        let mut report = StatusReport::new(
            reason,
            bundle.creation_ts(),
            bundle.source().clone(),
            fragment,
        );
        let now = CreationTimestamp::now(0);
        match kind {
            ReportKind::Received => report.received = Some(now),
            ReportKind::CustodyAccepted => report.custody_accepted = Some(now),
            ReportKind::Forwarded => report.forwarded = Some(now),
            ReportKind::Delivered => report.delivered = Some(now),
            ReportKind::Deleted => report.deleted = Some(now),
        }

        let dest = bundle.report_dest().clone();
        self.inject_admin(dest, AdminRecord::StatusReport(report).encode())
            .await
    }

    /// Send a custody signal about `bundle` to `dest`
    pub async fn send_custody_signal(
        &self,
        dest: EndpointId,
        bundle: &BundleRef,
        succeeded: bool,
        reason: CustodySignalReason,
    ) -> DaemonResult<()> {
        if dest.is_null() {
            return Ok(());
        }
        let fragment = bundle.is_fragment().then(|| FragmentInfo {
            offset: bundle.frag_offset(),
            total_length: bundle.orig_length(),
        });
        let signal = CustodySignal {
            succeeded,
            reason,
            fragment,
            signal_ts: CreationTimestamp::now(0),
            orig_creation_ts: bundle.creation_ts(),
            orig_source: bundle.source().clone(),
        };
        self.inject_admin(dest, AdminRecord::CustodySignal(signal).encode())
            .await
    }

    /// Whether `eid` is deliverable at this node
    pub fn is_local_dest(&self, eid: &EndpointId) -> bool {
        let local = self.local_eid.as_str();
        eid.as_str() == local
            || eid
                .as_str()
                .strip_prefix(local)
                .is_some_and(|rest| rest.starts_with('/'))
            || !self.regs.matching(eid).is_empty()
    }

    // --- bundle lifecycle ---------------------------------------------------

    /// Track a new bundle: all-bundles map, pending list, expiry timer
    pub fn track_bundle(self: &Arc<Self>, bundle: &BundleRef) {
        self.all_bundles.insert(bundle.id(), bundle.clone());
        self.pending_bundles.push_back(bundle.clone());
        self.schedule_expiry(bundle);
    }

    /// Arm the expiration timer for a bundle
    ///
    /// Expiration preempts queued forwarding work via the at-head slot.
    pub fn schedule_expiry(self: &Arc<Self>, bundle: &BundleRef) {
        let delay = Duration::from_secs(bundle.time_to_expiration());
        let bus = self.bus.clone();
        let target = bundle.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.post_at_head(BundleEvent::BundleExpired { bundle: target });
        })
        .abort_handle();
        if let Some(old) = self.expiry_timers.insert(bundle.id(), handle) {
            old.abort();
        }
    }

    fn cancel_expiry(&self, bundle_id: u64) {
        if let Some((_, handle)) = self.expiry_timers.remove(&bundle_id) {
            handle.abort();
        }
    }

    /// Take custody: rewrite the custodian, allocate a custody id, and
    /// acknowledge upstream (standalone signal or pending ACS)
    pub async fn accept_custody(self: &Arc<Self>, bundle: &BundleRef) -> DaemonResult<()> {
        let (prev_custodian, cteb_valid, cteb_custody_id) = {
            let state = bundle.state();
            if state.local_custody {
                return Ok(());
            }
            (
                state.custodian.clone(),
                state.cteb_valid,
                state.cteb_custody_id,
            )
        };

        let custody_id = self.alloc_custody_id();
        {
            let mut state = bundle.state();
            state.custodian = self.local_eid.clone();
            state.local_custody = true;
            state.custody_id = custody_id;
        }
        self.custody_bundles.insert(custody_id, bundle.clone());
        info!(bundle = %bundle, custody_id, "accepted custody");

        self.send_status_report(bundle, ReportKind::CustodyAccepted, StatusReason::NoAdditionalInfo)
            .await?;

        if !prev_custodian.is_null() {
            if cteb_valid && self.acs.config().enabled {
                self.bus
                    .post(BundleEvent::IssueAggregateCustodySignal {
                        custodian: prev_custodian.as_str().to_string(),
                        succeeded: true,
                        reason: CustodySignalReason::NoAdditionalInfo as u8,
                        custody_id: cteb_custody_id,
                    })
                    .await?;
            } else {
                self.send_custody_signal(
                    prev_custodian,
                    bundle,
                    true,
                    CustodySignalReason::NoAdditionalInfo,
                )
                .await?;
            }
        }

        self.bus
            .post(BundleEvent::BundleCustodyAccepted {
                bundle: bundle.clone(),
                custody_id,
            })
            .await?;
        self.bus
            .post(BundleEvent::StoreBundleUpdate {
                bundle: bundle.clone(),
            })
            .await?;
        Ok(())
    }

    /// Release local custody: cancel timers, drop the custody-id mapping
    pub async fn release_custody(self: &Arc<Self>, bundle: &BundleRef) -> DaemonResult<()> {
        let custody_id = {
            let mut state = bundle.state();
            if !state.local_custody {
                return Ok(());
            }
            state.local_custody = false;
            state.custody_id
        };
        self.custody_timers.cancel_all_for(bundle.id());
        self.custody_bundles.erase(custody_id);
        debug!(bundle = %bundle, custody_id, "released custody");
        self.bus
            .post(BundleEvent::StoreBundleUpdate {
                bundle: bundle.clone(),
            })
            .await
    }

    /// Delete a bundle: remove from every collection, free exactly once
    pub async fn delete_bundle(
        self: &Arc<Self>,
        bundle: &BundleRef,
        reason: StatusReason,
    ) -> DaemonResult<()> {
        {
            let mut state = bundle.state();
            if state.deleting {
                return Ok(());
            }
            state.deleting = true;
        }

        if reason != StatusReason::NoAdditionalInfo {
            self.send_status_report(bundle, ReportKind::Deleted, reason).await?;
        }

        self.release_custody(bundle).await?;
        self.cancel_expiry(bundle.id());
        self.router().delete_bundle(self, bundle);

        self.pending_bundles.erase(bundle);
        self.dupefinder.erase_bundle(&bundle.gbof().to_key(), bundle);
        for link in self.links.iter() {
            if link.del_from_queue(bundle) || link.del_from_inflight(bundle) {
                link.update_stats(|s| s.bundles_cancelled += 1);
            }
            link.undefer_bundle(bundle.id());
        }
        self.all_bundles.erase(bundle.id());

        DaemonStats::bump(&self.stats.deleted);
        if bundle.mark_freed() {
            self.bus
                .post(BundleEvent::BundleFree {
                    bundle: bundle.clone(),
                })
                .await?;
        }
        Ok(())
    }

    /// Delete the bundle if nothing still needs it
    pub async fn try_delete_bundle(self: &Arc<Self>, bundle: &BundleRef) -> DaemonResult<bool> {
        if bundle.has_local_custody() {
            return Ok(false);
        }
        let (has_pending_work, has_outcome, delivered) = {
            let state = bundle.state();
            let pending = state.fwdlog.count_in(&[
                ForwardingState::Queued,
                ForwardingState::InFlight,
            ]) > 0;
            let outcome = state.fwdlog.count_in(&[
                ForwardingState::Transmitted,
                ForwardingState::Delivered,
            ]) > 0;
            let delivered = state.fwdlog.count_in(&[ForwardingState::Delivered]) > 0;
            (pending, outcome, delivered)
        };
        if has_pending_work || !has_outcome {
            return Ok(false);
        }
        // A singleton bundle for a local endpoint is retained until it is
        // actually delivered (deferred delivery up to expiration)
        if bundle.singleton_dest() && self.is_local_dest(bundle.dest()) && !delivered {
            return Ok(false);
        }
        if !self.router().can_delete_bundle(self, bundle) {
            return Ok(false);
        }
        self.delete_bundle(bundle, StatusReason::NoAdditionalInfo).await?;
        Ok(true)
    }

    /// Start the per-link deferred ticker if it is not running
    pub fn ensure_deferred_ticker(self: &Arc<Self>, link: &LinkRef) {
        let name = link.name().to_string();
        if self.deferred_tickers.contains_key(&name) {
            return;
        }
        let bus = self.bus.clone();
        let link = link.clone();
        let core = self.clone();
        let key = name.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if link.deferred_count() == 0 {
                    break;
                }
                let _ = bus
                    .post(BundleEvent::LinkCheckDeferred {
                        link: link.name().to_string(),
                    })
                    .await;
            }
            core.deferred_tickers.remove(&key);
        })
        .abort_handle();
        self.deferred_tickers.insert(name, handle);
    }

    // --- main processor -----------------------------------------------------

    /// Handle one main-processor event; true means keep running
    pub async fn handle_main_event(self: &Arc<Self>, event: &BundleEvent) -> DaemonResult<bool> {
        use BundleEvent::*;
        match event {
            BundleSend {
                bundle,
                link,
                action,
            } => self.handle_bundle_send(bundle, link, *action).await?,
            BundleTransmitted {
                bundle,
                link,
                bytes_sent,
                reliably,
            } => {
                self.handle_bundle_transmitted(bundle, link, *bytes_sent, *reliably)
                    .await?
            }
            DeliverBundleToReg { bundle, regid } => {
                self.handle_deliver_to_reg(bundle, *regid).await?
            }
            BundleDelivered { .. } => {}
            BundleExpired { bundle } => self.handle_bundle_expired(bundle).await?,
            BundleFree { bundle } => {
                self.bus
                    .post(BundleEvent::StoreBundleDelete {
                        bundle: bundle.clone(),
                    })
                    .await?
            }
            BundleCancel { bundle, link } => self.handle_bundle_cancel(bundle, link).await?,
            BundleSendCancelled { bundle, link } => {
                debug!(bundle = %bundle, link = %link, "send cancelled");
            }
            BundleDelete { bundle, reason } => self.delete_bundle(bundle, *reason).await?,
            BundleInject {
                dest,
                payload,
                expiration_secs,
                custody,
            } => {
                let injected = self
                    .submit_bundle(
                        dest.clone(),
                        payload.clone(),
                        SubmitOptions {
                            custody: *custody,
                            expiration_secs: *expiration_secs,
                            ..Default::default()
                        },
                    )
                    .await?;
                self.bus
                    .post(BundleEvent::BundleInjected { bundle: injected })
                    .await?;
            }
            BundleInjected { .. } => {}
            BundleAcceptRequest { .. } => {
                // Replies are handled at dispatch time (the reply sender
                // must be consumed); see run_main
            }
            BundleTakeCustody { bundle } => {
                if self.router().accept_custody(self, bundle) {
                    self.accept_custody(bundle).await?;
                }
            }
            BundleCustodyAccepted { .. } => {}
            CustodySignal { signal } => self.handle_custody_signal(signal).await?,
            CustodyTimeout {
                bundle_id,
                link,
                retries,
            } => self.handle_custody_timeout(*bundle_id, link, *retries).await?,
            AggregateCustodySignal { signal } => self.handle_acs_signal(signal).await?,
            ContactUp { link } => self.handle_contact_up(link).await?,
            ContactDown { link, reason } => self.handle_contact_down(link, *reason).await?,
            LinkStateChangeRequest {
                link,
                state,
                reason,
            } => self.handle_link_state_change(link, *state, *reason).await?,
            LinkCreated { link } | LinkAvailable { link, .. } => {
                debug!(link = %link, "link event");
            }
            LinkUnavailable { link, .. } => {
                debug!(link = %link, "link unavailable");
            }
            LinkDeleted { link } => {
                if let Some((_, l)) = self.links.remove(link) {
                    l.mark_deleted();
                }
                self.bus
                    .post(BundleEvent::StoreLinkDelete { link: link.clone() })
                    .await?;
            }
            LinkCheckDeferred { .. } => {}
            LinkCancelAllBundles { link } => self.handle_link_cancel_all(link).await?,
            RegistrationAdded { .. } | RegistrationRemoved { .. } => {}
            RegistrationExpired { regid } => {
                self.regs.remove(*regid);
                self.bus
                    .post(BundleEvent::StoreRegistrationDelete { regid: *regid })
                    .await?;
            }
            RouteAdd { entry } => self.routes.add(entry.clone()),
            RouteDel { pattern } => {
                self.routes.del(pattern);
            }
            RouteRecompute => {}
            ReassemblyCompleted { .. } | BundleReceived { .. } | BundleTransmitReady { .. } => {
                // Input / output processor events; not ours
            }
            StoreBundleUpdate { .. }
            | StoreBundleDelete { .. }
            | StoreLinkUpdate { .. }
            | StoreLinkDelete { .. }
            | StoreRegistrationUpdate { .. }
            | StoreRegistrationDelete { .. }
            | IssueAggregateCustodySignal { .. }
            | AcsExpired { .. } => {}
            ShutdownRequest => {
                info!("shutdown requested");
                let _ = self.shutdown_tx.send(());
                return Ok(false);
            }
            StatusRequest { .. } => {
                // Replies handled at dispatch time; see run_main
            }
        }
        Ok(true)
    }

    async fn handle_bundle_send(
        self: &Arc<Self>,
        bundle: &BundleRef,
        link_name: &str,
        action: ForwardingAction,
    ) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            warn!(link = link_name, "send to unknown link");
            return Ok(());
        };

        // Fragments and injected bundles enter tracking here
        if self.all_bundles.find(bundle.id()).is_none() {
            self.track_bundle(bundle);
        }

        if !link.is_available()
            && link.link_type() == LinkType::Opportunistic
            && self.config.cancel_on_unavailable
        {
            bundle.state().fwdlog.add_entry(
                link_name,
                action,
                ForwardingState::Cancelled,
            );
            self.bus
                .post(BundleEvent::BundleSendCancelled {
                    bundle: bundle.clone(),
                    link: link_name.to_string(),
                })
                .await?;
            return Ok(());
        }

        bundle
            .state()
            .fwdlog
            .add_entry(link_name, action, ForwardingState::Queued);
        if !link.add_to_queue(bundle) {
            return Ok(());
        }

        if link.is_open() {
            self.bus
                .post(BundleEvent::BundleTransmitReady {
                    bundle: bundle.clone(),
                    link: link_name.to_string(),
                })
                .await?;
        } else if link.state() == LinkState::Available {
            self.request_link_open(link_name).await?;
        }

        self.bus
            .post(BundleEvent::StoreBundleUpdate {
                bundle: bundle.clone(),
            })
            .await
    }

    async fn handle_bundle_transmitted(
        self: &Arc<Self>,
        bundle: &BundleRef,
        link_name: &str,
        bytes_sent: u64,
        reliably: bool,
    ) -> DaemonResult<()> {
        let link = self.get_link(link_name);
        if let Some(link) = &link {
            link.del_from_inflight(bundle);
            link.update_stats(|s| {
                s.bundles_transmitted += 1;
                s.bytes_transmitted += bytes_sent;
            });
        }

        let payload_len = bundle.payload_len();
        if reliably && bytes_sent > 0 && bytes_sent < payload_len {
            // Partial acknowledgement: refragment the unacknowledged tail
            self.reactive_fragment(bundle, link_name, bytes_sent).await?;
        }
        bundle
            .state()
            .fwdlog
            .update(link_name, ForwardingState::Transmitted);
        DaemonStats::bump(&self.stats.transmitted);

        self.send_status_report(bundle, ReportKind::Forwarded, StatusReason::NoAdditionalInfo)
            .await?;

        if bundle.has_local_custody() {
            self.custody_timers
                .start(self.bus.clone(), bundle.id(), link_name, 0);
        }

        self.bus
            .post(BundleEvent::StoreBundleUpdate {
                bundle: bundle.clone(),
            })
            .await?;
        self.try_delete_bundle(bundle).await?;
        Ok(())
    }

    async fn reactive_fragment(
        self: &Arc<Self>,
        bundle: &BundleRef,
        link_name: &str,
        acked_bytes: u64,
    ) -> DaemonResult<()> {
        let payload_len = bundle.payload_len();
        let Some(plan) = crate::fragmentation::plan_tail(payload_len, acked_bytes) else {
            return Ok(());
        };
        let tail = self.make_fragment(bundle, plan.offset, plan.length).await?;
        info!(
            bundle = %bundle,
            acked = acked_bytes,
            tail = %tail,
            "reactive fragmentation of partial transmission"
        );
        self.bus
            .post(BundleEvent::BundleSend {
                bundle: tail,
                link: link_name.to_string(),
                action: ForwardingAction::Forward,
            })
            .await
    }

    /// Build a fragment covering `[offset, offset+length)` of this
    /// bundle's payload
    pub async fn make_fragment(
        self: &Arc<Self>,
        bundle: &BundleRef,
        offset: u64,
        length: u64,
    ) -> DaemonResult<BundleRef> {
        let payload = self.read_payload_range(bundle, offset, length)?;
        // Offsets compose when fragmenting a fragment
        let adu_offset = bundle.frag_offset() + offset;
        let gbof = bundle.gbof().original().fragment(adu_offset, length);

        let mut fragment = Bundle::new(
            self.alloc_bundle_id(),
            gbof,
            bundle.dest().clone(),
            Payload::memory(payload),
            bundle.expiration_secs(),
        )
        .with_priority(bundle.priority())
        .with_singleton(bundle.singleton_dest())
        .with_reports(bundle.reports())
        .with_replyto(bundle.replyto().clone())
        .with_orig_length(bundle.orig_length());
        if bundle.custody_requested() {
            fragment = fragment.with_custody();
        }
        let fragment = Arc::new(fragment);

        // Replicate the blocks flagged for every fragment; the first
        // fragment carries everything
        {
            let src = bundle.state();
            let mut dst = fragment.state();
            dst.custodian = src.custodian.clone();
            dst.recv_blocks = src
                .recv_blocks
                .iter()
                .filter(|b| {
                    adu_offset == 0
                        || (b.flags & waypoint_codec::BlockFlags::REPLICATE) != 0
                })
                .cloned()
                .collect();
        }
        Ok(fragment)
    }

    /// Read part of a bundle's payload, wherever it lives
    pub fn read_payload_range(
        &self,
        bundle: &BundleRef,
        offset: u64,
        length: u64,
    ) -> DaemonResult<Bytes> {
        let state = bundle.state();
        match state.payload.slice(offset, length) {
            Ok(bytes) => Ok(bytes),
            Err(_) => Ok(self.store.read_payload(bundle.id(), offset, length)?),
        }
    }

    async fn handle_deliver_to_reg(self: &Arc<Self>, bundle: &BundleRef, regid: u32) -> DaemonResult<()> {
        let Some(reg) = self.regs.get(regid) else {
            return Ok(());
        };
        match reg.deliver(bundle) {
            crate::registration::DeliveryOutcome::Delivered => {
                bundle.state().fwdlog.add_entry(
                    reg.pattern().as_str(),
                    ForwardingAction::Forward,
                    ForwardingState::Delivered,
                );
                DaemonStats::bump(&self.stats.delivered);
                self.send_status_report(
                    bundle,
                    ReportKind::Delivered,
                    StatusReason::NoAdditionalInfo,
                )
                .await?;
                // Delivery ends custody
                self.release_custody(bundle).await?;
                self.bus
                    .post(BundleEvent::BundleDelivered {
                        bundle: bundle.clone(),
                        regid,
                    })
                    .await?;
                self.try_delete_bundle(bundle).await?;
            }
            crate::registration::DeliveryOutcome::Deferred => {
                debug!(bundle = %bundle, regid, "delivery deferred (no bound app)");
            }
            crate::registration::DeliveryOutcome::Dropped => {
                self.delete_bundle(bundle, StatusReason::NoAdditionalInfo).await?;
            }
        }
        Ok(())
    }

    async fn handle_bundle_expired(self: &Arc<Self>, bundle: &BundleRef) -> DaemonResult<()> {
        DaemonStats::bump(&self.stats.expired);
        info!(bundle = %bundle, "bundle expired");
        self.reassembly.abandon(&bundle.gbof().original().to_key());
        self.delete_bundle(bundle, StatusReason::LifetimeExpired).await
    }

    async fn handle_bundle_cancel(self: &Arc<Self>, bundle: &BundleRef, link_name: &str) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            return Ok(());
        };
        let cancelled = if link.del_from_queue(bundle) {
            true
        } else if link.inflight.contains(bundle) {
            if let Some(cl) = self.cl_for(&link) {
                cl.cancel(&link, bundle).await && link.del_from_inflight(bundle)
            } else {
                false
            }
        } else {
            false
        };

        if cancelled {
            link.update_stats(|s| s.bundles_cancelled += 1);
            bundle
                .state()
                .fwdlog
                .update(link_name, ForwardingState::Cancelled);
            self.bus
                .post(BundleEvent::BundleSendCancelled {
                    bundle: bundle.clone(),
                    link: link_name.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_link_cancel_all(self: &Arc<Self>, link_name: &str) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            return Ok(());
        };
        let mut cancelled = link.queue.drain();
        cancelled.extend(link.inflight.drain());
        for bundle in cancelled {
            link.update_stats(|s| s.bundles_cancelled += 1);
            bundle
                .state()
                .fwdlog
                .update(link_name, ForwardingState::Cancelled);
            self.bus
                .post(BundleEvent::BundleSendCancelled {
                    bundle,
                    link: link_name.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_custody_signal(self: &Arc<Self>, signal: &CustodySignal) -> DaemonResult<()> {
        let Some(bundle) = self.find_custody_bundle(
            &signal.orig_source,
            signal.orig_creation_ts,
            signal.fragment,
        ) else {
            debug!("custody signal for unknown bundle");
            return Ok(());
        };

        if signal.succeeded {
            info!(bundle = %bundle, "downstream custody accepted");
            self.release_custody(&bundle).await?;
            self.try_delete_bundle(&bundle).await?;
        } else {
            // Keep custody; re-routing is the routing layer's decision
            warn!(
                bundle = %bundle,
                reason = ?signal.reason,
                "downstream refused custody"
            );
        }
        Ok(())
    }

    async fn handle_acs_signal(
        self: &Arc<Self>,
        signal: &waypoint_codec::AggregateCustodySignal,
    ) -> DaemonResult<()> {
        for custody_id in signal.custody_ids() {
            let Some(bundle) = self.custody_bundles.find(custody_id) else {
                continue;
            };
            if signal.succeeded {
                self.release_custody(&bundle).await?;
                self.try_delete_bundle(&bundle).await?;
            } else {
                warn!(bundle = %bundle, custody_id, "ACS reports custody failure");
            }
        }
        Ok(())
    }

    fn find_custody_bundle(
        &self,
        source: &EndpointId,
        creation_ts: CreationTimestamp,
        fragment: Option<FragmentInfo>,
    ) -> Option<BundleRef> {
        self.custody_bundles.values().into_iter().find(|b| {
            b.source() == source
                && b.creation_ts() == creation_ts
                && match fragment {
                    Some(f) => b.is_fragment() && b.frag_offset() == f.offset,
                    None => !b.is_fragment(),
                }
        })
    }

    async fn handle_custody_timeout(
        self: &Arc<Self>,
        bundle_id: u64,
        link_name: &str,
        retries: u32,
    ) -> DaemonResult<()> {
        self.custody_timers.finished(bundle_id, link_name);
        let Some(bundle) = self.all_bundles.find(bundle_id) else {
            return Ok(());
        };
        // Downstream already accepted: the timer is moot
        if !bundle.has_local_custody() {
            return Ok(());
        }
        if !bundle.state().fwdlog.has_transmission_on(link_name) {
            return Ok(());
        }

        let params = self.custody_timers.params().clone();
        let next_retries = retries + 1;
        warn!(bundle = %bundle, link = link_name, retries, "custody timer expired");

        if next_retries > params.max_retries {
            if params.signal_no_timely_contact {
                let dest = bundle.report_dest().clone();
                self.send_custody_signal(
                    dest,
                    &bundle,
                    false,
                    CustodySignalReason::NoTimelyContact,
                )
                .await?;
            }
            // Custody is kept; the bundle waits for a route or expiration
            return Ok(());
        }

        // Re-route and retransmit where possible
        match self.routes.resolve(bundle.dest()) {
            Ok(resolved) if !resolved.is_empty() => {
                for route in resolved {
                    if let Some(link) = self.get_link(&route.link) {
                        if link.is_usable() {
                            self.bus
                                .post(BundleEvent::BundleSend {
                                    bundle: bundle.clone(),
                                    link: route.link.clone(),
                                    action: route.action,
                                })
                                .await?;
                            break;
                        }
                    }
                }
            }
            _ => debug!(bundle = %bundle, "no route for custody retransmission"),
        }
        self.custody_timers
            .start(self.bus.clone(), bundle_id, link_name, next_retries);
        Ok(())
    }

    async fn handle_contact_up(self: &Arc<Self>, link_name: &str) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            return Ok(());
        };
        link.set_state(LinkState::Open, Some(Contact::new(link_name)));
        link.reset_retry();
        link.update_stats(|s| s.contacts_opened += 1);
        info!(link = link_name, "contact up");

        for bundle in link.queue.snapshot() {
            self.bus
                .post(BundleEvent::BundleTransmitReady {
                    bundle,
                    link: link_name.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    async fn handle_contact_down(
        self: &Arc<Self>,
        link_name: &str,
        reason: ContactReason,
    ) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            return Ok(());
        };
        if let Some(contact) = link.contact() {
            let uptime = contact.duration_secs();
            link.update_stats(|s| s.uptime_secs += uptime);
        }
        info!(link = link_name, ?reason, "contact down");

        // Unacknowledged in-flight transmissions failed with the contact
        for bundle in link.inflight.drain() {
            bundle
                .state()
                .fwdlog
                .update(link_name, ForwardingState::Failed);
            self.bus
                .post(BundleEvent::BundleSendCancelled {
                    bundle,
                    link: link_name.to_string(),
                })
                .await?;
        }

        match link.link_type() {
            LinkType::AlwaysOn => {
                link.set_state(LinkState::Available, None);
                let retry = link.backoff_retry();
                self.schedule_reopen(&link, retry);
            }
            LinkType::OnDemand | LinkType::Scheduled => {
                link.set_state(LinkState::Available, None);
            }
            LinkType::Opportunistic => {
                link.set_state(LinkState::Unavailable, None);
                self.bus
                    .post(BundleEvent::LinkUnavailable {
                        link: link_name.to_string(),
                        reason,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    fn schedule_reopen(self: &Arc<Self>, link: &LinkRef, after_secs: u32) {
        let bus = self.bus.clone();
        let name = link.name().to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(after_secs as u64)).await;
            let _ = bus
                .post(BundleEvent::LinkStateChangeRequest {
                    link: name,
                    state: LinkState::Open,
                    reason: ContactReason::NoInfo,
                })
                .await;
        });
    }

    async fn handle_link_state_change(
        self: &Arc<Self>,
        link_name: &str,
        target: LinkState,
        reason: ContactReason,
    ) -> DaemonResult<()> {
        let Some(link) = self.get_link(link_name) else {
            return Ok(());
        };
        let current = link.state();
        match target {
            LinkState::Open => {
                if current != LinkState::Available {
                    debug!(link = link_name, state = current.as_str(), "open request ignored");
                    return Ok(());
                }
                let Some(cl) = self.cl_for(&link) else {
                    return Err(DaemonError::ConvergenceLayer(format!(
                        "no convergence layer '{}'",
                        link.cl_name()
                    )));
                };
                link.set_state(LinkState::Opening, None);
                link.update_stats(|s| s.contact_attempts += 1);
                if let Err(e) = cl.open_contact(&link).await {
                    warn!(link = link_name, error = %e, "contact open failed");
                    let retry = link.backoff_retry();
                    link.set_state(LinkState::Available, None);
                    if link.link_type() == LinkType::AlwaysOn {
                        self.schedule_reopen(&link, retry);
                    }
                }
            }
            LinkState::Available => {
                if current == LinkState::Unavailable {
                    link.set_state(LinkState::Available, None);
                    self.bus
                        .post(BundleEvent::LinkAvailable {
                            link: link_name.to_string(),
                            reason,
                        })
                        .await?;
                }
            }
            LinkState::Unavailable => {
                if current == LinkState::Open || current == LinkState::Opening {
                    if let Some(cl) = self.cl_for(&link) {
                        cl.close_contact(&link).await;
                    }
                    self.handle_contact_down(link_name, reason).await?;
                }
                link.set_state(LinkState::Unavailable, None);
                self.bus
                    .post(BundleEvent::LinkUnavailable {
                        link: link_name.to_string(),
                        reason,
                    })
                    .await?;
            }
            LinkState::Opening => {
                debug!(link = link_name, "opening is not an external target state");
            }
        }
        Ok(())
    }

    /// Main processor loop
    pub async fn run_main(self: Arc<Self>, mut queue: crate::bus::EventQueue) {
        info!(local_eid = %self.local_eid, "bundle daemon main processor running");
        let idle_limit = self.config.idle_shutdown_secs;
        loop {
            let envelope = if idle_limit > 0 {
                match queue.next_timeout(Duration::from_secs(1)).await {
                    Some(envelope) => envelope,
                    None => {
                        if self.bus.idle() >= Duration::from_secs(idle_limit) {
                            info!(idle_limit, "idle shutdown");
                            let _ = self.shutdown_tx.send(());
                            break;
                        }
                        continue;
                    }
                }
            } else {
                match queue.next().await {
                    Some(envelope) => envelope,
                    None => break,
                }
            };

            let EventEnvelope { event, done } = envelope;
            debug!(event = event.type_str(), "main event");

            // Events carrying reply slots are answered here, where the
            // sender can be consumed
            let keep_running = match event {
                BundleEvent::StatusRequest { reply } => {
                    let _ = reply.send(self.stats.snapshot());
                    true
                }
                BundleEvent::BundleAcceptRequest { bundle, reply } => {
                    let _ = reply.send(self.router().accept_bundle(&self, &bundle));
                    true
                }
                ev => match self.handle_main_event(&ev).await {
                    Ok(keep) => {
                        if !ev.daemon_only() {
                            self.router().handle_event(&self, &ev).await;
                        }
                        keep
                    }
                    Err(e) => {
                        error!(event = ev.type_str(), error = %e, "main event failed");
                        true
                    }
                },
            };

            DaemonStats::bump(&self.stats.events_processed);
            self.bus.touch();
            EventEnvelope::complete(done);
            if !keep_running {
                break;
            }
        }
        info!("main processor stopped");
    }
}

/// A launched daemon: the core plus its processor tasks
pub struct BundleDaemon {
    core: Arc<DaemonCore>,
    tasks: Vec<(Processor, JoinHandle<()>)>,
}

impl BundleDaemon {
    /// Spawn the processor tasks and reload persisted state
    ///
    /// The core must already have its router and convergence layers
    /// installed. Configured links and routes are created here.
    pub async fn launch(
        core: Arc<DaemonCore>,
        queues: ProcessorQueues,
    ) -> DaemonResult<Self> {
        if core.router.get().is_none() {
            core.set_router(crate::router::TableRouter::new());
        }

        let tasks = Self::spawn_processors(&core, queues);

        // Configured links and routes; alwayson links open immediately
        let link_entries = core.config().links.clone();
        for entry in &link_entries {
            let link = entry.build()?;
            let open_now = link.link_type() == LinkType::AlwaysOn;
            let name = link.name().to_string();
            core.add_link(link).await?;
            if open_now {
                core.request_link_open(&name).await?;
            }
        }
        let route_entries = core.config().routes.clone();
        for entry in &route_entries {
            core.routes.add(entry.build()?);
        }

        // Reload persisted bundles and pending ACS sets
        let records = core.store().load_all()?;
        let reloaded = records.len();
        for record in records {
            let payload = core.store().reload_payload(&record);
            let bundle = Arc::new(record.into_bundle(payload));
            core.bus()
                .post(BundleEvent::BundleReceived {
                    bundle,
                    source: EventSource::Store,
                    link: None,
                })
                .await?;
        }
        for record in core.store().load_pending_acs()? {
            let key = crate::acs::AcsKey {
                custodian: record.custodian.clone(),
                succeeded: record.succeeded,
                reason: record.reason,
            };
            core.acs.restore(key.clone(), record.ids.iter().copied().collect());
            // Give restored sets a fresh window
            crate::acs_task::schedule_acs_flush(&core, key);
        }
        if reloaded > 0 {
            info!(reloaded, "restored persisted bundles");
        }

        // Registration expiration sweep
        {
            let core = core.clone();
            tokio::spawn(async move {
                let mut shutdown = core.subscribe_shutdown();
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            for regid in core.regs.expired() {
                                let _ = core
                                    .bus()
                                    .post(BundleEvent::RegistrationExpired { regid })
                                    .await;
                            }
                        }
                    }
                }
            });
        }

        Ok(Self { core, tasks })
    }

    fn spawn_processors(
        core: &Arc<DaemonCore>,
        queues: ProcessorQueues,
    ) -> Vec<(Processor, JoinHandle<()>)> {
        vec![
            (
                Processor::Main,
                tokio::spawn(core.clone().run_main(queues.main)),
            ),
            (
                Processor::Input,
                tokio::spawn(crate::input::run_input(core.clone(), queues.input)),
            ),
            (
                Processor::Output,
                tokio::spawn(crate::output::run_output(core.clone(), queues.output)),
            ),
            (
                Processor::Storage,
                tokio::spawn(crate::storage_task::run_storage(
                    core.clone(),
                    queues.storage,
                )),
            ),
            (
                Processor::Acs,
                tokio::spawn(crate::acs_task::run_acs(core.clone(), queues.acs)),
            ),
        ]
    }

    /// The shared core
    pub fn core(&self) -> &Arc<DaemonCore> {
        &self.core
    }

    /// Request shutdown and wait for the processors to stop
    ///
    /// Processors are joined in reverse dependency order: ACS, storage,
    /// output, input, main.
    pub async fn shutdown(mut self) {
        let _ = self.core.bus().post(BundleEvent::ShutdownRequest).await;

        let order = [
            Processor::Acs,
            Processor::Storage,
            Processor::Output,
            Processor::Input,
            Processor::Main,
        ];
        for target in order {
            if let Some(pos) = self.tasks.iter().position(|(p, _)| *p == target) {
                let (_, handle) = self.tasks.remove(pos);
                if tokio::time::timeout(Duration::from_secs(5), handle)
                    .await
                    .is_err()
                {
                    warn!(processor = ?target, "processor did not stop in time");
                }
            }
        }
        info!("daemon stopped");
    }

    /// Wait for a shutdown initiated elsewhere (signal handler, idle)
    pub async fn wait(&self) {
        let mut rx = self.core.subscribe_shutdown();
        let _ = rx.recv().await;
    }
}
