//! The static table-based router
//!
//! Routes every pending bundle against the route table: resolve the
//! destination to links, respect link usability and backpressure, defer
//! onto links that cannot take traffic right now, and re-evaluate when
//! contacts come up, deferred timers tick, or the table changes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use waypoint_core::{BundleRef, ForwardingAction, ForwardingState};

use crate::daemon::DaemonCore;
use crate::event::BundleEvent;
use crate::router::Router;

/// The table-driven router shipped with the core
pub struct TableRouter;

impl TableRouter {
    /// Create the router
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    /// Queue a bundle on the links its destination resolves to
    async fn route_bundle(&self, core: &Arc<DaemonCore>, bundle: &BundleRef) {
        // Administrative consumption and local delivery happen in the
        // daemon; a singleton bundle for a local endpoint is not forwarded
        if bundle.singleton_dest() && core.is_local_dest(bundle.dest()) {
            return;
        }

        let resolved = match core.routes.resolve(bundle.dest()) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(bundle = %bundle, error = %e, "route resolution failed");
                return;
            }
        };
        if resolved.is_empty() {
            debug!(bundle = %bundle, dest = %bundle.dest(), "no route");
            return;
        }

        for route in resolved {
            let Some(link) = core.get_link(&route.link) else {
                continue;
            };
            if !link.is_usable() {
                continue;
            }
            // One attempt per link unless the previous one failed
            if let Some(state) = bundle.state().fwdlog.state_for(&route.link) {
                if !matches!(
                    state,
                    ForwardingState::Failed | ForwardingState::Cancelled
                ) {
                    continue;
                }
            }
            if !link.is_available() {
                link.defer_bundle(bundle, "link unavailable");
                core.ensure_deferred_ticker(&link);
                continue;
            }
            if link.queue_is_full() {
                link.defer_bundle(bundle, "queue past high watermark");
                core.ensure_deferred_ticker(&link);
                continue;
            }

            let _ = core
                .bus()
                .post(BundleEvent::BundleSend {
                    bundle: bundle.clone(),
                    link: route.link.clone(),
                    action: route.action,
                })
                .await;

            if route.action == ForwardingAction::Forward {
                break;
            }
        }
    }

    /// Re-route bundles deferred on a link
    async fn check_deferred(&self, core: &Arc<DaemonCore>, link_name: &str) {
        let Some(link) = core.get_link(link_name) else {
            return;
        };
        for bundle in link.deferred_bundles() {
            link.undefer_bundle(bundle.id());
            self.route_bundle(core, &bundle).await;
        }
    }

    /// Re-evaluate every pending bundle (table change, new contact)
    async fn reroute_all(&self, core: &Arc<DaemonCore>) {
        for bundle in core.pending_bundles.snapshot() {
            self.route_bundle(core, &bundle).await;
        }
    }
}

#[async_trait]
impl Router for TableRouter {
    fn name(&self) -> &str {
        "static"
    }

    async fn handle_event(&self, core: &Arc<DaemonCore>, event: &BundleEvent) {
        match event {
            BundleEvent::BundleReceived { bundle, .. }
            | BundleEvent::BundleInjected { bundle }
            | BundleEvent::ReassemblyCompleted { bundle } => {
                self.route_bundle(core, bundle).await;
            }
            BundleEvent::BundleSendCancelled { bundle, .. } => {
                self.route_bundle(core, bundle).await;
            }
            BundleEvent::LinkCheckDeferred { link } => {
                self.check_deferred(core, link).await;
            }
            BundleEvent::ContactUp { link } | BundleEvent::LinkAvailable { link, .. } => {
                self.check_deferred(core, link).await;
                self.reroute_all(core).await;
            }
            BundleEvent::RouteAdd { .. }
            | BundleEvent::RouteDel { .. }
            | BundleEvent::RouteRecompute => {
                self.reroute_all(core).await;
            }
            _ => {}
        }
    }
}
