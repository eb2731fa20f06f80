//! The external router bridge
//!
//! Forwards daemon events to an out-of-process routing agent as JSON
//! lines and applies the agent's decisions. Decisions arrive as
//! [`RouterCommand`] values and are translated into daemon events - the
//! bridge never mutates state directly, exactly like an in-process
//! router.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use waypoint_core::{EidPattern, ForwardingAction};
use waypoint_routing::RouteEntry;

use crate::daemon::DaemonCore;
use crate::event::{BundleEvent, ContactReason};
use crate::link::LinkState;
use crate::error::{DaemonError, DaemonResult};
use crate::router::Router;

/// The event summary streamed to the external agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Event type name
    pub event: String,
    /// Subject bundle id, when the event has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<u64>,
    /// Subject bundle GBOF key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gbof: Option<String>,
    /// Subject bundle destination
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    /// Subject link name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    /// Subject registration id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regid: Option<u32>,
}

impl ExternalEvent {
    fn from_event(event: &BundleEvent) -> Self {
        let mut summary = Self {
            event: event.type_str().to_string(),
            bundle_id: None,
            gbof: None,
            dest: None,
            link: None,
            regid: None,
        };
        use BundleEvent::*;
        match event {
            BundleReceived { bundle, link, .. } => {
                summary.fill_bundle(bundle);
                summary.link = link.clone();
            }
            BundleTransmitted { bundle, link, .. }
            | BundleSendCancelled { bundle, link } => {
                summary.fill_bundle(bundle);
                summary.link = Some(link.clone());
            }
            BundleDelivered { bundle, regid } => {
                summary.fill_bundle(bundle);
                summary.regid = Some(*regid);
            }
            BundleExpired { bundle }
            | BundleInjected { bundle }
            | BundleCustodyAccepted { bundle, .. }
            | ReassemblyCompleted { bundle } => summary.fill_bundle(bundle),
            ContactUp { link }
            | ContactDown { link, .. }
            | LinkCreated { link }
            | LinkDeleted { link }
            | LinkAvailable { link, .. }
            | LinkUnavailable { link, .. }
            | LinkCheckDeferred { link } => summary.link = Some(link.clone()),
            RegistrationAdded { regid }
            | RegistrationRemoved { regid }
            | RegistrationExpired { regid } => summary.regid = Some(*regid),
            CustodyTimeout {
                bundle_id, link, ..
            } => {
                summary.bundle_id = Some(*bundle_id);
                summary.link = Some(link.clone());
            }
            _ => {}
        }
        summary
    }

    fn fill_bundle(&mut self, bundle: &waypoint_core::BundleRef) {
        self.bundle_id = Some(bundle.id());
        self.gbof = Some(bundle.gbof().to_key());
        self.dest = Some(bundle.dest().as_str().to_string());
    }
}

/// A decision from the external agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum RouterCommand {
    /// Queue a bundle on a link
    SendBundle {
        bundle_id: u64,
        link: String,
        #[serde(default)]
        copy: bool,
    },
    /// Cancel a bundle's transmission on a link
    CancelBundle { bundle_id: u64, link: String },
    /// Open a link
    OpenLink { link: String },
    /// Close a link
    CloseLink { link: String },
    /// Add a route
    AddRoute {
        pattern: String,
        link: String,
        #[serde(default)]
        priority: u32,
    },
    /// Delete routes by pattern
    DeleteRoute { pattern: String },
}

/// The in-process half of the external router
pub struct ExternalRouter {
    events_tx: mpsc::UnboundedSender<String>,
}

impl ExternalRouter {
    /// Create the bridge; the receiver is the agent-bound event stream
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { events_tx }), events_rx)
    }

    /// Apply one agent decision by posting the matching event
    pub async fn apply(core: &Arc<DaemonCore>, command: RouterCommand) -> DaemonResult<()> {
        match command {
            RouterCommand::SendBundle {
                bundle_id,
                link,
                copy,
            } => {
                let bundle = core
                    .all_bundles
                    .find(bundle_id)
                    .ok_or(DaemonError::Configuration(format!(
                        "unknown bundle {bundle_id}"
                    )))?;
                let action = if copy {
                    ForwardingAction::Copy
                } else {
                    ForwardingAction::Forward
                };
                core.bus()
                    .post(BundleEvent::BundleSend {
                        bundle,
                        link,
                        action,
                    })
                    .await
            }
            RouterCommand::CancelBundle { bundle_id, link } => {
                let bundle = core
                    .all_bundles
                    .find(bundle_id)
                    .ok_or(DaemonError::Configuration(format!(
                        "unknown bundle {bundle_id}"
                    )))?;
                core.bus()
                    .post(BundleEvent::BundleCancel { bundle, link })
                    .await
            }
            RouterCommand::OpenLink { link } => core.request_link_open(&link).await,
            RouterCommand::CloseLink { link } => {
                core.bus()
                    .post(BundleEvent::LinkStateChangeRequest {
                        link,
                        state: LinkState::Unavailable,
                        reason: ContactReason::User,
                    })
                    .await
            }
            RouterCommand::AddRoute {
                pattern,
                link,
                priority,
            } => {
                let pattern = EidPattern::parse(&pattern)?;
                core.bus()
                    .post(BundleEvent::RouteAdd {
                        entry: RouteEntry::to_link(pattern, link).with_priority(priority),
                    })
                    .await
            }
            RouterCommand::DeleteRoute { pattern } => {
                core.bus().post(BundleEvent::RouteDel { pattern }).await
            }
        }
    }

    /// Drive agent decisions from a JSON-lines stream
    pub async fn run_commands(
        core: Arc<DaemonCore>,
        mut commands: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(line) = commands.recv().await {
            match serde_json::from_str::<RouterCommand>(&line) {
                Ok(command) => {
                    debug!(?command, "external router command");
                    if let Err(e) = Self::apply(&core, command).await {
                        warn!(error = %e, "external router command failed");
                    }
                }
                Err(e) => warn!(error = %e, line = %line, "unparseable external router command"),
            }
        }
    }
}

#[async_trait]
impl Router for ExternalRouter {
    fn name(&self) -> &str {
        "external"
    }

    async fn handle_event(&self, _core: &Arc<DaemonCore>, event: &BundleEvent) {
        let summary = ExternalEvent::from_event(event);
        match serde_json::to_string(&summary) {
            Ok(line) => {
                if self.events_tx.send(line).is_err() {
                    warn!("external router event stream closed");
                }
            }
            Err(e) => warn!(error = %e, "cannot serialize event for external router"),
        }
    }
}
