//! The router contract
//!
//! A router is any component that subscribes to daemon events and asks
//! for transmissions by posting events back - all mutation goes through
//! the event bus, never directly from router code. The daemon also
//! consults the router at a few policy points: bundle admission, custody
//! acceptance, and destruction.
//!
//! Two implementations ship with the core: [`TableRouter`], driven by the
//! static route table, and [`ExternalRouter`], which forwards events to
//! an out-of-process agent and applies its decisions.

pub mod external;
pub mod static_router;

use std::sync::Arc;

use async_trait::async_trait;

use waypoint_codec::StatusReason;
use waypoint_core::BundleRef;

use crate::daemon::DaemonCore;
use crate::event::BundleEvent;

pub use external::{ExternalRouter, RouterCommand};
pub use static_router::TableRouter;

/// The pluggable routing component
#[async_trait]
pub trait Router: Send + Sync {
    /// Router name for logs
    fn name(&self) -> &str;

    /// Observe an event the daemon finished handling
    ///
    /// Called for every non-daemon-only event, on the processor that
    /// handled it. Reactions are posted back as events.
    async fn handle_event(&self, core: &Arc<DaemonCore>, event: &BundleEvent);

    /// Whether to admit an inbound bundle; a rejection carries the
    /// status-report reason sent back to the application
    fn accept_bundle(
        &self,
        _core: &Arc<DaemonCore>,
        _bundle: &BundleRef,
    ) -> Result<(), StatusReason> {
        Ok(())
    }

    /// Whether this node should take custody of the bundle
    fn accept_custody(&self, _core: &Arc<DaemonCore>, _bundle: &BundleRef) -> bool {
        true
    }

    /// Gate on bundle destruction
    fn can_delete_bundle(&self, _core: &Arc<DaemonCore>, _bundle: &BundleRef) -> bool {
        true
    }

    /// Cleanup hook invoked when the daemon destroys a bundle
    fn delete_bundle(&self, _core: &Arc<DaemonCore>, _bundle: &BundleRef) {}
}
