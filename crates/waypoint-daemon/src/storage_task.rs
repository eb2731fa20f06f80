//! The storage processor
//!
//! Persists state changes asynchronously so the main processor never
//! blocks on disk. A storage failure mid-commit cannot be localized, so
//! it escalates to an orderly shutdown.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::bus::{EventEnvelope, EventQueue};
use crate::daemon::DaemonCore;
use crate::error::DaemonResult;
use crate::event::BundleEvent;
use crate::stats::DaemonStats;

/// Storage processor loop
pub async fn run_storage(core: Arc<DaemonCore>, mut queue: EventQueue) {
    let mut shutdown = core.subscribe_shutdown();
    let mut draining = false;
    loop {
        let envelope = if draining {
            // Let persistence settle before stopping
            match queue
                .next_timeout(std::time::Duration::from_millis(100))
                .await
            {
                Some(envelope) => envelope,
                None => break,
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    draining = true;
                    continue;
                }
                envelope = queue.next() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            }
        };
        let EventEnvelope { event, done } = envelope;
        debug!(event = event.type_str(), "storage event");

        match handle_storage_event(&core, &event).await {
            Ok(()) => {}
            // Quota pressure is a local, recoverable condition
            Err(crate::error::DaemonError::Storage(
                waypoint_storage::StorageError::QuotaExceeded { .. },
            )) => {
                warn!(event = event.type_str(), "payload quota exceeded; not persisted");
            }
            Err(e) => {
                error!(event = event.type_str(), error = %e, "storage failure; shutting down");
                let _ = core.bus().post(BundleEvent::ShutdownRequest).await;
            }
        }
        DaemonStats::bump(&core.stats.events_processed);
        core.bus().touch();
        EventEnvelope::complete(done);
    }
    debug!("storage processor stopped");
}

async fn handle_storage_event(core: &Arc<DaemonCore>, event: &BundleEvent) -> DaemonResult<()> {
    match event {
        BundleEvent::StoreBundleUpdate { bundle } => {
            core.store().add(bundle)?;
        }
        BundleEvent::StoreBundleDelete { bundle } => {
            core.store().del(bundle)?;
        }
        BundleEvent::StoreLinkUpdate { link } => {
            if let Some(link) = core.get_link(link) {
                core.store().put_link(&link.to_record())?;
            }
        }
        BundleEvent::StoreLinkDelete { link } => {
            core.store().del_link(link)?;
        }
        BundleEvent::StoreRegistrationUpdate { regid } => {
            if let Some(reg) = core.regs.get(*regid) {
                core.store().put_registration(&reg.to_record())?;
            }
        }
        BundleEvent::StoreRegistrationDelete { regid } => {
            core.store().del_registration(*regid)?;
        }
        _ => {}
    }
    Ok(())
}
