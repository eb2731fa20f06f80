//! The ACS processor
//!
//! Owns aggregate-custody-signal batching: custody acknowledgements
//! arrive as `IssueAggregateCustodySignal` events, accumulate in the
//! [`AcsEngine`](crate::acs::AcsEngine), and leave as one ACS admin
//! bundle per (custodian, outcome, reason) when the size threshold or
//! the per-key window is reached. Pending sets are persisted after every
//! change so a restart picks up where the window left off.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use waypoint_codec::{AdminRecord, AggregateCustodySignal, CustodySignalReason};
use waypoint_core::EndpointId;
use waypoint_storage::PendingAcsRecord;

use crate::acs::{AcsDisposition, AcsKey};
use crate::bus::{EventEnvelope, EventQueue};
use crate::daemon::DaemonCore;
use crate::error::DaemonResult;
use crate::event::BundleEvent;
use crate::stats::DaemonStats;

/// ACS processor loop
pub async fn run_acs(core: Arc<DaemonCore>, mut queue: EventQueue) {
    let mut shutdown = core.subscribe_shutdown();
    let mut draining = false;
    loop {
        let envelope = if draining {
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
        debug!(event = event.type_str(), "acs event");

        if let Err(e) = handle_acs_event(&core, &event).await {
            warn!(event = event.type_str(), error = %e, "acs event failed");
        }
        DaemonStats::bump(&core.stats.events_processed);
        core.bus().touch();
        EventEnvelope::complete(done);
    }
    debug!("acs processor stopped");
}

/// Arrange an `AcsExpired` event for `key` after the configured window
pub fn schedule_acs_flush(core: &Arc<DaemonCore>, key: AcsKey) -> AbortHandle {
    let bus = core.bus().clone();
    let delay = Duration::from_secs(core.acs.config().delay_secs);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = bus
            .post(BundleEvent::AcsExpired {
                custodian: key.custodian,
                succeeded: key.succeeded,
                reason: key.reason,
            })
            .await;
    })
    .abort_handle()
}

async fn handle_acs_event(core: &Arc<DaemonCore>, event: &BundleEvent) -> DaemonResult<()> {
    match event {
        BundleEvent::IssueAggregateCustodySignal {
            custodian,
            succeeded,
            reason,
            custody_id,
        } => {
            let key = AcsKey {
                custodian: custodian.clone(),
                succeeded: *succeeded,
                reason: *reason,
            };
            let timer_key = key.clone();
            let timer_core = core.clone();
            let disposition = core.acs.add(key.clone(), *custody_id, move || {
                schedule_acs_flush(&timer_core, timer_key)
            });

            match disposition {
                AcsDisposition::Flush(ids) => {
                    flush_acs(core, &key, ids).await?;
                }
                AcsDisposition::Scheduled | AcsDisposition::Accumulated => {
                    if let Some(record) = core.acs.record_for(&key) {
                        core.store().put_pending_acs(&record)?;
                    }
                }
            }
        }
        BundleEvent::AcsExpired {
            custodian,
            succeeded,
            reason,
        } => {
            let key = AcsKey {
                custodian: custodian.clone(),
                succeeded: *succeeded,
                reason: *reason,
            };
            if let Some(ids) = core.acs.take(&key) {
                flush_acs(core, &key, ids).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Serialize and send one aggregate custody signal
async fn flush_acs(
    core: &Arc<DaemonCore>,
    key: &AcsKey,
    ids: BTreeSet<u64>,
) -> DaemonResult<()> {
    let reason =
        CustodySignalReason::from_u8(key.reason).unwrap_or(CustodySignalReason::NoAdditionalInfo);
    let signal = AggregateCustodySignal::from_ids(key.succeeded, reason, &ids);
    let dest = EndpointId::parse(&key.custodian)?;

    debug!(
        custodian = %key.custodian,
        ids = ids.len(),
        fills = signal.fills.len(),
        "flushing aggregate custody signal"
    );
    core.store()
        .del_pending_acs(&PendingAcsRecord::key_for(&key.custodian, key.succeeded, key.reason))?;
    core.inject_admin(dest, AdminRecord::Acs(signal).encode())
        .await
}
