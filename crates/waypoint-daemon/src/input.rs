//! The input processor
//!
//! Every arriving bundle - network, application, reload, or generated -
//! passes through here exactly once: invariant validation, quota
//! reservation, duplicate suppression, extension-block consumption,
//! administrative-record dispatch, reassembly, and the custody decision.
//! Accepted bundles are tracked, persisted, and offered for local
//! delivery; the router sees the arrival event afterwards and decides
//! forwarding.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use waypoint_codec::{BlockData, BlockFlags, CustodySignalReason, RawBlock, StatusReason};
use waypoint_core::{Bundle, BundleRef, GbofId, Payload};

use crate::acs::cteb_creator_matches;
use crate::bus::{EventEnvelope, EventQueue};
use crate::daemon::{DaemonCore, ReportKind};
use crate::error::DaemonResult;
use crate::event::{BundleEvent, EventSource};
use crate::stats::DaemonStats;

/// Input processor loop
pub async fn run_input(core: Arc<DaemonCore>, mut queue: EventQueue) {
    let mut shutdown = core.subscribe_shutdown();
    let mut draining = false;
    loop {
        let envelope = if draining {
            // Settle the queued work, then stop
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
        debug!(event = event.type_str(), "input event");

        if let Err(e) = handle_input_event(&core, &event).await {
            warn!(event = event.type_str(), error = %e, "input event failed");
        }
        if !event.daemon_only() {
            core.router().handle_event(&core, &event).await;
        }
        DaemonStats::bump(&core.stats.events_processed);
        core.bus().touch();
        EventEnvelope::complete(done);
    }
    debug!("input processor stopped");
}

async fn handle_input_event(core: &Arc<DaemonCore>, event: &BundleEvent) -> DaemonResult<()> {
    match event {
        BundleEvent::BundleReceived {
            bundle,
            source,
            link,
        } => handle_arrival(core, bundle, *source, link.as_deref()).await,
        BundleEvent::ReassemblyCompleted { bundle } => {
            handle_arrival(core, bundle, EventSource::Admin, None).await
        }
        _ => Ok(()),
    }
}

async fn handle_arrival(
    core: &Arc<DaemonCore>,
    bundle: &BundleRef,
    source: EventSource,
    _link: Option<&str>,
) -> DaemonResult<()> {
    DaemonStats::bump(&core.stats.received);

    if let Err(e) = bundle.validate() {
        warn!(bundle = %bundle, error = %e, "rejecting invalid bundle");
        DaemonStats::bump(&core.stats.rejected);
        return Ok(());
    }

    // Reloaded bundles re-enter tracking without re-running admission
    if source == EventSource::Store {
        return restore_arrival(core, bundle);
    }

    // Payload quota admission
    let payload_len = bundle.payload_len();
    {
        let mut state = bundle.state();
        if !state.space_reserved {
            if !core.store().quota().try_reserve(payload_len) {
                drop(state);
                warn!(bundle = %bundle, payload_len, "payload quota depleted; rejecting");
                DaemonStats::bump(&core.stats.rejected);
                reject_for_storage(core, bundle).await?;
                return Ok(());
            }
            state.space_reserved = true;
        }
    }

    // Duplicate suppression by GBOF key
    let gbof_key = bundle.gbof().to_key();
    if core.dupefinder.contains_key(&gbof_key) {
        info!(bundle = %bundle, "duplicate bundle suppressed");
        DaemonStats::bump(&core.stats.duplicates);
        release_admission(core, bundle, payload_len);
        let custodian = bundle.state().custodian.clone();
        if bundle.custody_requested() && !custodian.is_null() {
            core.send_custody_signal(
                custodian,
                bundle,
                false,
                CustodySignalReason::RedundantReception,
            )
            .await?;
        }
        return Ok(());
    }

    // Consume extension blocks
    if !consume_blocks(core, bundle).await? {
        DaemonStats::bump(&core.stats.rejected);
        release_admission(core, bundle, payload_len);
        return Ok(());
    }

    // Administrative records addressed to this node are consumed, not stored
    if bundle.is_admin() && core.is_local_dest(bundle.dest()) {
        release_admission(core, bundle, payload_len);
        return consume_admin(core, bundle).await;
    }

    // Fragments for a local destination go to reassembly
    if bundle.is_fragment() && core.is_local_dest(bundle.dest()) {
        release_admission(core, bundle, payload_len);
        return track_fragment(core, bundle).await;
    }

    if source == EventSource::Peer {
        core.send_status_report(bundle, ReportKind::Received, StatusReason::NoAdditionalInfo)
            .await?;
    }

    core.dupefinder.insert(&gbof_key, bundle.clone());
    core.track_bundle(bundle);

    // Custody decision
    if bundle.custody_requested() && core.router().accept_custody(core, bundle) {
        core.bus()
            .post(BundleEvent::BundleTakeCustody {
                bundle: bundle.clone(),
            })
            .await?;
    }

    // Local delivery
    for reg in core.regs.matching(bundle.dest()) {
        core.bus()
            .post(BundleEvent::DeliverBundleToReg {
                bundle: bundle.clone(),
                regid: reg.regid(),
            })
            .await?;
    }

    core.bus()
        .post(BundleEvent::StoreBundleUpdate {
            bundle: bundle.clone(),
        })
        .await
}

/// Re-track a bundle reloaded from the store
fn restore_arrival(core: &Arc<DaemonCore>, bundle: &BundleRef) -> DaemonResult<()> {
    core.dupefinder
        .insert(&bundle.gbof().to_key(), bundle.clone());
    core.track_bundle(bundle);
    let (local_custody, custody_id) = {
        let state = bundle.state();
        (state.local_custody, state.custody_id)
    };
    if local_custody && custody_id != 0 {
        core.custody_bundles.insert(custody_id, bundle.clone());
    }
    Ok(())
}

fn release_admission(core: &Arc<DaemonCore>, bundle: &BundleRef, payload_len: u64) {
    let mut state = bundle.state();
    if state.space_reserved {
        core.store().quota().release(payload_len);
        state.space_reserved = false;
    }
}

async fn reject_for_storage(core: &Arc<DaemonCore>, bundle: &BundleRef) -> DaemonResult<()> {
    core.send_status_report(bundle, ReportKind::Deleted, StatusReason::DepletedStorage)
        .await?;
    let custodian = bundle.state().custodian.clone();
    if bundle.custody_requested() && !custodian.is_null() {
        core.send_custody_signal(
            custodian,
            bundle,
            false,
            CustodySignalReason::DepletedStorage,
        )
        .await?;
    }
    Ok(())
}

/// Interpret the received extension blocks; false means drop the bundle
async fn consume_blocks(core: &Arc<DaemonCore>, bundle: &BundleRef) -> DaemonResult<bool> {
    let carried = bundle.state().recv_blocks.clone();
    let mut keep = Vec::with_capacity(carried.len());

    for block in carried {
        let raw = RawBlock::from_carried(&block);
        match BlockData::parse(&raw) {
            Ok(BlockData::PreviousHop(eid)) => {
                bundle.state().prevhop = Some(eid);
            }
            Ok(BlockData::Age(age)) => {
                bundle.state().age_secs = age;
            }
            Ok(BlockData::CustodyTransferEnhancement(cteb)) => {
                let custodian = bundle.state().custodian.clone();
                let accept_legacy = core.acs.config().accept_legacy_cteb;
                if cteb_creator_matches(&cteb.custodian, &custodian, accept_legacy) {
                    let mut state = bundle.state();
                    state.cteb_valid = true;
                    state.cteb_custody_id = cteb.custody_id;
                } else {
                    debug!(
                        bundle = %bundle,
                        creator = %cteb.custodian,
                        custodian = %custodian,
                        "CTEB creator does not match custodian; ignoring block"
                    );
                }
                keep.push(block);
            }
            Ok(BlockData::Payload(_)) => {}
            Ok(BlockData::Unknown { .. }) => keep.push(block),
            Err(_) => {
                let flags = raw.flags;
                if flags.contains(BlockFlags::DELETE_BUNDLE_IF_UNPROCESSED) {
                    warn!(
                        bundle = %bundle,
                        block_type = raw.block_type,
                        "unintelligible block requires bundle deletion"
                    );
                    core.send_status_report(
                        bundle,
                        ReportKind::Deleted,
                        StatusReason::BlockUnintelligible,
                    )
                    .await?;
                    return Ok(false);
                }
                if flags.contains(BlockFlags::REPORT_IF_UNPROCESSED) {
                    core.send_status_report(
                        bundle,
                        ReportKind::Received,
                        StatusReason::BlockUnintelligible,
                    )
                    .await?;
                }
                if !flags.contains(BlockFlags::DISCARD_IF_UNPROCESSED) {
                    keep.push(block);
                }
            }
        }
    }

    bundle.state().recv_blocks = keep;
    Ok(true)
}

/// Dispatch an administrative record addressed to this node
async fn consume_admin(core: &Arc<DaemonCore>, bundle: &BundleRef) -> DaemonResult<()> {
    let payload = core.read_payload_range(bundle, 0, bundle.payload_len())?;
    match waypoint_codec::AdminRecord::decode(&payload) {
        Ok(waypoint_codec::AdminRecord::CustodySignal(signal)) => {
            core.bus()
                .post(BundleEvent::CustodySignal { signal })
                .await
        }
        Ok(waypoint_codec::AdminRecord::Acs(signal)) => {
            core.bus()
                .post(BundleEvent::AggregateCustodySignal { signal })
                .await
        }
        Ok(waypoint_codec::AdminRecord::StatusReport(report)) => {
            info!(
                source = %report.orig_source,
                reason = ?report.reason,
                "status report received"
            );
            Ok(())
        }
        Err(e) => {
            warn!(bundle = %bundle, error = %e, "unintelligible administrative record");
            Ok(())
        }
    }
}

/// Track an arriving fragment; synthesize the original when complete
async fn track_fragment(core: &Arc<DaemonCore>, bundle: &BundleRef) -> DaemonResult<()> {
    if !core.reassembly.add_fragment(bundle) {
        DaemonStats::bump(&core.stats.duplicates);
        return Ok(());
    }
    let key = bundle.gbof().original().to_key();
    let Some((fragments, total_len)) = core.reassembly.take_complete(&key) else {
        return Ok(());
    };

    // Contiguous coverage reached: splice the payload back together
    let mut payload = BytesMut::with_capacity(total_len as usize);
    let mut covered = 0u64;
    for fragment in &fragments {
        let start = fragment.frag_offset();
        let end = start + fragment.payload_len();
        if end <= covered {
            continue;
        }
        let skip = covered.saturating_sub(start);
        let bytes =
            core.read_payload_range(fragment, skip, fragment.payload_len() - skip)?;
        payload.extend_from_slice(&bytes);
        covered = end;
    }

    let template = &fragments[0];
    let gbof = GbofId::new(template.source().clone(), template.creation_ts());
    let mut original = Bundle::new(
        core.alloc_bundle_id(),
        gbof,
        template.dest().clone(),
        Payload::memory(payload.freeze()),
        template.expiration_secs(),
    )
    .with_priority(template.priority())
    .with_singleton(template.singleton_dest())
    .with_reports(template.reports())
    .with_replyto(template.replyto().clone());
    if template.custody_requested() {
        original = original.with_custody();
    }
    let original = Arc::new(original);
    {
        let mut state = original.state();
        state.custodian = template.state().custodian.clone();
    }

    info!(
        key = %key,
        total_len,
        fragments = fragments.len(),
        original = %original,
        "reassembly completed"
    );
    core.bus()
        .post(BundleEvent::ReassemblyCompleted { bundle: original })
        .await
}
