//! The output processor
//!
//! Takes bundles the main processor queued on open links, fragments them
//! proactively when the link's MTU demands it, serializes them (per-link
//! extension blocks included), and hands the wire bytes to the
//! convergence layer. Transmission completion comes back as a
//! `BundleTransmitted` event from the adapter.

use std::sync::Arc;

use tracing::{debug, warn};

use waypoint_codec::{
    encode_bundle, BlockData, BlockFlags, CtebData, FragmentInfo, PrimaryBlock, ProcessingFlags,
    RawBlock, StatusReason,
};
use waypoint_core::{BundleRef, ForwardingAction, ForwardingState};

use crate::bus::{EventEnvelope, EventQueue};
use crate::daemon::DaemonCore;
use crate::error::DaemonResult;
use crate::event::{BundleEvent, ContactReason};
use crate::fragmentation::plan_fragments;
use crate::link::{LinkRef, LinkState};
use crate::stats::DaemonStats;

/// Output processor loop
pub async fn run_output(core: Arc<DaemonCore>, mut queue: EventQueue) {
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
        debug!(event = event.type_str(), "output event");

        if let BundleEvent::BundleTransmitReady { bundle, link } = &event {
            if let Err(e) = handle_transmit(&core, bundle, link).await {
                warn!(bundle = %bundle, link = %link, error = %e, "transmission failed");
            }
        }
        DaemonStats::bump(&core.stats.events_processed);
        core.bus().touch();
        EventEnvelope::complete(done);
    }
    debug!("output processor stopped");
}

async fn handle_transmit(
    core: &Arc<DaemonCore>,
    bundle: &BundleRef,
    link_name: &str,
) -> DaemonResult<()> {
    let Some(link) = core.get_link(link_name) else {
        return Ok(());
    };
    if link.state() != LinkState::Open {
        // Still queued; the contact-up handler re-posts
        return Ok(());
    }
    if !link.queue.contains(bundle) {
        // Cancelled or already taken
        return Ok(());
    }

    let payload_len = bundle.payload_len();
    let mtu = link.params().mtu;
    if mtu > 0 && payload_len > mtu {
        return fragment_for_link(core, bundle, &link).await;
    }

    let wire = serialize_bundle(core, bundle, &link)?;

    link.del_from_queue(bundle);
    link.add_to_inflight(bundle);
    bundle
        .state()
        .fwdlog
        .update(link_name, ForwardingState::InFlight);

    let Some(cl) = core.cl_for(&link) else {
        warn!(link = link_name, "no convergence layer registered");
        link.del_from_inflight(bundle);
        bundle
            .state()
            .fwdlog
            .update(link_name, ForwardingState::Failed);
        return Ok(());
    };

    if let Err(e) = cl.send(&link, bundle, wire).await {
        warn!(link = link_name, error = %e, "convergence layer send failed");
        link.del_from_inflight(bundle);
        bundle
            .state()
            .fwdlog
            .update(link_name, ForwardingState::Failed);
        core.bus()
            .post(BundleEvent::LinkStateChangeRequest {
                link: link_name.to_string(),
                state: LinkState::Unavailable,
                reason: ContactReason::Broken,
            })
            .await?;
    }
    Ok(())
}

/// Proactive fragmentation: replace the queued bundle with MTU-sized
/// fragments
async fn fragment_for_link(
    core: &Arc<DaemonCore>,
    bundle: &BundleRef,
    link: &LinkRef,
) -> DaemonResult<()> {
    let link_name = link.name();
    let payload_len = bundle.payload_len();

    if bundle.do_not_fragment() {
        warn!(
            bundle = %bundle,
            link = link_name,
            payload_len,
            mtu = link.params().mtu,
            "bundle exceeds MTU and must not fragment"
        );
        link.del_from_queue(bundle);
        bundle
            .state()
            .fwdlog
            .update(link_name, ForwardingState::Cancelled);
        core.bus()
            .post(BundleEvent::BundleSendCancelled {
                bundle: bundle.clone(),
                link: link_name.to_string(),
            })
            .await?;
        return Ok(());
    }

    let plans = plan_fragments(payload_len, link.params().mtu);
    debug!(
        bundle = %bundle,
        link = link_name,
        fragments = plans.len(),
        "proactive fragmentation"
    );
    for plan in plans {
        let fragment = core.make_fragment(bundle, plan.offset, plan.length).await?;
        core.bus()
            .post(BundleEvent::BundleSend {
                bundle: fragment,
                link: link_name.to_string(),
                action: ForwardingAction::Forward,
            })
            .await?;
    }

    link.del_from_queue(bundle);
    bundle
        .state()
        .fwdlog
        .update(link_name, ForwardingState::Cancelled);
    if !bundle.has_local_custody() {
        // The fragments supersede the original
        core.delete_bundle(bundle, StatusReason::NoAdditionalInfo).await?;
    }
    Ok(())
}

/// Build the wire form of a bundle for one link
fn serialize_bundle(
    core: &Arc<DaemonCore>,
    bundle: &BundleRef,
    link: &LinkRef,
) -> DaemonResult<bytes::Bytes> {
    let (custodian, local_custody, custody_id, age_secs, carried) = {
        let state = bundle.state();
        (
            state.custodian.clone(),
            state.local_custody,
            state.custody_id,
            state.age_secs,
            state
                .recv_blocks
                .iter()
                .chain(state.api_blocks.iter())
                .map(RawBlock::from_carried)
                .collect::<Vec<_>>(),
        )
    };

    let primary = PrimaryBlock {
        flags: ProcessingFlags::assemble(
            bundle.is_fragment(),
            bundle.is_admin(),
            bundle.do_not_fragment(),
            bundle.custody_requested(),
            bundle.singleton_dest(),
            bundle.priority(),
            bundle.reports(),
        ),
        dest: bundle.dest().clone(),
        source: bundle.source().clone(),
        replyto: bundle.replyto().clone(),
        custodian,
        creation_ts: bundle.creation_ts(),
        lifetime: bundle.expiration_secs(),
        fragment: bundle.is_fragment().then(|| FragmentInfo {
            offset: bundle.frag_offset(),
            total_length: bundle.orig_length(),
        }),
    };

    let mut ext_blocks = carried;
    if link.params().prevhop_hdr {
        ext_blocks
            .push(BlockData::PreviousHop(core.local_eid().clone()).to_raw(BlockFlags(0)));
    }
    if local_custody {
        let cteb = CtebData {
            custody_id,
            custodian: core.local_eid().as_str().to_string(),
        };
        ext_blocks.push(
            BlockData::CustodyTransferEnhancement(cteb)
                .to_raw(BlockFlags(0).with(BlockFlags::REPLICATE, true)),
        );
    }
    // Bundles from nodes without a synchronized clock carry their age
    if bundle.creation_ts().secs == 0 {
        ext_blocks.push(BlockData::Age(age_secs).to_raw(BlockFlags(0)));
    }

    let payload = core.read_payload_range(bundle, 0, bundle.payload_len())?;
    Ok(encode_bundle(&primary, &ext_blocks, &payload))
}
