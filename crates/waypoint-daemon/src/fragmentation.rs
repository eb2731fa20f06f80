//! Fragmentation planning and reassembly tracking
//!
//! Proactive fragmentation splits a bundle whose payload exceeds a link's
//! MTU into tiling fragments; reactive fragmentation synthesizes a new
//! fragment from the unacknowledged tail of a partial transmission. Both
//! are planned here and executed by the daemon, which owns id allocation
//! and payload access.
//!
//! Reassembly groups arriving fragments by the original bundle's GBOF
//! key and reports completion once the fragments tile the whole ADU.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use waypoint_core::{BundleList, BundleRef};

/// One planned fragment: payload range within the original ADU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPlan {
    /// Offset in the original ADU
    pub offset: u64,
    /// Fragment payload length
    pub length: u64,
}

/// Tile `[0, total_len)` into fragments of at most `max_fragment` bytes
///
/// Returns an empty plan when no fragmentation is needed.
pub fn plan_fragments(total_len: u64, max_fragment: u64) -> Vec<FragmentPlan> {
    if max_fragment == 0 || total_len <= max_fragment {
        return Vec::new();
    }
    let mut plans = Vec::new();
    let mut offset = 0;
    while offset < total_len {
        let length = max_fragment.min(total_len - offset);
        plans.push(FragmentPlan { offset, length });
        offset += length;
    }
    plans
}

/// The unacknowledged tail of a partial transmission
///
/// Returns `None` when everything (or nothing) was acknowledged; a fully
/// unacknowledged transmission is a retransmit, not a refragment.
pub fn plan_tail(payload_len: u64, acked_bytes: u64) -> Option<FragmentPlan> {
    if acked_bytes == 0 || acked_bytes >= payload_len {
        return None;
    }
    Some(FragmentPlan {
        offset: acked_bytes,
        length: payload_len - acked_bytes,
    })
}

struct ReassemblyState {
    total_len: u64,
    fragments: BundleList,
}

/// Tracks partially reassembled bundles by original GBOF key
pub struct ReassemblyTracker {
    states: Mutex<HashMap<String, ReassemblyState>>,
}

impl ReassemblyTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Insert an arriving fragment, keyed by its original bundle
    ///
    /// Returns false for non-fragments and duplicates.
    pub fn add_fragment(&self, bundle: &BundleRef) -> bool {
        if !bundle.is_fragment() {
            return false;
        }
        let key = bundle.gbof().original().to_key();
        let mut states = self.states.lock();
        let state = states.entry(key.clone()).or_insert_with(|| ReassemblyState {
            total_len: bundle.orig_length(),
            fragments: BundleList::new(format!("reassembly:{key}")),
        });

        // Duplicate offsets add nothing
        let offset = bundle.frag_offset();
        if state
            .fragments
            .snapshot()
            .iter()
            .any(|f| f.frag_offset() == offset && f.payload_len() == bundle.payload_len())
        {
            return false;
        }
        let inserted = state
            .fragments
            .insert_sorted(bundle.clone(), |b| b.frag_offset());
        if inserted {
            debug!(key = %key, offset, "tracked fragment");
        }
        inserted
    }

    /// Whether the fragments for `key` tile the whole original
    pub fn is_complete(&self, key: &str) -> bool {
        let states = self.states.lock();
        let Some(state) = states.get(key) else {
            return false;
        };
        coverage_complete(&state.fragments, state.total_len)
    }

    /// Remove and return the fragments once coverage is complete
    ///
    /// Returns the fragments sorted by offset plus the original ADU
    /// length. Overlapping fragments are fine; the caller slices.
    pub fn take_complete(&self, key: &str) -> Option<(Vec<BundleRef>, u64)> {
        let mut states = self.states.lock();
        let state = states.get(key)?;
        if !coverage_complete(&state.fragments, state.total_len) {
            return None;
        }
        let state = states.remove(key).expect("checked above");
        Some((state.fragments.drain(), state.total_len))
    }

    /// Drop the tracking state for `key` (e.g. original expired)
    pub fn abandon(&self, key: &str) -> Vec<BundleRef> {
        match self.states.lock().remove(key) {
            Some(state) => state.fragments.drain(),
            None => Vec::new(),
        }
    }

    /// Number of originals with outstanding fragments
    pub fn pending_count(&self) -> usize {
        self.states.lock().len()
    }
}

impl Default for ReassemblyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn coverage_complete(fragments: &BundleList, total_len: u64) -> bool {
    let mut covered = 0u64;
    for fragment in fragments.snapshot() {
        let start = fragment.frag_offset();
        let end = start + fragment.payload_len();
        if start > covered {
            return false;
        }
        covered = covered.max(end);
    }
    covered >= total_len && total_len > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use waypoint_core::{
        Bundle, CreationTimestamp, EndpointId, GbofId, Payload,
    };

    fn original_gbof() -> GbofId {
        GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, 9),
        )
    }

    fn make_fragment(id: u64, offset: u64, len: u64, total: u64) -> BundleRef {
        let gbof = original_gbof().fragment(offset, len);
        Arc::new(
            Bundle::new(
                id,
                gbof,
                EndpointId::parse("dtn://node-b/sink").unwrap(),
                Payload::memory(vec![0u8; len as usize]),
                3600,
            )
            .with_orig_length(total),
        )
    }

    #[test]
    fn test_plan_fragments_tiles_exactly() {
        let plans = plan_fragments(10_000, 3000);
        assert_eq!(
            plans,
            vec![
                FragmentPlan { offset: 0, length: 3000 },
                FragmentPlan { offset: 3000, length: 3000 },
                FragmentPlan { offset: 6000, length: 3000 },
                FragmentPlan { offset: 9000, length: 1000 },
            ]
        );
    }

    #[test]
    fn test_plan_fragments_mtu_boundary() {
        // Payload equal to the MTU goes as a single frame
        assert!(plan_fragments(3000, 3000).is_empty());
        // One byte under the payload forces a split
        assert_eq!(plan_fragments(3000, 2999).len(), 2);
        // MTU zero means unlimited
        assert!(plan_fragments(1 << 30, 0).is_empty());
    }

    #[test]
    fn test_plan_tail() {
        assert_eq!(
            plan_tail(1000, 400),
            Some(FragmentPlan { offset: 400, length: 600 })
        );
        assert!(plan_tail(1000, 0).is_none());
        assert!(plan_tail(1000, 1000).is_none());
    }

    #[test]
    fn test_reassembly_completes_on_full_coverage() {
        let tracker = ReassemblyTracker::new();
        let key = original_gbof().to_key();

        // Out-of-order arrival
        assert!(tracker.add_fragment(&make_fragment(2, 3000, 3000, 7000)));
        assert!(!tracker.is_complete(&key));
        assert!(tracker.add_fragment(&make_fragment(3, 6000, 1000, 7000)));
        assert!(!tracker.is_complete(&key));
        assert!(tracker.add_fragment(&make_fragment(1, 0, 3000, 7000)));
        assert!(tracker.is_complete(&key));

        let (fragments, total) = tracker.take_complete(&key).unwrap();
        assert_eq!(total, 7000);
        let offsets: Vec<u64> = fragments.iter().map(|f| f.frag_offset()).collect();
        assert_eq!(offsets, vec![0, 3000, 6000]);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_gap_blocks_completion() {
        let tracker = ReassemblyTracker::new();
        let key = original_gbof().to_key();

        tracker.add_fragment(&make_fragment(1, 0, 1000, 3000));
        tracker.add_fragment(&make_fragment(2, 2000, 1000, 3000));
        assert!(!tracker.is_complete(&key));
        assert!(tracker.take_complete(&key).is_none());
    }

    #[test]
    fn test_duplicate_fragment_rejected() {
        let tracker = ReassemblyTracker::new();
        assert!(tracker.add_fragment(&make_fragment(1, 0, 1000, 3000)));
        assert!(!tracker.add_fragment(&make_fragment(5, 0, 1000, 3000)));
    }

    #[test]
    fn test_non_fragment_rejected() {
        let tracker = ReassemblyTracker::new();
        let whole = Arc::new(Bundle::new(
            1,
            original_gbof(),
            EndpointId::parse("dtn://node-b/sink").unwrap(),
            Payload::memory(&b"x"[..]),
            60,
        ));
        assert!(!tracker.add_fragment(&whole));
    }

    #[test]
    fn test_abandon() {
        let tracker = ReassemblyTracker::new();
        let key = original_gbof().to_key();
        tracker.add_fragment(&make_fragment(1, 0, 1000, 3000));

        let dropped = tracker.abandon(&key);
        assert_eq!(dropped.len(), 1);
        assert_eq!(tracker.pending_count(), 0);
        // Fragment mappings cleared on drain
        assert_eq!(dropped[0].mapping_count(), 0);
    }
}
