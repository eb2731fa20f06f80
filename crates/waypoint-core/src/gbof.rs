//! Globally-unique bundle identity and DTN time
//!
//! The GBOF id ("Global Bundle Originator + Fragment") is the tuple that
//! names a bundle network-wide: source endpoint, creation timestamp, and
//! the fragment fields when the bundle is a fragment. Its string form is
//! the key used for duplicate detection and reassembly grouping.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::eid::EndpointId;

/// Seconds between the Unix epoch and the DTN epoch (2000-01-01T00:00:00Z)
pub const DTN_TIME_OFFSET: u64 = 946_684_800;

/// Current time in seconds since the DTN epoch
pub fn dtn_time_now() -> u64 {
    let unix = Utc::now().timestamp().max(0) as u64;
    unix.saturating_sub(DTN_TIME_OFFSET)
}

/// A bundle creation timestamp: DTN-epoch seconds plus a per-second sequence
///
/// Also used for the timestamp pairs carried in status reports and custody
/// signals, which share the same wire shape.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct CreationTimestamp {
    /// Seconds since the DTN epoch
    pub secs: u64,
    /// Sequence number distinguishing bundles created in the same second
    pub seq: u64,
}

impl CreationTimestamp {
    /// Build from explicit parts
    pub fn new(secs: u64, seq: u64) -> Self {
        Self { secs, seq }
    }

    /// Timestamp for a bundle created now
    pub fn now(seq: u64) -> Self {
        Self {
            secs: dtn_time_now(),
            seq,
        }
    }
}

impl std::fmt::Display for CreationTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.secs, self.seq)
    }
}

/// The globally-unique identity of a bundle
///
/// Two bundles with equal `GbofId`s are the same bundle (or copies of it)
/// anywhere in the network. Fragments of one original share everything but
/// the fragment fields; [`GbofId::original`] strips those to produce the
/// reassembly key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GbofId {
    /// Source endpoint of the original bundle
    pub source: EndpointId,
    /// Creation timestamp of the original bundle
    pub creation_ts: CreationTimestamp,
    /// Whether this identifies a fragment
    pub is_fragment: bool,
    /// Payload offset of this fragment within the original
    pub frag_offset: u64,
    /// Length of this fragment's payload
    pub frag_length: u64,
}

impl GbofId {
    /// Identity for a whole (non-fragment) bundle
    pub fn new(source: EndpointId, creation_ts: CreationTimestamp) -> Self {
        Self {
            source,
            creation_ts,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
        }
    }

    /// Identity for a fragment of the bundle named by `self`
    pub fn fragment(&self, offset: u64, length: u64) -> Self {
        Self {
            source: self.source.clone(),
            creation_ts: self.creation_ts,
            is_fragment: true,
            frag_offset: offset,
            frag_length: length,
        }
    }

    /// The identity of the original bundle (fragment fields cleared)
    pub fn original(&self) -> Self {
        Self {
            source: self.source.clone(),
            creation_ts: self.creation_ts,
            is_fragment: false,
            frag_offset: 0,
            frag_length: 0,
        }
    }

    /// The string key used for duplicate detection and reassembly lists
    pub fn to_key(&self) -> String {
        if self.is_fragment {
            format!(
                "{},{},frag:{}+{}",
                self.source, self.creation_ts, self.frag_offset, self.frag_length
            )
        } else {
            format!("{},{}", self.source, self.creation_ts)
        }
    }
}

impl std::fmt::Display for GbofId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gbof() -> GbofId {
        GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(800_000_000, 3),
        )
    }

    #[test]
    fn test_key_distinguishes_fragments() {
        let whole = make_gbof();
        let frag_a = whole.fragment(0, 1000);
        let frag_b = whole.fragment(1000, 500);

        assert_ne!(whole.to_key(), frag_a.to_key());
        assert_ne!(frag_a.to_key(), frag_b.to_key());
        assert_eq!(frag_a.original(), whole);
        assert_eq!(frag_b.original(), whole);
    }

    #[test]
    fn test_equal_ids_equal_keys() {
        let a = make_gbof();
        let b = make_gbof();
        assert_eq!(a, b);
        assert_eq!(a.to_key(), b.to_key());
    }

    #[test]
    fn test_dtn_time_is_past_2020() {
        // 2020-01-01 is 631_152_000 seconds past the DTN epoch
        assert!(dtn_time_now() > 631_152_000);
    }
}
