//! Administrative record payloads
//!
//! Status reports, custody signals, and aggregate custody signals. Each
//! record is the payload of an admin bundle; the first byte carries the
//! record type in its high nibble and the record flags (currently just
//! "refers to a fragment") in its low nibble.

use std::collections::BTreeSet;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use waypoint_core::{CreationTimestamp, EndpointId};

use crate::cursor::Cursor;
use crate::error::CodecError;
use crate::primary::FragmentInfo;
use crate::sdnv;

/// Administrative record type codes (high nibble of the first byte)
pub mod admin_type {
    /// Bundle status report
    pub const STATUS_REPORT: u8 = 0x01;
    /// Custody signal
    pub const CUSTODY_SIGNAL: u8 = 0x02;
    /// Aggregate custody signal
    pub const AGGREGATE_CUSTODY_SIGNAL: u8 = 0x04;
}

/// Record flag: the record refers to a fragment
const FLAG_FOR_FRAGMENT: u8 = 0x01;

/// Status report reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusReason {
    /// No additional information
    NoAdditionalInfo = 0,
    /// Lifetime expired
    LifetimeExpired = 1,
    /// Forwarded over a unidirectional link
    ForwardedUnidirectional = 2,
    /// Transmission cancelled
    TransmissionCancelled = 3,
    /// Depleted storage
    DepletedStorage = 4,
    /// Destination endpoint unintelligible
    DestinationUnintelligible = 5,
    /// No known route to destination
    NoRouteToDest = 6,
    /// No timely contact with next node
    NoTimelyContact = 7,
    /// A block was unintelligible
    BlockUnintelligible = 8,
}

impl StatusReason {
    /// Decode a reason byte
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => StatusReason::NoAdditionalInfo,
            1 => StatusReason::LifetimeExpired,
            2 => StatusReason::ForwardedUnidirectional,
            3 => StatusReason::TransmissionCancelled,
            4 => StatusReason::DepletedStorage,
            5 => StatusReason::DestinationUnintelligible,
            6 => StatusReason::NoRouteToDest,
            7 => StatusReason::NoTimelyContact,
            8 => StatusReason::BlockUnintelligible,
            _ => return Err(CodecError::Malformed("unknown status reason")),
        })
    }
}

/// Custody signal reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CustodySignalReason {
    /// No additional information
    NoAdditionalInfo = 0,
    /// The bundle was already received here
    RedundantReception = 3,
    /// Depleted storage
    DepletedStorage = 4,
    /// Destination endpoint unintelligible
    DestinationUnintelligible = 5,
    /// No known route to destination
    NoRouteToDest = 6,
    /// No timely contact with next node
    NoTimelyContact = 7,
    /// A block was unintelligible
    BlockUnintelligible = 8,
}

impl CustodySignalReason {
    /// Decode the reason bits of a custody status byte
    pub fn from_u8(v: u8) -> Result<Self, CodecError> {
        Ok(match v {
            0 => CustodySignalReason::NoAdditionalInfo,
            3 => CustodySignalReason::RedundantReception,
            4 => CustodySignalReason::DepletedStorage,
            5 => CustodySignalReason::DestinationUnintelligible,
            6 => CustodySignalReason::NoRouteToDest,
            7 => CustodySignalReason::NoTimelyContact,
            8 => CustodySignalReason::BlockUnintelligible,
            _ => return Err(CodecError::Malformed("unknown custody signal reason")),
        })
    }
}

/// A bundle status report
///
/// One optional timestamp per status assertion; the wire order of the
/// timestamp pairs is fixed (received, custody accepted, forwarded,
/// delivered, deleted, app-acknowledged).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Fragment fields when the subject bundle is a fragment
    pub fragment: Option<FragmentInfo>,
    /// Reason for the report
    pub reason: StatusReason,
    /// When the bundle was received
    pub received: Option<CreationTimestamp>,
    /// When custody was accepted
    pub custody_accepted: Option<CreationTimestamp>,
    /// When the bundle was forwarded
    pub forwarded: Option<CreationTimestamp>,
    /// When the bundle was delivered
    pub delivered: Option<CreationTimestamp>,
    /// When the bundle was deleted
    pub deleted: Option<CreationTimestamp>,
    /// When the application acknowledged the bundle
    pub acked_by_app: Option<CreationTimestamp>,
    /// Creation timestamp of the subject bundle
    pub orig_creation_ts: CreationTimestamp,
    /// Source of the subject bundle
    pub orig_source: EndpointId,
}

mod status_flag {
    pub const RECEIVED: u8 = 0x01;
    pub const CUSTODY_ACCEPTED: u8 = 0x02;
    pub const FORWARDED: u8 = 0x04;
    pub const DELIVERED: u8 = 0x08;
    pub const DELETED: u8 = 0x10;
    pub const ACKED_BY_APP: u8 = 0x20;
}

impl StatusReport {
    /// A report with no status assertions yet
    pub fn new(
        reason: StatusReason,
        orig_creation_ts: CreationTimestamp,
        orig_source: EndpointId,
        fragment: Option<FragmentInfo>,
    ) -> Self {
        Self {
            fragment,
            reason,
            received: None,
            custody_accepted: None,
            forwarded: None,
            delivered: None,
            deleted: None,
            acked_by_app: None,
            orig_creation_ts,
            orig_source,
        }
    }

    fn status_flags(&self) -> u8 {
        let mut flags = 0;
        if self.received.is_some() {
            flags |= status_flag::RECEIVED;
        }
        if self.custody_accepted.is_some() {
            flags |= status_flag::CUSTODY_ACCEPTED;
        }
        if self.forwarded.is_some() {
            flags |= status_flag::FORWARDED;
        }
        if self.delivered.is_some() {
            flags |= status_flag::DELIVERED;
        }
        if self.deleted.is_some() {
            flags |= status_flag::DELETED;
        }
        if self.acked_by_app.is_some() {
            flags |= status_flag::ACKED_BY_APP;
        }
        flags
    }

    /// Encode as an admin record payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let record_flags = if self.fragment.is_some() {
            FLAG_FOR_FRAGMENT
        } else {
            0
        };
        buf.put_u8((admin_type::STATUS_REPORT << 4) | record_flags);
        buf.put_u8(self.status_flags());
        buf.put_u8(self.reason as u8);
        if let Some(frag) = &self.fragment {
            sdnv::encode(frag.offset, &mut buf);
            sdnv::encode(frag.total_length, &mut buf);
        }
        for ts in [
            self.received,
            self.custody_accepted,
            self.forwarded,
            self.delivered,
            self.deleted,
            self.acked_by_app,
        ]
        .into_iter()
        .flatten()
        {
            sdnv::encode(ts.secs, &mut buf);
            sdnv::encode(ts.seq, &mut buf);
        }
        sdnv::encode(self.orig_creation_ts.secs, &mut buf);
        sdnv::encode(self.orig_creation_ts.seq, &mut buf);
        let eid = self.orig_source.as_str().as_bytes();
        sdnv::encode(eid.len() as u64, &mut buf);
        buf.put_slice(eid);
        buf.freeze()
    }

    /// Decode from an admin record payload
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(data);
        let first = cur.read_u8()?;
        if first >> 4 != admin_type::STATUS_REPORT {
            return Err(CodecError::UnknownAdminType {
                admin_type: first >> 4,
            });
        }
        let for_fragment = first & FLAG_FOR_FRAGMENT != 0;
        let flags = cur.read_u8()?;
        let reason = StatusReason::from_u8(cur.read_u8()?)?;

        let fragment = if for_fragment {
            Some(FragmentInfo {
                offset: cur.read_sdnv()?,
                total_length: cur.read_sdnv()?,
            })
        } else {
            None
        };

        let mut read_ts = |asserted: bool| -> Result<Option<CreationTimestamp>, CodecError> {
            if !asserted {
                return Ok(None);
            }
            Ok(Some(CreationTimestamp::new(
                cur.read_sdnv()?,
                cur.read_sdnv()?,
            )))
        };

        let received = read_ts(flags & status_flag::RECEIVED != 0)?;
        let custody_accepted = read_ts(flags & status_flag::CUSTODY_ACCEPTED != 0)?;
        let forwarded = read_ts(flags & status_flag::FORWARDED != 0)?;
        let delivered = read_ts(flags & status_flag::DELIVERED != 0)?;
        let deleted = read_ts(flags & status_flag::DELETED != 0)?;
        let acked_by_app = read_ts(flags & status_flag::ACKED_BY_APP != 0)?;

        let orig_creation_ts = CreationTimestamp::new(cur.read_sdnv()?, cur.read_sdnv()?);
        let eid_len = cur.read_sdnv()? as usize;
        let eid_bytes = cur.read_bytes(eid_len)?;
        let orig_source = EndpointId::parse(
            std::str::from_utf8(eid_bytes)
                .map_err(|_| CodecError::Malformed("non-utf8 source EID"))?,
        )?;

        Ok(Self {
            fragment,
            reason,
            received,
            custody_accepted,
            forwarded,
            delivered,
            deleted,
            acked_by_app,
            orig_creation_ts,
            orig_source,
        })
    }
}

/// A custody signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    /// Whether custody was accepted (true) or refused (false)
    pub succeeded: bool,
    /// Reason code
    pub reason: CustodySignalReason,
    /// Fragment fields when the subject bundle is a fragment
    pub fragment: Option<FragmentInfo>,
    /// When the signal was generated
    pub signal_ts: CreationTimestamp,
    /// Creation timestamp of the subject bundle
    pub orig_creation_ts: CreationTimestamp,
    /// Source of the subject bundle
    pub orig_source: EndpointId,
}

impl CustodySignal {
    /// Encode as an admin record payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let record_flags = if self.fragment.is_some() {
            FLAG_FOR_FRAGMENT
        } else {
            0
        };
        buf.put_u8((admin_type::CUSTODY_SIGNAL << 4) | record_flags);
        let mut status = self.reason as u8;
        if self.succeeded {
            status |= 0x80;
        }
        buf.put_u8(status);
        if let Some(frag) = &self.fragment {
            sdnv::encode(frag.offset, &mut buf);
            sdnv::encode(frag.total_length, &mut buf);
        }
        sdnv::encode(self.signal_ts.secs, &mut buf);
        sdnv::encode(self.signal_ts.seq, &mut buf);
        sdnv::encode(self.orig_creation_ts.secs, &mut buf);
        sdnv::encode(self.orig_creation_ts.seq, &mut buf);
        let eid = self.orig_source.as_str().as_bytes();
        sdnv::encode(eid.len() as u64, &mut buf);
        buf.put_slice(eid);
        buf.freeze()
    }

    /// Decode from an admin record payload
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(data);
        let first = cur.read_u8()?;
        if first >> 4 != admin_type::CUSTODY_SIGNAL {
            return Err(CodecError::UnknownAdminType {
                admin_type: first >> 4,
            });
        }
        let for_fragment = first & FLAG_FOR_FRAGMENT != 0;
        let status = cur.read_u8()?;
        let succeeded = status & 0x80 != 0;
        let reason = CustodySignalReason::from_u8(status & 0x7f)?;

        let fragment = if for_fragment {
            Some(FragmentInfo {
                offset: cur.read_sdnv()?,
                total_length: cur.read_sdnv()?,
            })
        } else {
            None
        };

        let signal_ts = CreationTimestamp::new(cur.read_sdnv()?, cur.read_sdnv()?);
        let orig_creation_ts = CreationTimestamp::new(cur.read_sdnv()?, cur.read_sdnv()?);
        let eid_len = cur.read_sdnv()? as usize;
        let eid_bytes = cur.read_bytes(eid_len)?;
        let orig_source = EndpointId::parse(
            std::str::from_utf8(eid_bytes)
                .map_err(|_| CodecError::Malformed("non-utf8 source EID"))?,
        )?;

        Ok(Self {
            succeeded,
            reason,
            fragment,
            signal_ts,
            orig_creation_ts,
            orig_source,
        })
    }
}

/// An aggregate custody signal: one acknowledgement covering many
/// custody ids, run-length encoded
///
/// The fills are stored with absolute start ids; the wire carries deltas
/// (first fill: the first id, later fills: the gap from the end of the
/// previous run to the start of the next).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCustodySignal {
    /// Whether custody was accepted for all covered ids
    pub succeeded: bool,
    /// Shared reason code
    pub reason: CustodySignalReason,
    /// (start id, run length) pairs, ascending and non-overlapping
    pub fills: Vec<AcsFill>,
}

/// One run of consecutive custody ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcsFill {
    /// First custody id of the run
    pub start: u64,
    /// Number of consecutive ids in the run
    pub length: u64,
}

impl AggregateCustodySignal {
    /// Build from a sorted id set, grouping consecutive runs
    pub fn from_ids(succeeded: bool, reason: CustodySignalReason, ids: &BTreeSet<u64>) -> Self {
        let mut fills: Vec<AcsFill> = Vec::new();
        for &id in ids {
            match fills.last_mut() {
                Some(fill) if fill.start + fill.length == id => fill.length += 1,
                _ => fills.push(AcsFill {
                    start: id,
                    length: 1,
                }),
            }
        }
        Self {
            succeeded,
            reason,
            fills,
        }
    }

    /// Expand the fills back to the covered custody ids
    pub fn custody_ids(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        for fill in &self.fills {
            for i in 0..fill.length {
                ids.push(fill.start + i);
            }
        }
        ids
    }

    /// Encode as an admin record payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(admin_type::AGGREGATE_CUSTODY_SIGNAL << 4);
        let mut status = self.reason as u8;
        if self.succeeded {
            status |= 0x80;
        }
        buf.put_u8(status);

        let mut prev_end = 0u64;
        for (i, fill) in self.fills.iter().enumerate() {
            let delta = if i == 0 {
                fill.start
            } else {
                fill.start - prev_end
            };
            sdnv::encode(delta, &mut buf);
            sdnv::encode(fill.length, &mut buf);
            prev_end = fill.start + fill.length - 1;
        }
        buf.freeze()
    }

    /// Decode from an admin record payload
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(data);
        let first = cur.read_u8()?;
        if first >> 4 != admin_type::AGGREGATE_CUSTODY_SIGNAL {
            return Err(CodecError::UnknownAdminType {
                admin_type: first >> 4,
            });
        }
        let status = cur.read_u8()?;
        let succeeded = status & 0x80 != 0;
        let reason = CustodySignalReason::from_u8(status & 0x7f)?;

        let mut fills = Vec::new();
        let mut prev_end = 0u64;
        while cur.remaining() > 0 {
            let delta = cur.read_sdnv()?;
            let length = cur.read_sdnv()?;
            if length == 0 {
                return Err(CodecError::Malformed("zero-length ACS fill"));
            }
            if !fills.is_empty() && delta == 0 {
                return Err(CodecError::Malformed("overlapping ACS fills"));
            }
            let start = if fills.is_empty() {
                delta
            } else {
                prev_end + delta
            };
            prev_end = start + length - 1;
            fills.push(AcsFill { start, length });
        }
        if fills.is_empty() {
            return Err(CodecError::Malformed("ACS with no fills"));
        }

        Ok(Self {
            succeeded,
            reason,
            fills,
        })
    }
}

/// Any administrative record, dispatched on the type nibble
#[derive(Debug, Clone, PartialEq)]
pub enum AdminRecord {
    /// Bundle status report
    StatusReport(StatusReport),
    /// Custody signal
    CustodySignal(CustodySignal),
    /// Aggregate custody signal
    Acs(AggregateCustodySignal),
}

impl AdminRecord {
    /// Encode as an admin bundle payload
    pub fn encode(&self) -> Bytes {
        match self {
            AdminRecord::StatusReport(r) => r.encode(),
            AdminRecord::CustodySignal(s) => s.encode(),
            AdminRecord::Acs(a) => a.encode(),
        }
    }

    /// Decode an admin bundle payload
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let first = *data.first().ok_or(CodecError::Truncated)?;
        match first >> 4 {
            admin_type::STATUS_REPORT => Ok(AdminRecord::StatusReport(StatusReport::decode(data)?)),
            admin_type::CUSTODY_SIGNAL => {
                Ok(AdminRecord::CustodySignal(CustodySignal::decode(data)?))
            }
            admin_type::AGGREGATE_CUSTODY_SIGNAL => {
                Ok(AdminRecord::Acs(AggregateCustodySignal::decode(data)?))
            }
            other => Err(CodecError::UnknownAdminType { admin_type: other }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> EndpointId {
        EndpointId::parse("dtn://node-a/app").unwrap()
    }

    #[test]
    fn test_status_report_round_trip() {
        let mut report = StatusReport::new(
            StatusReason::NoAdditionalInfo,
            CreationTimestamp::new(800_000_000, 7),
            src(),
            None,
        );
        report.received = Some(CreationTimestamp::new(800_000_100, 0));
        report.delivered = Some(CreationTimestamp::new(800_000_200, 0));

        let parsed = StatusReport::decode(&report.encode()).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_status_report_fragment_round_trip() {
        let mut report = StatusReport::new(
            StatusReason::LifetimeExpired,
            CreationTimestamp::new(800_000_000, 7),
            src(),
            Some(FragmentInfo {
                offset: 1000,
                total_length: 5000,
            }),
        );
        report.deleted = Some(CreationTimestamp::new(800_003_600, 0));

        let parsed = StatusReport::decode(&report.encode()).unwrap();
        assert_eq!(parsed, report);
        assert_eq!(parsed.fragment.unwrap().offset, 1000);
    }

    #[test]
    fn test_custody_signal_round_trip() {
        let signal = CustodySignal {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            fragment: None,
            signal_ts: CreationTimestamp::new(800_000_500, 1),
            orig_creation_ts: CreationTimestamp::new(800_000_000, 7),
            orig_source: src(),
        };
        let parsed = CustodySignal::decode(&signal.encode()).unwrap();
        assert_eq!(parsed, signal);
    }

    #[test]
    fn test_custody_signal_failure_round_trip() {
        let signal = CustodySignal {
            succeeded: false,
            reason: CustodySignalReason::NoTimelyContact,
            fragment: None,
            signal_ts: CreationTimestamp::new(800_000_500, 1),
            orig_creation_ts: CreationTimestamp::new(800_000_000, 7),
            orig_source: src(),
        };
        let parsed = CustodySignal::decode(&signal.encode()).unwrap();
        assert!(!parsed.succeeded);
        assert_eq!(parsed.reason, CustodySignalReason::NoTimelyContact);
    }

    #[test]
    fn test_acs_contiguous_ids_single_fill() {
        let ids: BTreeSet<u64> = (100..110).collect();
        let acs = AggregateCustodySignal::from_ids(
            true,
            CustodySignalReason::NoAdditionalInfo,
            &ids,
        );
        assert_eq!(acs.fills.len(), 1);
        assert_eq!(acs.fills[0], AcsFill { start: 100, length: 10 });

        let parsed = AggregateCustodySignal::decode(&acs.encode()).unwrap();
        assert_eq!(parsed, acs);
        assert_eq!(parsed.custody_ids(), (100..110).collect::<Vec<u64>>());
    }

    #[test]
    fn test_acs_gapped_ids() {
        let ids: BTreeSet<u64> = [1, 2, 3, 10, 11, 40].into_iter().collect();
        let acs = AggregateCustodySignal::from_ids(
            true,
            CustodySignalReason::NoAdditionalInfo,
            &ids,
        );
        assert_eq!(acs.fills.len(), 3);

        let parsed = AggregateCustodySignal::decode(&acs.encode()).unwrap();
        assert_eq!(parsed.custody_ids(), vec![1, 2, 3, 10, 11, 40]);
    }

    #[test]
    fn test_acs_rejects_zero_length_fill() {
        // type byte, status, fill (5, 0)
        let data = [admin_type::AGGREGATE_CUSTODY_SIGNAL << 4, 0x80, 0x05, 0x00];
        assert!(matches!(
            AggregateCustodySignal::decode(&data),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_custody_signal_golden_bytes() {
        // type 2 record, success | no-additional-info, ts 5.1, orig 3.2,
        // source "ipn:1.0" (7 bytes)
        let signal = CustodySignal {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            fragment: None,
            signal_ts: CreationTimestamp::new(5, 1),
            orig_creation_ts: CreationTimestamp::new(3, 2),
            orig_source: EndpointId::parse("ipn:1.0").unwrap(),
        };
        let expected = hex::decode("2080050103020769706e3a312e30").unwrap();
        assert_eq!(signal.encode().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_admin_record_dispatch() {
        let signal = CustodySignal {
            succeeded: true,
            reason: CustodySignalReason::NoAdditionalInfo,
            fragment: None,
            signal_ts: CreationTimestamp::new(1, 1),
            orig_creation_ts: CreationTimestamp::new(2, 2),
            orig_source: src(),
        };
        let record = AdminRecord::decode(&AdminRecord::CustodySignal(signal.clone()).encode());
        assert!(matches!(record, Ok(AdminRecord::CustodySignal(s)) if s == signal));

        assert!(matches!(
            AdminRecord::decode(&[0xf0]),
            Err(CodecError::UnknownAdminType { admin_type: 0xf })
        ));
    }
}
