//! Aggregate custody signal batching
//!
//! Custody acknowledgements bound for the same upstream custodian, with
//! the same outcome and reason, accumulate into a pending set keyed by
//! (custodian, succeeded, reason). A set is flushed - serialized as one
//! run-length encoded ACS admin bundle - when it reaches the size
//! threshold or when its per-key window elapses. Pending sets survive
//! restarts through the store's pending-ACS table.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::debug;

use waypoint_core::EndpointId;
use waypoint_storage::PendingAcsRecord;

/// ACS tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcsConfig {
    /// Batch acknowledgements instead of sending one signal each
    pub enabled: bool,
    /// Flush a pending set at this many ids
    pub size_threshold: usize,
    /// Flush a pending set this many seconds after its first id
    pub delay_secs: u64,
    /// Accept the legacy dotted CTEB creator form
    pub accept_legacy_cteb: bool,
}

impl Default for AcsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size_threshold: 100,
            delay_secs: 15,
            accept_legacy_cteb: false,
        }
    }
}

/// Pending-set key: upstream custodian plus signal outcome
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcsKey {
    /// Custodian EID string the signal goes to
    pub custodian: String,
    /// Whether the covered transfers succeeded
    pub succeeded: bool,
    /// Shared reason code
    pub reason: u8,
}

/// What [`AcsEngine::add`] decided
#[derive(Debug)]
pub enum AcsDisposition {
    /// Threshold reached: send these ids now
    Flush(BTreeSet<u64>),
    /// First id of a new window; a flush timer was scheduled
    Scheduled,
    /// Added to an existing window
    Accumulated,
}

struct PendingSet {
    ids: BTreeSet<u64>,
    timer: Option<AbortHandle>,
}

/// The pending ACS sets
pub struct AcsEngine {
    config: AcsConfig,
    pending: Mutex<HashMap<AcsKey, PendingSet>>,
}

impl AcsEngine {
    /// Create with the given tuning
    pub fn new(config: AcsConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Tuning in effect
    pub fn config(&self) -> &AcsConfig {
        &self.config
    }

    /// Add a custody id under `key`
    ///
    /// `schedule_timer` is invoked (outside any decision the caller still
    /// has to make) when this id opens a new window; it must arrange an
    /// `AcsExpired` event after the configured delay and return the abort
    /// handle for it.
    pub fn add(
        &self,
        key: AcsKey,
        custody_id: u64,
        schedule_timer: impl FnOnce() -> AbortHandle,
    ) -> AcsDisposition {
        let mut pending = self.pending.lock();
        let entry = pending.entry(key.clone()).or_insert_with(|| PendingSet {
            ids: BTreeSet::new(),
            timer: None,
        });
        entry.ids.insert(custody_id);

        if entry.ids.len() >= self.config.size_threshold {
            let ids = std::mem::take(&mut entry.ids);
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            pending.remove(&key);
            debug!(?key, count = ids.len(), "ACS threshold reached");
            return AcsDisposition::Flush(ids);
        }

        if entry.ids.len() == 1 {
            entry.timer = Some(schedule_timer());
            return AcsDisposition::Scheduled;
        }
        AcsDisposition::Accumulated
    }

    /// Remove and return the pending set for `key` (window elapsed)
    pub fn take(&self, key: &AcsKey) -> Option<BTreeSet<u64>> {
        let mut pending = self.pending.lock();
        let entry = pending.remove(key)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        if entry.ids.is_empty() {
            None
        } else {
            Some(entry.ids)
        }
    }

    /// Reinstate a persisted pending set (no timer; the caller schedules)
    pub fn restore(&self, key: AcsKey, ids: BTreeSet<u64>) {
        if ids.is_empty() {
            return;
        }
        self.pending
            .lock()
            .insert(key, PendingSet { ids, timer: None });
    }

    /// Snapshot a pending set for persistence
    pub fn record_for(&self, key: &AcsKey) -> Option<PendingAcsRecord> {
        let pending = self.pending.lock();
        let entry = pending.get(key)?;
        Some(PendingAcsRecord {
            custodian: key.custodian.clone(),
            succeeded: key.succeeded,
            reason: key.reason,
            ids: entry.ids.iter().copied().collect(),
        })
    }

    /// Keys with pending ids
    pub fn pending_keys(&self) -> Vec<AcsKey> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Total pending ids across all keys
    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(|p| p.ids.len()).sum()
    }
}

/// Whether a CTEB creator string names the bundle's current custodian
///
/// Canonical form is a verbatim match. The legacy dotted `ipn://` form is
/// accepted only when configured.
pub fn cteb_creator_matches(creator: &str, custodian: &EndpointId, accept_legacy: bool) -> bool {
    if creator == custodian.as_str() {
        return true;
    }
    if accept_legacy {
        if let Some(rest) = creator.strip_prefix("ipn://") {
            return custodian.as_str() == format!("ipn:{rest}");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_timer() -> AbortHandle {
        tokio::spawn(async {}).abort_handle()
    }

    fn key() -> AcsKey {
        AcsKey {
            custodian: "ipn:4.0".into(),
            succeeded: true,
            reason: 0,
        }
    }

    #[tokio::test]
    async fn test_first_add_schedules() {
        let engine = AcsEngine::new(AcsConfig::default());
        assert!(matches!(
            engine.add(key(), 1, noop_timer),
            AcsDisposition::Scheduled
        ));
        assert!(matches!(
            engine.add(key(), 2, noop_timer),
            AcsDisposition::Accumulated
        ));
        assert_eq!(engine.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_threshold_flush() {
        let engine = AcsEngine::new(AcsConfig {
            size_threshold: 3,
            ..Default::default()
        });

        engine.add(key(), 1, noop_timer);
        engine.add(key(), 2, noop_timer);
        match engine.add(key(), 3, noop_timer) {
            AcsDisposition::Flush(ids) => {
                assert_eq!(ids.into_iter().collect::<Vec<u64>>(), vec![1, 2, 3]);
            }
            other => panic!("expected flush, got {other:?}"),
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_take_on_window_expiry() {
        let engine = AcsEngine::new(AcsConfig::default());
        engine.add(key(), 10, noop_timer);
        engine.add(key(), 11, noop_timer);

        let ids = engine.take(&key()).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(engine.take(&key()).is_none());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let engine = AcsEngine::new(AcsConfig::default());
        engine.add(key(), 1, noop_timer);

        let failure_key = AcsKey {
            custodian: "ipn:4.0".into(),
            succeeded: false,
            reason: 7,
        };
        engine.add(failure_key.clone(), 2, noop_timer);

        assert_eq!(engine.take(&key()).unwrap().len(), 1);
        assert_eq!(engine.take(&failure_key).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_and_record() {
        let engine = AcsEngine::new(AcsConfig::default());
        engine.restore(key(), [5u64, 6, 7].into_iter().collect());

        let record = engine.record_for(&key()).unwrap();
        assert_eq!(record.ids, vec![5, 6, 7]);
        assert_eq!(record.custodian, "ipn:4.0");
    }

    #[test]
    fn test_cteb_creator_matching() {
        let custodian = EndpointId::parse("ipn:4.0").unwrap();

        assert!(cteb_creator_matches("ipn:4.0", &custodian, false));
        assert!(!cteb_creator_matches("ipn://4.0", &custodian, false));
        assert!(cteb_creator_matches("ipn://4.0", &custodian, true));
        assert!(!cteb_creator_matches("ipn:5.0", &custodian, true));

        let dtn = EndpointId::parse("dtn://relay").unwrap();
        assert!(cteb_creator_matches("dtn://relay", &dtn, false));
        assert!(!cteb_creator_matches("dtn://other", &dtn, true));
    }
}
