//! Local delivery registrations
//!
//! A registration subscribes an application to an endpoint pattern.
//! Matching bundles are handed to the bound application over a channel;
//! when no application is bound, the registration's failure action
//! decides whether the bundle waits, is dropped, or triggers a script.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use waypoint_core::{dtn_time_now, BundleRef, EidPattern, EndpointId};
use waypoint_storage::RegistrationRecord;

/// Registration ids below this are reserved for the daemon itself
pub const FIRST_APP_REGID: u32 = 10;

/// Delivery channel depth per registration
const DELIVERY_QUEUE_DEPTH: usize = 64;

/// What to do when delivery has no bound application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Hold the bundle for later delivery (until expiration)
    Defer,
    /// Drop the bundle
    Drop,
    /// Run a script, then hold the bundle
    Exec,
}

impl FailureAction {
    /// Record encoding
    pub fn as_u8(self) -> u8 {
        match self {
            FailureAction::Defer => 0,
            FailureAction::Drop => 1,
            FailureAction::Exec => 2,
        }
    }

    /// Record decoding (unknown values defer)
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => FailureAction::Drop,
            2 => FailureAction::Exec,
            _ => FailureAction::Defer,
        }
    }
}

/// Outcome of a delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to the bound application
    Delivered,
    /// Kept pending (no app bound, or the app's queue is full)
    Deferred,
    /// Dropped per the failure action
    Dropped,
}

/// One endpoint subscription
pub struct Registration {
    regid: u32,
    pattern: EidPattern,
    failure_action: FailureAction,
    script: Option<String>,
    expiration_secs: u64,
    created_secs: u64,
    active: AtomicBool,
    tx: mpsc::Sender<BundleRef>,
    rx: Mutex<Option<mpsc::Receiver<BundleRef>>>,
}

impl Registration {
    fn new(
        regid: u32,
        pattern: EidPattern,
        failure_action: FailureAction,
        script: Option<String>,
        expiration_secs: u64,
        created_secs: u64,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        Arc::new(Self {
            regid,
            pattern,
            failure_action,
            script,
            expiration_secs,
            created_secs,
            active: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
        })
    }

    /// Registration id
    pub fn regid(&self) -> u32 {
        self.regid
    }

    /// Endpoint pattern this registration matches
    pub fn pattern(&self) -> &EidPattern {
        &self.pattern
    }

    /// Failure action
    pub fn failure_action(&self) -> FailureAction {
        self.failure_action
    }

    /// Whether an application is currently bound
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Bind the application side, taking the delivery receiver
    ///
    /// Returns `None` if already bound.
    pub fn bind(&self) -> Option<mpsc::Receiver<BundleRef>> {
        let rx = self.rx.lock().take()?;
        self.active.store(true, Ordering::SeqCst);
        Some(rx)
    }

    /// Mark the application side unbound (receiver dropped)
    pub fn unbind(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether the registration's lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        self.expiration_secs != 0
            && dtn_time_now().saturating_sub(self.created_secs) >= self.expiration_secs
    }

    /// Attempt delivery to the bound application
    pub fn deliver(&self, bundle: &BundleRef) -> DeliveryOutcome {
        if self.is_active() {
            match self.tx.try_send(bundle.clone()) {
                Ok(()) => return DeliveryOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(regid = self.regid, "registration delivery queue full");
                    return DeliveryOutcome::Deferred;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.unbind();
                }
            }
        }

        match self.failure_action {
            FailureAction::Defer => DeliveryOutcome::Deferred,
            FailureAction::Drop => DeliveryOutcome::Dropped,
            FailureAction::Exec => {
                if let Some(script) = &self.script {
                    debug!(regid = self.regid, script = %script, "running registration failure script");
                    let script = script.clone();
                    tokio::task::spawn_blocking(move || {
                        let _ = std::process::Command::new(&script).status();
                    });
                }
                DeliveryOutcome::Deferred
            }
        }
    }

    /// The durable record form of this registration
    pub fn to_record(&self) -> RegistrationRecord {
        RegistrationRecord {
            regid: self.regid,
            pattern: self.pattern.as_str().to_string(),
            failure_action: self.failure_action.as_u8(),
            script: self.script.clone(),
            expiration_secs: self.expiration_secs,
            created_secs: self.created_secs,
        }
    }
}

/// The table of local registrations
pub struct RegistrationTable {
    by_id: DashMap<u32, Arc<Registration>>,
    next_regid: AtomicU32,
}

impl RegistrationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            next_regid: AtomicU32::new(FIRST_APP_REGID),
        }
    }

    /// Add a registration, allocating its id
    pub fn add(
        &self,
        pattern: EidPattern,
        failure_action: FailureAction,
        script: Option<String>,
        expiration_secs: u64,
    ) -> Arc<Registration> {
        let regid = self.next_regid.fetch_add(1, Ordering::SeqCst);
        let reg = Registration::new(
            regid,
            pattern,
            failure_action,
            script,
            expiration_secs,
            dtn_time_now(),
        );
        self.by_id.insert(regid, reg.clone());
        reg
    }

    /// Reinstate a reloaded registration under its persisted id
    pub fn restore(&self, record: &RegistrationRecord) -> Option<Arc<Registration>> {
        let pattern = EidPattern::parse(&record.pattern).ok()?;
        let reg = Registration::new(
            record.regid,
            pattern,
            FailureAction::from_u8(record.failure_action),
            record.script.clone(),
            record.expiration_secs,
            record.created_secs,
        );
        self.by_id.insert(record.regid, reg.clone());
        self.next_regid
            .fetch_max(record.regid + 1, Ordering::SeqCst);
        Some(reg)
    }

    /// Remove a registration
    pub fn remove(&self, regid: u32) -> Option<Arc<Registration>> {
        self.by_id.remove(&regid).map(|(_, reg)| reg)
    }

    /// Look up by id
    pub fn get(&self, regid: u32) -> Option<Arc<Registration>> {
        self.by_id.get(&regid).map(|r| r.clone())
    }

    /// Every registration whose pattern matches `eid`
    pub fn matching(&self, eid: &EndpointId) -> Vec<Arc<Registration>> {
        self.by_id
            .iter()
            .filter(|r| r.pattern().matches(eid))
            .map(|r| r.clone())
            .collect()
    }

    /// Collect (without removing) the expired registrations
    pub fn expired(&self) -> Vec<u32> {
        self.by_id
            .iter()
            .filter(|r| r.is_expired())
            .map(|r| r.regid())
            .collect()
    }

    /// Number of registrations
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for RegistrationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::{Bundle, CreationTimestamp, GbofId, Payload};

    fn make_bundle(dest: &str) -> BundleRef {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, 1),
        );
        Arc::new(Bundle::new(
            1,
            gbof,
            EndpointId::parse(dest).unwrap(),
            Payload::memory(&b"data"[..]),
            60,
        ))
    }

    fn pattern(s: &str) -> EidPattern {
        EidPattern::parse(s).unwrap()
    }

    #[test]
    fn test_add_and_match() {
        let table = RegistrationTable::new();
        let reg = table.add(pattern("dtn://node-b/app"), FailureAction::Defer, None, 0);
        assert!(reg.regid() >= FIRST_APP_REGID);

        let hits = table.matching(&EndpointId::parse("dtn://node-b/app").unwrap());
        assert_eq!(hits.len(), 1);

        let misses = table.matching(&EndpointId::parse("dtn://node-b/other").unwrap());
        assert!(misses.is_empty());
    }

    #[test]
    fn test_wildcard_match() {
        let table = RegistrationTable::new();
        table.add(pattern("dtn://node-b/*"), FailureAction::Defer, None, 0);

        assert_eq!(
            table
                .matching(&EndpointId::parse("dtn://node-b/anything").unwrap())
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_deliver_to_bound_app() {
        let table = RegistrationTable::new();
        let reg = table.add(pattern("dtn://node-b/app"), FailureAction::Defer, None, 0);

        let mut rx = reg.bind().unwrap();
        assert!(reg.bind().is_none()); // single binding

        let bundle = make_bundle("dtn://node-b/app");
        assert_eq!(reg.deliver(&bundle), DeliveryOutcome::Delivered);
        assert_eq!(rx.recv().await.unwrap().id(), bundle.id());
    }

    #[test]
    fn test_failure_actions() {
        let table = RegistrationTable::new();
        let defer = table.add(pattern("dtn://node-b/a"), FailureAction::Defer, None, 0);
        let drop = table.add(pattern("dtn://node-b/b"), FailureAction::Drop, None, 0);

        let bundle = make_bundle("dtn://node-b/a");
        assert_eq!(defer.deliver(&bundle), DeliveryOutcome::Deferred);
        assert_eq!(drop.deliver(&bundle), DeliveryOutcome::Dropped);
    }

    #[test]
    fn test_restore_preserves_regid_allocation() {
        let table = RegistrationTable::new();
        let record = RegistrationRecord {
            regid: 55,
            pattern: "dtn://node-b/app".into(),
            failure_action: 0,
            script: None,
            expiration_secs: 0,
            created_secs: dtn_time_now(),
        };
        table.restore(&record).unwrap();
        assert!(table.get(55).is_some());

        // New allocations continue past the restored id
        let reg = table.add(pattern("dtn://node-b/x"), FailureAction::Defer, None, 0);
        assert!(reg.regid() > 55);
    }

    #[test]
    fn test_expiration() {
        let table = RegistrationTable::new();
        let reg = Registration::new(
            99,
            pattern("dtn://node-b/app"),
            FailureAction::Defer,
            None,
            10,
            dtn_time_now() - 60,
        );
        table.by_id.insert(99, reg);
        assert_eq!(table.expired(), vec![99]);
    }
}
