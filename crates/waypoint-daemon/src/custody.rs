//! Custody timers
//!
//! One timer per (bundle, upstream link) pair, armed when a bundle we
//! hold custody of is transmitted. A timer fires exactly once, posting
//! `CustodyTimeout`; re-arming is an explicit decision of the timeout
//! handler, with a linear per-retry backoff up to a cap.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::bus::EventBus;
use crate::event::BundleEvent;

/// Custody timer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodyTimerParams {
    /// First deadline, seconds after transmission
    pub base_secs: u64,
    /// Added per elapsed retry
    pub per_retry_secs: u64,
    /// Deadline ceiling
    pub max_secs: u64,
    /// Stop re-arming after this many retries (custody is kept regardless)
    pub max_retries: u32,
    /// Send a no-timely-contact failure signal upstream when retries are
    /// exhausted
    pub signal_no_timely_contact: bool,
}

impl Default for CustodyTimerParams {
    fn default() -> Self {
        Self {
            base_secs: 30,
            per_retry_secs: 15,
            max_secs: 300,
            max_retries: 5,
            signal_no_timely_contact: false,
        }
    }
}

impl CustodyTimerParams {
    /// The deadline for the given retry count
    pub fn delay_for(&self, retries: u32) -> Duration {
        let secs = self
            .base_secs
            .saturating_add(self.per_retry_secs.saturating_mul(retries as u64))
            .min(self.max_secs);
        Duration::from_secs(secs)
    }
}

/// The set of armed custody timers
pub struct CustodyTimers {
    params: CustodyTimerParams,
    timers: DashMap<(u64, String), AbortHandle>,
}

impl CustodyTimers {
    /// Create with the given tuning
    pub fn new(params: CustodyTimerParams) -> Self {
        Self {
            params,
            timers: DashMap::new(),
        }
    }

    /// Timer tuning
    pub fn params(&self) -> &CustodyTimerParams {
        &self.params
    }

    /// Arm (or re-arm) the timer for a (bundle, link) pair
    pub fn start(&self, bus: EventBus, bundle_id: u64, link: &str, retries: u32) {
        let key = (bundle_id, link.to_string());
        let delay = self.params.delay_for(retries);
        debug!(bundle_id, link, retries, ?delay, "arming custody timer");

        let link_name = link.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = bus
                .post(BundleEvent::CustodyTimeout {
                    bundle_id,
                    link: link_name,
                    retries,
                })
                .await;
        })
        .abort_handle();

        if let Some(old) = self.timers.insert(key, handle) {
            old.abort();
        }
    }

    /// Cancel the timer for a (bundle, link) pair; true if one was armed
    pub fn cancel(&self, bundle_id: u64, link: &str) -> bool {
        match self.timers.remove(&(bundle_id, link.to_string())) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer for a bundle (custody released)
    pub fn cancel_all_for(&self, bundle_id: u64) -> usize {
        let keys: Vec<(u64, String)> = self
            .timers
            .iter()
            .filter(|e| e.key().0 == bundle_id)
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            if let Some((_, handle)) = self.timers.remove(key) {
                handle.abort();
            }
        }
        keys.len()
    }

    /// Forget a timer that has fired (the handler owns re-arming)
    pub fn finished(&self, bundle_id: u64, link: &str) {
        self.timers.remove(&(bundle_id, link.to_string()));
    }

    /// Whether a timer is armed for the pair
    pub fn is_armed(&self, bundle_id: u64, link: &str) -> bool {
        self.timers.contains_key(&(bundle_id, link.to_string()))
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are armed
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    #[test]
    fn test_delay_backoff_linear_and_capped() {
        let params = CustodyTimerParams {
            base_secs: 30,
            per_retry_secs: 15,
            max_secs: 70,
            ..Default::default()
        };
        assert_eq!(params.delay_for(0), Duration::from_secs(30));
        assert_eq!(params.delay_for(1), Duration::from_secs(45));
        assert_eq!(params.delay_for(2), Duration::from_secs(60));
        assert_eq!(params.delay_for(3), Duration::from_secs(70)); // capped
        assert_eq!(params.delay_for(10), Duration::from_secs(70));
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let (bus, mut queues) = EventBus::new(16);
        let params = CustodyTimerParams {
            base_secs: 0,
            ..Default::default()
        };
        let timers = CustodyTimers::new(params);

        timers.start(bus, 7, "uplink", 2);
        let envelope = queues.main.next().await.unwrap();
        match envelope.event {
            BundleEvent::CustodyTimeout {
                bundle_id,
                link,
                retries,
            } => {
                assert_eq!(bundle_id, 7);
                assert_eq!(link, "uplink");
                assert_eq!(retries, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // No second firing without explicit re-arm
        let again = queues
            .main
            .next_timeout(Duration::from_millis(50))
            .await;
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let (bus, mut queues) = EventBus::new(16);
        let timers = CustodyTimers::new(CustodyTimerParams {
            base_secs: 1,
            ..Default::default()
        });

        timers.start(bus, 7, "uplink", 0);
        assert!(timers.is_armed(7, "uplink"));
        assert!(timers.cancel(7, "uplink"));
        assert!(!timers.is_armed(7, "uplink"));

        let fired = queues
            .main
            .next_timeout(Duration::from_millis(100))
            .await;
        assert!(fired.is_none());
    }

    #[tokio::test]
    async fn test_cancel_all_for_bundle() {
        let (bus, _queues) = EventBus::new(16);
        let timers = CustodyTimers::new(CustodyTimerParams {
            base_secs: 60,
            ..Default::default()
        });

        timers.start(bus.clone(), 7, "link-a", 0);
        timers.start(bus.clone(), 7, "link-b", 0);
        timers.start(bus, 8, "link-a", 0);

        assert_eq!(timers.cancel_all_for(7), 2);
        assert_eq!(timers.len(), 1);
        assert!(timers.is_armed(8, "link-a"));
    }
}
