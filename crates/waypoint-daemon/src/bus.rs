//! The event bus
//!
//! Five bounded multi-producer/single-consumer queues, one per processor.
//! Each processor task owns its [`EventQueue`] and handles exactly one
//! event at a time. `post_and_wait` pairs the post with a oneshot the
//! producer blocks on until the handler finishes; `post_at_head` lets the
//! main processor preempt its own queued work (expiration ahead of
//! forwarding).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::warn;

use crate::error::{DaemonError, DaemonResult};
use crate::event::{BundleEvent, Processor};

/// An event plus its optional completion notifier
#[derive(Debug)]
pub struct EventEnvelope {
    /// The event
    pub event: BundleEvent,
    /// Signalled after the handler finishes (post_and_wait)
    pub done: Option<oneshot::Sender<()>>,
}

impl EventEnvelope {
    /// Signal the waiting producer, if any
    pub fn complete(done: Option<oneshot::Sender<()>>) {
        if let Some(tx) = done {
            let _ = tx.send(());
        }
    }
}

impl From<BundleEvent> for EventEnvelope {
    fn from(event: BundleEvent) -> Self {
        Self { event, done: None }
    }
}

struct HeadQueue {
    deque: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
}

/// Posting half of the bus; clone freely
#[derive(Clone)]
pub struct EventBus {
    main_tx: mpsc::Sender<EventEnvelope>,
    input_tx: mpsc::Sender<EventEnvelope>,
    output_tx: mpsc::Sender<EventEnvelope>,
    storage_tx: mpsc::Sender<EventEnvelope>,
    acs_tx: mpsc::Sender<EventEnvelope>,
    main_head: Arc<HeadQueue>,
    last_activity: Arc<Mutex<Instant>>,
}

/// The five consuming queues, handed to the processor tasks
pub struct ProcessorQueues {
    /// Main processor queue (with the at-head slot)
    pub main: EventQueue,
    /// Input processor queue
    pub input: EventQueue,
    /// Output processor queue
    pub output: EventQueue,
    /// Storage processor queue
    pub storage: EventQueue,
    /// ACS processor queue
    pub acs: EventQueue,
}

impl EventBus {
    /// Create the bus and its processor queues
    pub fn new(capacity: usize) -> (Self, ProcessorQueues) {
        let capacity = capacity.max(16);
        let (main_tx, main_rx) = mpsc::channel(capacity);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (output_tx, output_rx) = mpsc::channel(capacity);
        let (storage_tx, storage_rx) = mpsc::channel(capacity);
        let (acs_tx, acs_rx) = mpsc::channel(capacity);

        let main_head = Arc::new(HeadQueue {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });

        let bus = Self {
            main_tx,
            input_tx,
            output_tx,
            storage_tx,
            acs_tx,
            main_head: main_head.clone(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        };

        let queues = ProcessorQueues {
            main: EventQueue {
                rx: main_rx,
                head: Some(main_head),
            },
            input: EventQueue {
                rx: input_rx,
                head: None,
            },
            output: EventQueue {
                rx: output_rx,
                head: None,
            },
            storage: EventQueue {
                rx: storage_rx,
                head: None,
            },
            acs: EventQueue {
                rx: acs_rx,
                head: None,
            },
        };

        (bus, queues)
    }

    fn sender_for(&self, processor: Processor) -> &mpsc::Sender<EventEnvelope> {
        match processor {
            Processor::Main => &self.main_tx,
            Processor::Input => &self.input_tx,
            Processor::Output => &self.output_tx,
            Processor::Storage => &self.storage_tx,
            Processor::Acs => &self.acs_tx,
        }
    }

    /// Post an event to its processor's queue
    pub async fn post(&self, event: BundleEvent) -> DaemonResult<()> {
        let processor = event.processor();
        self.sender_for(processor)
            .send(event.into())
            .await
            .map_err(|e| {
                warn!(event = e.0.event.type_str(), "event bus closed, dropping event");
                DaemonError::BusClosed
            })
    }

    /// Post and block until the handler finishes
    ///
    /// Must not be called from a processor task handling events for the
    /// same queue - that deadlocks by construction.
    pub async fn post_and_wait(&self, event: BundleEvent) -> DaemonResult<()> {
        let processor = event.processor();
        let (tx, rx) = oneshot::channel();
        let envelope = EventEnvelope {
            event,
            done: Some(tx),
        };
        self.sender_for(processor)
            .send(envelope)
            .await
            .map_err(|_| DaemonError::BusClosed)?;
        rx.await.map_err(|_| DaemonError::BusClosed)
    }

    /// Insert an event at the front of the main processor's queue
    ///
    /// Used sparingly, by the daemon itself, to preempt queued work.
    pub fn post_at_head(&self, event: BundleEvent) {
        debug_assert_eq!(event.processor(), Processor::Main);
        self.main_head.deque.lock().push_back(event.into());
        self.main_head.notify.notify_one();
    }

    /// Record event-processing activity (idle-shutdown tracking)
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Seconds since the last handled event
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// The consuming half of one processor's queue
pub struct EventQueue {
    rx: mpsc::Receiver<EventEnvelope>,
    head: Option<Arc<HeadQueue>>,
}

impl EventQueue {
    /// Next event; at-head events win over the channel
    ///
    /// Returns `None` when every bus handle is dropped.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        loop {
            if let Some(head) = &self.head {
                if let Some(envelope) = head.deque.lock().pop_front() {
                    return Some(envelope);
                }
                tokio::select! {
                    _ = head.notify.notified() => continue,
                    envelope = self.rx.recv() => return envelope,
                }
            } else {
                return self.rx.recv().await;
            }
        }
    }

    /// Like [`next`](Self::next) with a timeout; `None` on timeout
    pub async fn next_timeout(&mut self, timeout: Duration) -> Option<EventEnvelope> {
        tokio::time::timeout(timeout, self.next()).await.ok()?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventSource;
    use std::sync::Arc as StdArc;
    use waypoint_core::{Bundle, CreationTimestamp, EndpointId, GbofId, Payload};

    fn make_event() -> BundleEvent {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, 1),
        );
        BundleEvent::BundleReceived {
            bundle: StdArc::new(Bundle::new(
                1,
                gbof,
                EndpointId::parse("dtn://node-b/sink").unwrap(),
                Payload::empty(),
                60,
            )),
            source: EventSource::Peer,
            link: None,
        }
    }

    #[tokio::test]
    async fn test_post_routes_to_processor() {
        let (bus, mut queues) = EventBus::new(16);

        bus.post(make_event()).await.unwrap();
        bus.post(BundleEvent::ShutdownRequest).await.unwrap();

        let input_ev = queues.input.next().await.unwrap();
        assert_eq!(input_ev.event.type_str(), "bundle_received");

        let main_ev = queues.main.next().await.unwrap();
        assert_eq!(main_ev.event.type_str(), "shutdown_request");
    }

    #[tokio::test]
    async fn test_post_at_head_preempts() {
        let (bus, mut queues) = EventBus::new(16);

        bus.post(BundleEvent::RouteRecompute).await.unwrap();
        bus.post_at_head(BundleEvent::ShutdownRequest);

        // The at-head event comes out first even though it was posted second
        let first = queues.main.next().await.unwrap();
        assert_eq!(first.event.type_str(), "shutdown_request");
        let second = queues.main.next().await.unwrap();
        assert_eq!(second.event.type_str(), "route_recompute");
    }

    #[tokio::test]
    async fn test_post_and_wait_blocks_until_complete() {
        let (bus, mut queues) = EventBus::new(16);

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.post_and_wait(BundleEvent::RouteRecompute).await })
        };

        let envelope = queues.main.next().await.unwrap();
        assert!(envelope.done.is_some());

        // Not completed yet; the waiter should still be pending
        assert!(!waiter.is_finished());

        EventEnvelope::complete(envelope.done);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_next_timeout() {
        let (_bus, mut queues) = EventBus::new(16);
        let got = queues.main.next_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let (bus, _queues) = EventBus::new(16);
        bus.touch();
        assert!(bus.idle() < Duration::from_secs(1));
    }
}
