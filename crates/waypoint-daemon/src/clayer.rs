//! The convergence-layer seam
//!
//! Convergence layers map bundles onto an underlying transport. The
//! daemon only ever talks to this trait; adapters never mutate links or
//! bundles - they post events. Session establishment is asynchronous:
//! `open_contact` starts it, and the adapter posts `ContactUp` or a
//! `LinkStateChangeRequest` back to unavailable with a reason.
//!
//! [`LoopbackConvergenceLayer`] is the in-process implementation used by
//! tests and single-node setups: wire bytes go to a sink channel and
//! transmissions complete immediately.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use waypoint_core::BundleRef;

use crate::bus::EventBus;
use crate::event::BundleEvent;
use crate::link::LinkRef;

/// Convergence-layer failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClError {
    /// Could not establish a session
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A send did not complete
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// A convergence-layer adapter
#[async_trait]
pub trait ConvergenceLayer: Send + Sync {
    /// Adapter name links refer to (`tcp`, `udp`, `loopback`, ...)
    fn name(&self) -> &str;

    /// Begin establishing a session for the link
    ///
    /// Completion is reported by posting `ContactUp`, failure by posting
    /// a state-change request back to unavailable.
    async fn open_contact(&self, link: &LinkRef) -> Result<(), ClError>;

    /// Tear down the link's session
    async fn close_contact(&self, link: &LinkRef);

    /// Transmit one serialized bundle
    ///
    /// The adapter posts `BundleTransmitted` when transmission completes
    /// (possibly partially, for reliable adapters that learn how much was
    /// acknowledged).
    async fn send(&self, link: &LinkRef, bundle: &BundleRef, wire: Bytes) -> Result<(), ClError>;

    /// Try to cancel an in-flight transmission; true if cancelled
    async fn cancel(&self, _link: &LinkRef, _bundle: &BundleRef) -> bool {
        false
    }
}

/// Wire bytes captured by the loopback adapter
pub type WireSink = mpsc::UnboundedSender<(String, Bytes)>;

/// In-process convergence layer
///
/// Sessions open instantly and every send succeeds, forwarding the wire
/// bytes to the configured sink and posting completion events on the bus.
pub struct LoopbackConvergenceLayer {
    bus: EventBus,
    sink: WireSink,
}

impl LoopbackConvergenceLayer {
    /// Create an adapter posting to `bus` and writing wire bytes to `sink`
    pub fn new(bus: EventBus, sink: WireSink) -> Self {
        Self { bus, sink }
    }
}

#[async_trait]
impl ConvergenceLayer for LoopbackConvergenceLayer {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn open_contact(&self, link: &LinkRef) -> Result<(), ClError> {
        debug!(link = link.name(), "loopback contact open");
        self.bus
            .post(BundleEvent::ContactUp {
                link: link.name().to_string(),
            })
            .await
            .map_err(|e| ClError::ConnectionFailed(e.to_string()))
    }

    async fn close_contact(&self, link: &LinkRef) {
        debug!(link = link.name(), "loopback contact close");
    }

    async fn send(&self, link: &LinkRef, bundle: &BundleRef, wire: Bytes) -> Result<(), ClError> {
        let bytes_sent = bundle.payload_len();
        self.sink
            .send((link.name().to_string(), wire))
            .map_err(|_| ClError::SendFailed("wire sink closed".into()))?;

        self.bus
            .post(BundleEvent::BundleTransmitted {
                bundle: bundle.clone(),
                link: link.name().to_string(),
                bytes_sent,
                reliably: link.params().reliable,
            })
            .await
            .map_err(|e| ClError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::link::{Link, LinkParams, LinkType};
    use std::sync::Arc;
    use waypoint_core::{Bundle, CreationTimestamp, EndpointId, GbofId, Payload};

    fn make_bundle() -> BundleRef {
        let gbof = GbofId::new(
            EndpointId::parse("dtn://node-a/app").unwrap(),
            CreationTimestamp::new(812_000_000, 1),
        );
        Arc::new(Bundle::new(
            1,
            gbof,
            EndpointId::parse("dtn://node-b/sink").unwrap(),
            Payload::memory(&b"wire me"[..]),
            60,
        ))
    }

    #[tokio::test]
    async fn test_loopback_send_posts_transmitted() {
        let (bus, mut queues) = EventBus::new(16);
        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel();
        let cl = LoopbackConvergenceLayer::new(bus, sink_tx);

        let link =
            Link::create("lo", LinkType::AlwaysOn, "local", "loopback", LinkParams::default())
                .unwrap();
        let bundle = make_bundle();

        cl.send(&link, &bundle, Bytes::from_static(b"wire bytes"))
            .await
            .unwrap();

        let (link_name, wire) = sink_rx.recv().await.unwrap();
        assert_eq!(link_name, "lo");
        assert_eq!(wire, Bytes::from_static(b"wire bytes"));

        let envelope = queues.main.next().await.unwrap();
        match envelope.event {
            BundleEvent::BundleTransmitted {
                bytes_sent, link, ..
            } => {
                assert_eq!(bytes_sent, 7);
                assert_eq!(link, "lo");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_loopback_open_posts_contact_up() {
        let (bus, mut queues) = EventBus::new(16);
        let (sink_tx, _sink_rx) = mpsc::unbounded_channel();
        let cl = LoopbackConvergenceLayer::new(bus, sink_tx);

        let link =
            Link::create("lo", LinkType::OnDemand, "local", "loopback", LinkParams::default())
                .unwrap();
        cl.open_contact(&link).await.unwrap();

        let envelope = queues.main.next().await.unwrap();
        assert_eq!(envelope.event.type_str(), "contact_up");
    }
}
