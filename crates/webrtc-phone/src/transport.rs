use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;
use transport_bus::{Bus, BusMessage};

use crate::addressing::PeerId;
use crate::error::TransportError;

pub type Inbound = mpsc::UnboundedReceiver<BusMessage>;

/// Pub/sub surface the phone signals over.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Identifier other phones address this one by.
    fn local_id(&self) -> PeerId;

    /// Subscribe to `channels`; every message on any of them arrives on the
    /// returned stream in per-channel publish order.
    async fn subscribe(&self, channels: &[String]) -> Result<Inbound, TransportError>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;
}

/// [`SignalTransport`] over any [`transport_bus::Bus`].
pub struct BusTransport {
    id: PeerId,
    bus: Arc<dyn Bus>,
}

impl BusTransport {
    pub fn new(id: impl Into<PeerId>, bus: Arc<dyn Bus>) -> Self {
        Self { id: id.into(), bus }
    }
}

#[async_trait]
impl SignalTransport for BusTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Inbound, TransportError> {
        let subscription = self.bus.subscribe(channels)?;
        Ok(subscription.into_inner())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        let delivered = self.bus.publish(channel, payload)?;
        trace!(channel, delivered, "published signaling message");
        Ok(())
    }
}
