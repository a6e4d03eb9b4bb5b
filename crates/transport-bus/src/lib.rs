use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid channel name: {0:?}")]
    InvalidChannel(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Pub/sub surface used for signaling.
///
/// A subscription covers any number of channels and yields their messages on
/// a single stream. Messages published to one channel reach each subscriber
/// in publish order.
pub trait Bus: Send + Sync {
    fn subscribe(&self, channels: &[String]) -> BusResult<Subscription>;
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize>;
}

/// Receiving half of a bus subscription.
#[derive(Debug)]
pub struct Subscription {
    channels: Vec<String>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }

    pub fn into_inner(self) -> mpsc::UnboundedReceiver<BusMessage> {
        self.rx
    }
}

/// In-memory bus shared by every client in the process.
#[derive(Debug, Default)]
pub struct LocalBus {
    channels: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .get(channel)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

fn validate_channel(channel: &str) -> BusResult<()> {
    if channel.trim().is_empty() {
        return Err(BusError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

impl Bus for LocalBus {
    fn subscribe(&self, channels: &[String]) -> BusResult<Subscription> {
        for channel in channels {
            validate_channel(channel)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.channels.write();
        for channel in channels {
            guard.entry(channel.clone()).or_default().push(tx.clone());
        }
        Ok(Subscription {
            channels: channels.to_vec(),
            rx,
        })
    }

    /// Returns the number of subscribers the message was delivered to.
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<usize> {
        validate_channel(channel)?;
        let mut guard = self.channels.write();
        let Some(senders) = guard.get_mut(channel) else {
            return Ok(0);
        };
        let message = BusMessage {
            channel: channel.to_string(),
            payload,
        };
        senders.retain(|tx| tx.send(message.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            guard.remove(channel);
        }
        Ok(delivered)
    }
}
