//! Peer identity and the addressed channels signaling travels on.
//!
//! Every phone listens on three channels derived from its own identifier and
//! sends to the same three channels derived from the peer's identifier:
//!
//! ```text
//! $webRTC.incomingCall.<peer>
//! $webRTC.callResponse.<peer>
//! $webRTC.peerIceCandidate.<peer>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const EVENT_PREFIX: &str = "$webRTC";
const SEPARATOR: char = '.';

/// Stable identifier of a phone on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier minted by the caller and carried by every message of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventNamespace {
    IncomingCall,
    CallResponse,
    PeerIceCandidate,
}

impl EventNamespace {
    pub const ALL: [EventNamespace; 3] = [
        EventNamespace::IncomingCall,
        EventNamespace::CallResponse,
        EventNamespace::PeerIceCandidate,
    ];

    pub fn event_name(self) -> &'static str {
        match self {
            EventNamespace::IncomingCall => "incomingCall",
            EventNamespace::CallResponse => "callResponse",
            EventNamespace::PeerIceCandidate => "peerIceCandidate",
        }
    }

    /// Full namespace prefix, e.g. `$webRTC.callResponse`.
    pub fn prefix(self) -> String {
        format!("{EVENT_PREFIX}{SEPARATOR}{}", self.event_name())
    }

    pub fn channel_for(self, peer: &PeerId) -> String {
        format!("{}{SEPARATOR}{}", self.prefix(), peer.as_str())
    }
}

/// The three channels a phone subscribes to for messages addressed to it.
pub fn local_channels(local: &PeerId) -> Vec<String> {
    EventNamespace::ALL
        .iter()
        .map(|namespace| namespace.channel_for(local))
        .collect()
}

/// Classify an inbound channel. Returns `None` for channels that are not one
/// of the signaling namespaces or are addressed to someone else.
pub fn route(channel: &str, local: &PeerId) -> Option<EventNamespace> {
    EventNamespace::ALL.into_iter().find(|namespace| {
        channel
            .strip_prefix(namespace.prefix().as_str())
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .is_some_and(|target| target == local.as_str())
    })
}
