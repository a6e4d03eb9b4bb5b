//! Boundary to the peer media connection.
//!
//! The negotiation core only ever talks to [`MediaConnection`] and
//! [`ConnectionFactory`]; [`crate::rtc`] provides the implementation backed by
//! the `webrtc` crate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::RtcConfig;
use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in its browser JSON form: `{"type": "...", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in its browser JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    /// Candidate type token following `typ`, e.g. `host`, `srflx`, `relay`.
    pub fn candidate_type(&self) -> Option<&str> {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return tokens.next();
            }
        }
        None
    }

    /// Whether the candidate is routed through a TURN relay.
    pub fn is_relay(&self) -> bool {
        self.candidate_type() == Some("relay")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Options applied when building an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOptions {
    pub offer_to_receive_audio: bool,
    pub offer_to_receive_video: bool,
    pub ice_restart: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            offer_to_receive_audio: true,
            offer_to_receive_video: true,
            ice_restart: false,
        }
    }
}

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Local audio/video the phone sends to the peer.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: LocalTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.id()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A remote track that became available on the connection.
#[derive(Clone)]
pub struct PeerTrack {
    pub track_id: String,
    pub stream_id: String,
    pub kind: String,
    pub remote: Option<Arc<TrackRemote>>,
}

impl PeerTrack {
    pub fn new(
        track_id: impl Into<String>,
        stream_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            track_id: track_id.into(),
            stream_id: stream_id.into(),
            kind: kind.into(),
            remote: None,
        }
    }
}

impl fmt::Debug for PeerTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// Events a connection reports back to the phone, in the order they occur.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    ConnectivityChanged(IceConnectionState),
    NegotiationNeeded,
    RemoteTrack(PeerTrack),
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), MediaError>;
    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;
    async fn close(&self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Build a new connection. Every event the connection produces is sent on
    /// `events` until the connection is closed.
    async fn connect(
        &self,
        config: &RtcConfig,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, MediaError>;
}
