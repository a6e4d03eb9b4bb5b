//! One-to-one WebRTC call signaling over a publish/subscribe bus.
//!
//! A [`WebRtcPhone`] places and answers calls by exchanging offers, answers
//! and trickled ICE candidates on channels addressed by peer id. Media itself
//! flows over the peer connection produced by a [`ConnectionFactory`].

pub mod addressing;
pub mod candidate_cache;
pub mod config;
pub mod error;
pub mod media;
pub mod messages;
pub mod phone;
pub mod rtc;
pub mod session;
pub mod transport;

pub use addressing::{CallId, EventNamespace, PeerId};
pub use config::{IceServer, IceTransportPolicy, PhoneConfig, PhoneSettings, RtcConfig};
pub use error::{ConfigError, MediaError, PhoneError, TransportError};
pub use media::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, IceCandidate, IceConnectionState,
    MediaConnection, MediaStream, OfferOptions, PeerTrack, SessionDescription,
};
pub use phone::{CallAnswer, CallOptions, CallResponder, WebRtcPhone};
pub use rtc::RtcConnectionFactory;
pub use session::{CallDirection, CallSnapshot, NegotiationState};
pub use transport::{BusTransport, SignalTransport};
