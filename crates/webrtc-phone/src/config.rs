use std::env;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, warn};

use crate::addressing::PeerId;
use crate::error::ConfigError;
use crate::media::{ConnectionFactory, MediaStream, PeerTrack};
use crate::phone::{CallAnswer, CallResponder};
use crate::transport::SignalTransport;

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const ICE_URL_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    All,
    Relay,
}

/// STUN or TURN server entry, in the browser `RTCIceServer` JSON form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Connection configuration. Travels inside invites so the callee builds its
/// connection with the caller's servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_transport_policy: Option<IceTransportPolicy>,
}

impl RtcConfig {
    /// Public STUN only.
    pub fn with_default_stun() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            ice_transport_policy: None,
        }
    }

    /// No ICE servers at all; host candidates only.
    pub fn localhost() -> Self {
        Self::default()
    }

    pub fn builder() -> RtcConfigBuilder {
        RtcConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct RtcConfigBuilder {
    ice_servers: Vec<IceServer>,
    relay_only: bool,
}

impl RtcConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: Some(username),
            credential: Some(credential),
        });
        self
    }

    pub fn relay_only(mut self, relay_only: bool) -> Self {
        self.relay_only = relay_only;
        self
    }

    pub fn build(self) -> Result<RtcConfig, ConfigError> {
        for url in self.ice_servers.iter().flat_map(|server| &server.urls) {
            if !ICE_URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(ConfigError::InvalidIceServer(url.clone()));
            }
        }
        Ok(RtcConfig {
            ice_servers: self.ice_servers,
            ice_transport_policy: self.relay_only.then_some(IceTransportPolicy::Relay),
        })
    }
}

/// Environment-driven defaults for a phone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneSettings {
    pub rtc_config: RtcConfig,
    pub ignore_non_turn: bool,
}

impl PhoneSettings {
    /// Load settings from `PHONE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| {
            lookup(key)
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let ignore_non_turn = flag("PHONE_IGNORE_NON_TURN");

        if flag("PHONE_LOCALHOST_ONLY") {
            return Ok(Self {
                rtc_config: RtcConfig::localhost(),
                ignore_non_turn,
            });
        }

        let urls: Vec<String> = lookup("PHONE_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if urls.is_empty() {
            return Ok(Self {
                rtc_config: RtcConfig::with_default_stun(),
                ignore_non_turn,
            });
        }

        let (turn, plain): (Vec<String>, Vec<String>) =
            urls.into_iter().partition(|url| url.starts_with("turn"));
        let mut builder = RtcConfig::builder();
        if !plain.is_empty() {
            builder = builder.add_ice_server(plain);
        }
        if !turn.is_empty() {
            builder = match (
                lookup("PHONE_TURN_USERNAME"),
                lookup("PHONE_TURN_CREDENTIAL"),
            ) {
                (Some(username), Some(credential)) => {
                    builder.add_ice_server_with_credentials(turn, username, credential)
                }
                _ => builder.add_ice_server(turn),
            };
        }
        Ok(Self {
            rtc_config: builder.build()?,
            ignore_non_turn,
        })
    }
}

impl Default for PhoneSettings {
    fn default() -> Self {
        Self {
            rtc_config: RtcConfig::with_default_stun(),
            ignore_non_turn: false,
        }
    }
}

pub type IncomingCallHandler = Arc<dyn Fn(PeerId, CallResponder) + Send + Sync>;
pub type CallResponseHandler = Arc<dyn Fn(bool) + Send + Sync>;
pub type PeerStreamHandler = Arc<dyn Fn(PeerTrack) + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingField {
    Transport,
    OnIncomingCall,
    OnCallResponse,
    OnPeerStream,
    OnDisconnect,
}

impl MissingField {
    pub fn as_str(self) -> &'static str {
        match self {
            MissingField::Transport => "transport",
            MissingField::OnIncomingCall => "on_incoming_call",
            MissingField::OnCallResponse => "on_call_response",
            MissingField::OnPeerStream => "on_peer_stream",
            MissingField::OnDisconnect => "on_disconnect",
        }
    }
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a [`crate::WebRtcPhone`] needs at construction.
#[derive(Clone, Default)]
pub struct PhoneConfig {
    pub transport: Option<Arc<dyn SignalTransport>>,
    pub connections: Option<Arc<dyn ConnectionFactory>>,
    pub on_incoming_call: Option<IncomingCallHandler>,
    pub on_call_response: Option<CallResponseHandler>,
    pub on_peer_stream: Option<PeerStreamHandler>,
    pub on_disconnect: Option<DisconnectHandler>,
    pub my_stream: Option<MediaStream>,
    pub rtc_config: RtcConfig,
    pub ignore_non_turn: bool,
    /// Refuse to build when a handler is missing instead of installing a
    /// logging fallback.
    pub strict: bool,
}

impl PhoneConfig {
    pub fn new(transport: Arc<dyn SignalTransport>) -> Self {
        Self {
            transport: Some(transport),
            ..Default::default()
        }
    }

    pub fn connections(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.connections = Some(factory);
        self
    }

    pub fn on_incoming_call<F>(mut self, handler: F) -> Self
    where
        F: Fn(PeerId, CallResponder) + Send + Sync + 'static,
    {
        self.on_incoming_call = Some(Arc::new(handler));
        self
    }

    pub fn on_call_response<F>(mut self, handler: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_call_response = Some(Arc::new(handler));
        self
    }

    pub fn on_peer_stream<F>(mut self, handler: F) -> Self
    where
        F: Fn(PeerTrack) + Send + Sync + 'static,
    {
        self.on_peer_stream = Some(Arc::new(handler));
        self
    }

    pub fn on_disconnect<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(handler));
        self
    }

    pub fn my_stream(mut self, stream: MediaStream) -> Self {
        self.my_stream = Some(stream);
        self
    }

    pub fn rtc_config(mut self, config: RtcConfig) -> Self {
        self.rtc_config = config;
        self
    }

    pub fn ignore_non_turn(mut self, ignore: bool) -> Self {
        self.ignore_non_turn = ignore;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_settings(mut self, settings: PhoneSettings) -> Self {
        self.rtc_config = settings.rtc_config;
        self.ignore_non_turn = settings.ignore_non_turn;
        self
    }

    pub fn missing_fields(&self) -> Vec<MissingField> {
        let mut missing = Vec::new();
        if self.transport.is_none() {
            missing.push(MissingField::Transport);
        }
        if self.on_incoming_call.is_none() {
            missing.push(MissingField::OnIncomingCall);
        }
        if self.on_call_response.is_none() {
            missing.push(MissingField::OnCallResponse);
        }
        if self.on_peer_stream.is_none() {
            missing.push(MissingField::OnPeerStream);
        }
        if self.on_disconnect.is_none() {
            missing.push(MissingField::OnDisconnect);
        }
        missing
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing(missing))
        }
    }

    /// Settle every handler once: either the supplied one or a fallback that
    /// reports the omission each time it fires.
    pub(crate) fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        let missing = self.missing_fields();
        let Some(transport) = self.transport else {
            return Err(ConfigError::Missing(missing));
        };
        if self.strict && !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        for field in &missing {
            warn!(field = %field, "handler not configured; installing fallback");
        }

        Ok(ResolvedConfig {
            transport,
            connections: self.connections,
            handlers: Handlers {
                on_incoming_call: self
                    .on_incoming_call
                    .unwrap_or_else(|| Arc::new(incoming_call_fallback)),
                on_call_response: self
                    .on_call_response
                    .unwrap_or_else(|| Arc::new(call_response_fallback)),
                on_disconnect: self
                    .on_disconnect
                    .unwrap_or_else(|| Arc::new(disconnect_fallback)),
            },
            on_peer_stream: self
                .on_peer_stream
                .unwrap_or_else(|| Arc::new(peer_stream_fallback)),
            my_stream: self.my_stream,
            rtc_config: self.rtc_config,
            ignore_non_turn: self.ignore_non_turn,
        })
    }
}

impl fmt::Debug for PhoneConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneConfig")
            .field("missing", &self.missing_fields())
            .field("my_stream", &self.my_stream)
            .field("rtc_config", &self.rtc_config)
            .field("ignore_non_turn", &self.ignore_non_turn)
            .field("strict", &self.strict)
            .finish()
    }
}

#[derive(Clone)]
pub(crate) struct Handlers {
    pub on_incoming_call: IncomingCallHandler,
    pub on_call_response: CallResponseHandler,
    pub on_disconnect: DisconnectHandler,
}

pub(crate) struct ResolvedConfig {
    pub transport: Arc<dyn SignalTransport>,
    pub connections: Option<Arc<dyn ConnectionFactory>>,
    pub handlers: Handlers,
    pub on_peer_stream: PeerStreamHandler,
    pub my_stream: Option<MediaStream>,
    pub rtc_config: RtcConfig,
    pub ignore_non_turn: bool,
}

fn incoming_call_fallback(peer: PeerId, responder: CallResponder) {
    error!(peer = %peer, "no on_incoming_call handler; rejecting call");
    responder.respond(CallAnswer::reject());
}

fn call_response_fallback(accepted: bool) {
    error!(accepted, "no on_call_response handler configured");
}

fn peer_stream_fallback(track: PeerTrack) {
    error!(track = %track.track_id, "no on_peer_stream handler configured");
}

fn disconnect_fallback() {
    error!("no on_disconnect handler configured");
}
