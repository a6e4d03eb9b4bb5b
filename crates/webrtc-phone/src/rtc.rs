//! [`MediaConnection`] backed by a `webrtc` peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{IceTransportPolicy, RtcConfig};
use crate::error::MediaError;
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionFactory, IceCandidate, IceConnectionState,
    MediaConnection, MediaStream, OfferOptions, PeerTrack, SdpType, SessionDescription,
};

/// Builds peer connections with the default codecs and interceptors.
#[derive(Clone)]
pub struct RtcConnectionFactory {
    api: Arc<API>,
}

impl RtcConnectionFactory {
    pub fn new() -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }

    pub fn with_api(api: Arc<API>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    async fn connect(
        &self,
        config: &RtcConfig,
        events: ConnectionEvents,
    ) -> Result<Arc<dyn MediaConnection>, MediaError> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(config))
                .await?,
        );
        wire_events(&peer_connection, events);
        Ok(Arc::new(RtcConnection { peer_connection }))
    }
}

pub struct RtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcConnection {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Add receive-only transceivers for kinds the offer should include but
    /// no local track provides.
    async fn ensure_receivers(&self, options: &OfferOptions) -> Result<(), MediaError> {
        let transceivers = self.peer_connection.get_transceivers().await;
        let wanted = [
            (options.offer_to_receive_audio, RTPCodecType::Audio),
            (options.offer_to_receive_video, RTPCodecType::Video),
        ];
        for (enabled, kind) in wanted {
            if !enabled || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_stream(&self, stream: &MediaStream) -> Result<(), MediaError> {
        for track in stream.tracks() {
            self.peer_connection.add_track(track.clone()).await?;
        }
        Ok(())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SessionDescription, MediaError> {
        self.ensure_receivers(options).await?;
        let offer = self
            .peer_connection
            .create_offer(Some(RTCOfferOptions {
                ice_restart: options.ice_restart,
                ..Default::default()
            }))
            .await?;
        description_from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.peer_connection.create_answer(None).await?;
        description_from_rtc(&answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.peer_connection
            .set_local_description(description_to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.peer_connection
            .set_remote_description(description_to_rtc(description)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(candidate_error)
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.peer_connection.close().await?;
        Ok(())
    }
}

/// Only a candidate line that fails to parse is classed as invalid; agent and
/// state failures keep their `webrtc` error.
fn candidate_error(err: webrtc::Error) -> MediaError {
    match err {
        webrtc::Error::ErrConnectionClosed => MediaError::Closed,
        webrtc::Error::Ice(ref ice_err) if is_unparseable(ice_err) => {
            MediaError::InvalidCandidate(err.to_string())
        }
        other => MediaError::Rtc(other),
    }
}

fn is_unparseable(err: &ice::Error) -> bool {
    matches!(
        err,
        ice::Error::ParseInt(_)
            | ice::Error::ParseIp(_)
            | ice::Error::ErrAddressParseFailed
            | ice::Error::ErrAttributeTooShortIceCandidate
            | ice::Error::ErrParseComponent
            | ice::Error::ErrParsePriority
            | ice::Error::ErrParsePort
            | ice::Error::ErrParseRelatedAddr
            | ice::Error::ErrParseType
            | ice::Error::ErrUnknownCandidateType
            | ice::Error::ErrUnknownType
            | ice::Error::Other(_)
    )
}

fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match config.ice_transport_policy {
            Some(IceTransportPolicy::Relay) => RTCIceTransportPolicy::Relay,
            Some(IceTransportPolicy::All) => RTCIceTransportPolicy::All,
            None => RTCIceTransportPolicy::Unspecified,
        },
        ..Default::default()
    }
}

fn wire_events(peer_connection: &RTCPeerConnection, events: ConnectionEvents) {
    let candidates = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!("local candidate gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = events.send(ConnectionEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(err) => warn!(error = %err, "failed to serialize local candidate"),
            }
        })
    }));

    let connectivity = events.clone();
    peer_connection.on_ice_connection_state_change(Box::new(
        move |state: RTCIceConnectionState| {
            let events = connectivity.clone();
            Box::pin(async move {
                if let Some(state) = connectivity_state(state) {
                    let _ = events.send(ConnectionEvent::ConnectivityChanged(state));
                }
            })
        },
    ));

    let negotiation = events.clone();
    peer_connection.on_negotiation_needed(Box::new(move || {
        let events = negotiation.clone();
        Box::pin(async move {
            let _ = events.send(ConnectionEvent::NegotiationNeeded);
        })
    }));

    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                let mut peer_track =
                    PeerTrack::new(track.id(), track.stream_id(), track.kind().to_string());
                peer_track.remote = Some(track);
                let _ = events.send(ConnectionEvent::RemoteTrack(peer_track));
            })
        },
    ));
}

fn connectivity_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn description_from_rtc(
    description: &RTCSessionDescription,
) -> Result<SessionDescription, MediaError> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MediaError::Description("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp.clone(),
    })
}

fn description_to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(MediaError::Description("unsupported sdp type rollback".into()));
        }
    };
    Ok(rtc)
}
