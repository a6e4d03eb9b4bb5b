//! Signaling payloads, one per addressed channel.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::addressing::{CallId, PeerId};
use crate::config::RtcConfig;
use crate::media::{IceCandidate, SessionDescription};

/// Sent by the caller on `$webRTC.incomingCall.<callee>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invite {
    pub call_id: CallId,
    pub sender: PeerId,
    #[serde(default)]
    pub rtc_config: RtcConfig,
    pub remote_description: SessionDescription,
}

/// Sent by the callee on `$webRTC.callResponse.<caller>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub call_id: CallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerId>,
    pub accepted_call: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_description: Option<SessionDescription>,
}

impl CallResponse {
    pub fn rejected(call_id: CallId) -> Self {
        Self {
            call_id,
            sender: None,
            accepted_call: false,
            remote_description: None,
        }
    }

    pub fn accepted(call_id: CallId, sender: PeerId, answer: SessionDescription) -> Self {
        Self {
            call_id,
            sender: Some(sender),
            accepted_call: true,
            remote_description: Some(answer),
        }
    }
}

/// Trickled candidates on `$webRTC.peerIceCandidate.<peer>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateBatch {
    pub call_id: CallId,
    pub candidates: Vec<IceCandidate>,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
