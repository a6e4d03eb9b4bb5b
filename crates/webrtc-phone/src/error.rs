use thiserror::Error;
use transport_bus::BusError;

use crate::config::MissingField;

#[derive(Debug, Error)]
pub enum PhoneError {
    #[error("invalid phone configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("media connection error: {0}")]
    Media(#[from] MediaError),
    #[error("signaling transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed signaling message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("phone must be created inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required fields: {}", join_fields(.0))]
    Missing(Vec<MissingField>),
    #[error("invalid ICE server url {0:?}")]
    InvalidIceServer(String),
}

fn join_fields(fields: &[MissingField]) -> String {
    fields
        .iter()
        .map(|field| field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum MediaError {
    /// A remote candidate line could not be parsed. Expected while trickling
    /// and not worth reporting.
    #[error("error processing ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("connection is closed")]
    Closed,
    #[error("webrtc error: {0}")]
    Rtc(#[from] webrtc::Error),
}

impl MediaError {
    pub fn is_benign(&self) -> bool {
        matches!(self, MediaError::InvalidCandidate(_))
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
