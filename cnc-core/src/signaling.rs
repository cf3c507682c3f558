//! Signaling envelopes: the three messages exchanged out-of-band to set up a session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Kind of session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as produced by the platform connection. Same JSON shape
/// as a browser `RTCSessionDescription` (`{"type": "offer", "sdp": "v=0..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Initial,
    Offer,
    Answer,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnvelopeKind::Initial => "initial",
            EnvelopeKind::Offer => "offer",
            EnvelopeKind::Answer => "answer",
        })
    }
}

/// A validated signaling envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEnvelope {
    /// "Here is my id; make me an offer."
    Initial { sender_id: PeerId },
    Offer {
        sender_id: PeerId,
        payload: SessionDescription,
    },
    Answer {
        sender_id: PeerId,
        payload: SessionDescription,
    },
}

/// Loose wire form. Browsers put the id in `deviceId` for `initial` and in
/// `senderId` for the other two kinds, and some relays add `recipientId`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient_id: Option<String>,
}

impl SignalingEnvelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            SignalingEnvelope::Initial { .. } => EnvelopeKind::Initial,
            SignalingEnvelope::Offer { .. } => EnvelopeKind::Offer,
            SignalingEnvelope::Answer { .. } => EnvelopeKind::Answer,
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        match self {
            SignalingEnvelope::Initial { sender_id }
            | SignalingEnvelope::Offer { sender_id, .. }
            | SignalingEnvelope::Answer { sender_id, .. } => sender_id,
        }
    }

    /// Parse envelope text (the decoded code or a relay frame).
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        let raw: RawEnvelope = serde_json::from_str(text.trim())?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnvelope) -> Result<Self, SignalingError> {
        let sender = raw
            .sender_id
            .or(raw.device_id)
            .filter(|s| !s.is_empty());
        match raw.kind.as_str() {
            "initial" => Ok(SignalingEnvelope::Initial {
                sender_id: sender.ok_or(SignalingError::MissingField("deviceId"))?.into(),
            }),
            "offer" | "answer" => {
                let sender_id: PeerId =
                    sender.ok_or(SignalingError::MissingField("senderId"))?.into();
                let payload = raw.sdp.ok_or(SignalingError::MissingField("sdp"))?;
                if raw.kind == "offer" {
                    if payload.kind != SdpType::Offer {
                        return Err(SignalingError::MismatchedDescription);
                    }
                    Ok(SignalingEnvelope::Offer { sender_id, payload })
                } else {
                    if payload.kind != SdpType::Answer {
                        return Err(SignalingError::MismatchedDescription);
                    }
                    Ok(SignalingEnvelope::Answer { sender_id, payload })
                }
            }
            other => Err(SignalingError::UnknownKind(other.to_string())),
        }
    }

    fn to_raw(&self) -> RawEnvelope {
        match self {
            SignalingEnvelope::Initial { sender_id } => RawEnvelope {
                kind: "initial".into(),
                device_id: Some(sender_id.to_string()),
                ..Default::default()
            },
            SignalingEnvelope::Offer { sender_id, payload } => RawEnvelope {
                kind: "offer".into(),
                sender_id: Some(sender_id.to_string()),
                sdp: Some(payload.clone()),
                ..Default::default()
            },
            SignalingEnvelope::Answer { sender_id, payload } => RawEnvelope {
                kind: "answer".into(),
                sender_id: Some(sender_id.to_string()),
                sdp: Some(payload.clone()),
                ..Default::default()
            },
        }
    }

    /// Encode for display / out-of-band delivery.
    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(&self.to_raw())?)
    }

    /// Encode for a relay that routes on `recipientId`.
    pub fn to_relay_json(&self, recipient: &PeerId) -> Result<String, SignalingError> {
        let mut raw = self.to_raw();
        raw.recipient_id = Some(recipient.to_string());
        Ok(serde_json::to_string(&raw)?)
    }
}

/// Envelope text could not be turned into a [`SignalingEnvelope`].
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("invalid signaling data: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid signaling data: unknown envelope type {0:?}")]
    UnknownKind(String),
    #[error("invalid signaling data: missing {0}")]
    MissingField(&'static str),
    #[error("invalid signaling data: session description type does not match envelope type")]
    MismatchedDescription,
}
