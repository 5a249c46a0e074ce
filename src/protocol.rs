//! Signaling and controller message formats
//!
//! Everything here is JSON on the wire: SDP blobs use the browser
//! `RTCSessionDescription` shape, controller messages are tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::identity::PeerIdentity;

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Messages broadcast between peers over their data channels
///
/// Receivers must tolerate tags they do not know: those decode to `Unknown`
/// and are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControllerMessage {
    /// Signaling relayed by the coordinator between two peers
    #[serde(rename_all = "camelCase")]
    PeerConnectionInfo {
        /// Target when sent to the coordinator, origin once relayed
        peer_uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        answer: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_candidate: Option<IceCandidate>,
    },

    /// Membership announcement
    PeerInfo { peer: PeerIdentity },

    #[serde(rename_all = "camelCase")]
    PeerDisconnected { peer_uuid: String },

    #[serde(other)]
    Unknown,
}

impl ControllerMessage {
    pub fn relay_offer(peer_uuid: impl Into<String>, offer: SessionDescription) -> Self {
        ControllerMessage::PeerConnectionInfo {
            peer_uuid: peer_uuid.into(),
            offer: Some(offer),
            answer: None,
            ice_candidate: None,
        }
    }

    pub fn relay_answer(peer_uuid: impl Into<String>, answer: SessionDescription) -> Self {
        ControllerMessage::PeerConnectionInfo {
            peer_uuid: peer_uuid.into(),
            offer: None,
            answer: Some(answer),
            ice_candidate: None,
        }
    }

    /// Wire tag, for logs
    pub fn type_name(&self) -> &'static str {
        match self {
            ControllerMessage::PeerConnectionInfo { .. } => "peerConnectionInfo",
            ControllerMessage::PeerInfo { .. } => "peerInfo",
            ControllerMessage::PeerDisconnected { .. } => "peerDisconnected",
            ControllerMessage::Unknown => "unknown",
        }
    }

    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Serializing these types cannot fail: no maps with non-string keys
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Body of `POST /connect_webrtc_peer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub name: String,
    pub uuid: String,
    pub sdp: SessionDescription,
}

/// Reply to `POST /connect_webrtc_peer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectResponse {
    pub fn ok(answer: SessionDescription, uuid: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            sdp: Some(answer),
            uuid: Some(uuid.into()),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            sdp: None,
            uuid: None,
            error: Some(msg.into()),
        }
    }

    /// Split into answer and responder uuid, rejecting anything but a complete `ok`
    pub fn into_answer(self) -> Result<(SessionDescription, String), SignalingError> {
        if self.status != "ok" {
            return Err(SignalingError::Rejected(
                self.error.unwrap_or_else(|| format!("status {}", self.status)),
            ));
        }
        match (self.sdp, self.uuid) {
            (Some(sdp), Some(uuid)) if sdp.kind == SdpKind::Answer && !uuid.is_empty() => {
                Ok((sdp, uuid))
            }
            (Some(_), Some(_)) => Err(SignalingError::Malformed(
                "bootstrap reply carries an offer instead of an answer".into(),
            )),
            _ => Err(SignalingError::Malformed(
                "bootstrap reply is missing sdp or uuid".into(),
            )),
        }
    }
}
