//! Signaling and peer state types
//!
//! The relay speaks loosely shaped JSON: a message is an offer, answer or
//! candidate depending on which field is present, addressed with
//! `target_id` on the way out and stamped with `source_id` by the relay on
//! the way in. [`SignalingMessage`] is the validated form; anything that
//! does not fit is rejected at [`SignalingMessage::from_json`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::transport::ProtocolError;

/// Label of the data channel opened by the caller
pub const DATA_CHANNEL_LABEL: &str = "textMessagingChannel";

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged through the relay (`{type, sdp}`)
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

/// ICE candidate in browser `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
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
}

/// A validated relay message.
///
/// `peer_id` is the remote side: the sender for inbound messages, the
/// target for outbound ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer { peer_id: String, offer: SessionDescription },
    Answer { peer_id: String, answer: SessionDescription },
    Candidate { peer_id: String, candidate: IceCandidate },
    Ping,
    Pong,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    msg_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
}

impl SignalingMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate { .. } => "candidate",
            SignalingMessage::Ping => "ping",
            SignalingMessage::Pong => "pong",
        }
    }

    /// Remote peer this message concerns, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { peer_id, .. }
            | SignalingMessage::Answer { peer_id, .. }
            | SignalingMessage::Candidate { peer_id, .. } => Some(peer_id),
            SignalingMessage::Ping | SignalingMessage::Pong => None,
        }
    }

    /// Outbound encoding, addressed with `target_id`
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let mut wire = WireMessage::default();
        match self {
            SignalingMessage::Offer { peer_id, offer } => {
                wire.offer = Some(offer.clone());
                wire.target_id = Some(peer_id.clone());
            }
            SignalingMessage::Answer { peer_id, answer } => {
                wire.answer = Some(answer.clone());
                wire.target_id = Some(peer_id.clone());
            }
            SignalingMessage::Candidate { peer_id, candidate } => {
                wire.candidate = Some(candidate.clone());
                wire.target_id = Some(peer_id.clone());
            }
            SignalingMessage::Ping => wire.msg_type = Some("ping".to_string()),
            SignalingMessage::Pong => wire.msg_type = Some("pong".to_string()),
        }
        serde_json::to_string(&wire).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Inbound decoding; the remote id is read from `source_id`
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let wire: WireMessage =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match wire.msg_type.as_deref() {
            Some("pong") => return Ok(SignalingMessage::Pong),
            Some("ping") => return Ok(SignalingMessage::Ping),
            _ => {}
        }

        let source = || {
            wire.source_id
                .clone()
                .ok_or_else(|| ProtocolError::Malformed("missing source_id".to_string()))
        };

        if let Some(offer) = wire.offer.clone() {
            return Ok(SignalingMessage::Offer { peer_id: source()?, offer });
        }
        if let Some(answer) = wire.answer.clone() {
            return Ok(SignalingMessage::Answer { peer_id: source()?, answer });
        }
        if let Some(candidate) = wire.candidate.clone() {
            return Ok(SignalingMessage::Candidate { peer_id: source()?, candidate });
        }

        Err(ProtocolError::UnknownType(
            wire.msg_type.unwrap_or_else(|| "<none>".to_string()),
        ))
    }
}

/// Which side initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the offer
    Caller,
    /// We answered an offer
    Callee,
}

/// Negotiation progress for one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupPhase {
    Idle,
    OfferCreated,
    LocalDescriptionSet,
    RemoteDescriptionSet,
    AnswerSent,
    ChannelOpen,
    Disconnected,
}

impl fmt::Display for SetupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SetupPhase::Idle => "idle",
            SetupPhase::OfferCreated => "offer-created",
            SetupPhase::LocalDescriptionSet => "local-description-set",
            SetupPhase::RemoteDescriptionSet => "remote-description-set",
            SetupPhase::AnswerSent => "answer-sent",
            SetupPhase::ChannelOpen => "channel-open",
            SetupPhase::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Snapshot of one peer, as reported by the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub peer_id: String,
    pub role: Role,
    pub phase: SetupPhase,
    /// `None` until we create a send channel
    pub send_open: Option<bool>,
    /// `None` until the remote side announces a channel
    pub receive_open: Option<bool>,
    pub pending_candidates: usize,
}

impl PeerState {
    /// At least one channel exists and every channel we know about is open
    pub fn is_ready(&self) -> bool {
        let known: Vec<bool> = [self.send_open, self.receive_open].into_iter().flatten().collect();
        !known.is_empty() && known.iter().all(|open| *open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_offer_uses_source_id() {
        let text = r#"{"offer":{"type":"offer","sdp":"v=0"},"source_id":"peer-a"}"#;
        let msg = SignalingMessage::from_json(text).unwrap();
        assert_eq!(
            msg,
            SignalingMessage::Offer {
                peer_id: "peer-a".to_string(),
                offer: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn test_outbound_candidate_uses_target_id() {
        let msg = SignalingMessage::Candidate {
            peer_id: "peer-b".to_string(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        let json: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json["target_id"], "peer-b");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert!(json.get("source_id").is_none());
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(SignalingMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(SignalingMessage::from_json(r#"{"type":"pong"}"#).unwrap(), SignalingMessage::Pong);
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        assert!(matches!(
            SignalingMessage::from_json(r#"{"type":"hello"}"#),
            Err(ProtocolError::UnknownType(_))
        ));
        assert!(matches!(
            SignalingMessage::from_json(r#"{"answer":{"type":"answer","sdp":"x"}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(SignalingMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_readiness_needs_every_known_channel() {
        let mut state = PeerState {
            peer_id: "p".to_string(),
            role: Role::Caller,
            phase: SetupPhase::ChannelOpen,
            send_open: None,
            receive_open: None,
            pending_candidates: 0,
        };
        assert!(!state.is_ready());
        state.send_open = Some(true);
        assert!(state.is_ready());
        state.receive_open = Some(false);
        assert!(!state.is_ready());
        state.receive_open = Some(true);
        assert!(state.is_ready());
    }
}
