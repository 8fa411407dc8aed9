// Presence and annotation frames for the marginalia-presence.v1 protocol.
//
// Server -> client frames and bus payloads share one encoding, so an event
// read off the bus is forwarded to sockets without re-shaping.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::PeerId;

pub const JOINED_TYPE: &str = "presence.joined";
pub const LEFT_TYPE: &str = "presence.left";
pub const ANNOTATION_TYPE: &str = "presence.annotation";

/// Every `type` value a [`PresenceEvent`] may carry.
pub const EVENT_TYPES: &[&str] = &[JOINED_TYPE, LEFT_TYPE, ANNOTATION_TYPE];

/// Every `type` value a [`ClientMessage`] may carry.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &["annotation"];

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no string `type` discriminator")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
}

/// A presence or annotation event relayed to the members of a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PresenceEvent {
    /// A peer opened a connection to the room.
    #[serde(rename = "presence.joined")]
    Joined {
        #[serde(rename = "userId")]
        peer: PeerId,
    },

    /// A peer's connection to the room closed.
    #[serde(rename = "presence.left")]
    Left {
        #[serde(rename = "userId")]
        peer: PeerId,
    },

    /// Opaque annotation payload broadcast by a peer.
    #[serde(rename = "presence.annotation")]
    Annotation {
        annotation: Value,
        #[serde(rename = "userId")]
        peer: PeerId,
    },
}

impl PresenceEvent {
    /// Peer the event originated from.
    pub fn origin(&self) -> &PeerId {
        match self {
            Self::Joined { peer } | Self::Left { peer } | Self::Annotation { peer, .. } => peer,
        }
    }

    /// Whether fan-out must skip the originating peer's connections.
    ///
    /// `Left` goes to everyone still in the room: the leaving connection is
    /// already unregistered, and the peer's other tabs should see it.
    pub fn excludes_origin(&self) -> bool {
        !matches!(self, Self::Left { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Joined { .. } => JOINED_TYPE,
            Self::Left { .. } => LEFT_TYPE,
            Self::Annotation { .. } => ANNOTATION_TYPE,
        }
    }
}

/// Client -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Annotation { annotation: Value },
}

impl ClientMessage {
    /// Attribute the frame to the sending peer.
    pub fn into_event(self, peer: PeerId) -> PresenceEvent {
        match self {
            Self::Annotation { annotation } => PresenceEvent::Annotation { annotation, peer },
        }
    }
}

pub fn encode_event(event: &PresenceEvent) -> Result<String, CodecError> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode_event(raw: &str) -> Result<PresenceEvent, CodecError> {
    decode_tagged(raw, EVENT_TYPES)
}

pub fn decode_client_message(raw: &str) -> Result<ClientMessage, CodecError> {
    decode_tagged(raw, CLIENT_MESSAGE_TYPES)
}

fn decode_tagged<T>(raw: &str, known_types: &[&str]) -> Result<T, CodecError>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value = serde_json::from_str(raw)?;
    let kind = value.get("type").and_then(Value::as_str).ok_or(CodecError::MissingType)?;
    if !known_types.contains(&kind) {
        return Err(CodecError::UnknownType(kind.to_owned()));
    }
    Ok(serde_json::from_value(value)?)
}
