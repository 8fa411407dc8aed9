// Identifiers shared across Marginalia crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of every room identity and bus topic.
pub const ROOM_PREFIX: &str = "doc:";

/// Identity of a collaboration room, always of the form `doc:<documentId>`.
///
/// The same string doubles as the bus topic for the room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Room for a document. The document id is taken verbatim.
    pub fn for_document(document_id: &str) -> Self {
        Self(format!("{ROOM_PREFIX}{document_id}"))
    }

    /// Parse a bus topic back into a room. Returns `None` for topics outside
    /// the `doc:` namespace or with an empty document id.
    pub fn from_topic(topic: &str) -> Option<Self> {
        match topic.strip_prefix(ROOM_PREFIX) {
            Some(document_id) if !document_id.is_empty() => Some(Self(topic.to_owned())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn document_id(&self) -> &str {
        &self.0[ROOM_PREFIX.len()..]
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer (authenticated user) identity. One peer may hold several
/// connections, one per open client tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
