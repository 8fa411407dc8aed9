// Handshake validation and the document access check. This is the only place
// a connection is authorized; nothing downstream re-checks access.

use marginalia_common::types::{PeerId, RoomId};
use serde::Deserialize;
use thiserror::Error;

use crate::access::{AccessError, AccessPolicy, DocumentAccessStore};
use crate::error::{ErrorCode, RelayError};

/// Query parameters of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeParams {
    #[serde(rename = "docId")]
    pub doc_id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// A connection that passed the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub room: RoomId,
    pub peer: PeerId,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("docId query parameter is required")]
    MissingDocument,
    #[error("userId query parameter is required")]
    MissingPeer,
    #[error("peer {peer} lacks access to document {document_id}")]
    Forbidden { document_id: String, peer: PeerId },
    #[error(transparent)]
    Lookup(#[from] AccessError),
}

impl HandshakeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingDocument => ErrorCode::HandshakeMissingDocument,
            Self::MissingPeer => ErrorCode::HandshakeMissingPeer,
            Self::Forbidden { .. } => ErrorCode::AuthForbidden,
            Self::Lookup(_) => ErrorCode::AccessLookupFailed,
        }
    }

    /// Close reason sent to the client. Lookup failures keep the store
    /// error out of the frame.
    pub fn relay_error(&self) -> RelayError {
        RelayError::from_code(self.code())
    }
}

#[derive(Clone)]
pub struct Gatekeeper {
    access: DocumentAccessStore,
    policy: AccessPolicy,
}

impl Gatekeeper {
    pub fn new(access: DocumentAccessStore, policy: AccessPolicy) -> Self {
        Self { access, policy }
    }

    pub async fn admit(&self, params: &HandshakeParams) -> Result<Admission, HandshakeError> {
        let document_id = non_empty(params.doc_id.as_deref()).ok_or(HandshakeError::MissingDocument)?;
        let peer = non_empty(params.user_id.as_deref())
            .map(PeerId::new)
            .ok_or(HandshakeError::MissingPeer)?;

        if !self.access.is_authorized(self.policy, document_id, &peer).await? {
            return Err(HandshakeError::Forbidden { document_id: document_id.to_owned(), peer });
        }

        Ok(Admission { room: RoomId::for_document(document_id), peer })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
