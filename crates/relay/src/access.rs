// Document-access lookup: does a peer own, or belong to, a document?
//
// This is the relay's only touch point with persistent storage. Ownership and
// membership are fetched together and combined by the configured policy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use marginalia_common::types::PeerId;
use thiserror::Error;
use tokio::sync::RwLock;

/// How ownership and membership combine into an access decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessPolicy {
    /// Owners and listed members are both admitted.
    #[default]
    OwnerOrMember,
    /// Only owners who are also listed as members are admitted.
    OwnerAndMember,
}

impl AccessPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "owner_or_member" => Some(Self::OwnerOrMember),
            "owner_and_member" => Some(Self::OwnerAndMember),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OwnerOrMember => "owner_or_member",
            Self::OwnerAndMember => "owner_and_member",
        }
    }

    pub fn allows(self, facts: AccessFacts) -> bool {
        match self {
            Self::OwnerOrMember => facts.is_owner || facts.is_member,
            Self::OwnerAndMember => facts.is_owner && facts.is_member,
        }
    }
}

/// Raw access records for one (document, peer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessFacts {
    pub is_owner: bool,
    pub is_member: bool,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("document access lookup failed: {0}")]
    Lookup(#[from] sqlx::Error),
}

#[derive(Debug, Default)]
pub struct MemoryAccessRecords {
    owners: HashMap<String, PeerId>,
    members: HashSet<(String, PeerId)>,
}

#[derive(Clone)]
pub enum DocumentAccessStore {
    Postgres(sqlx::PgPool),
    Memory(Arc<RwLock<MemoryAccessRecords>>),
}

impl DocumentAccessStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryAccessRecords::default())))
    }

    /// Record `owner` as the owner of `document_id`. No-op for Postgres.
    pub async fn grant_owner(&self, document_id: &str, owner: &PeerId) {
        if let Self::Memory(records) = self {
            records.write().await.owners.insert(document_id.to_owned(), owner.clone());
        }
    }

    /// Record `member` as a listed member of `document_id`. No-op for Postgres.
    pub async fn grant_member(&self, document_id: &str, member: &PeerId) {
        if let Self::Memory(records) = self {
            records.write().await.members.insert((document_id.to_owned(), member.clone()));
        }
    }

    pub async fn access_facts(
        &self,
        document_id: &str,
        peer: &PeerId,
    ) -> Result<AccessFacts, AccessError> {
        match self {
            Self::Postgres(pool) => {
                let (is_owner, is_member) = sqlx::query_as::<_, (bool, bool)>(
                    r#"
                    SELECT
                        EXISTS (
                            SELECT 1 FROM "Document"
                            WHERE "id" = $1 AND "ownerId" = $2
                        ) AS is_owner,
                        EXISTS (
                            SELECT 1 FROM "DocumentMember"
                            WHERE "documentId" = $1 AND "userId" = $2
                        ) AS is_member
                    "#,
                )
                .bind(document_id)
                .bind(peer.as_str())
                .fetch_one(pool)
                .await?;

                Ok(AccessFacts { is_owner, is_member })
            }
            Self::Memory(records) => {
                let guard = records.read().await;
                Ok(AccessFacts {
                    is_owner: guard.owners.get(document_id) == Some(peer),
                    is_member: guard.members.contains(&(document_id.to_owned(), peer.clone())),
                })
            }
        }
    }

    pub async fn is_authorized(
        &self,
        policy: AccessPolicy,
        document_id: &str,
        peer: &PeerId,
    ) -> Result<bool, AccessError> {
        Ok(policy.allows(self.access_facts(document_id, peer).await?))
    }
}
