//! Identity types for ARBITER entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash for integrity verification.
pub type ContentHash = [u8; 32];

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Common behaviour of the strongly typed entity identifiers.
pub trait EntityIdType:
    Copy + Clone + fmt::Debug + fmt::Display + PartialEq + Eq + std::hash::Hash + Ord
{
    /// Human readable entity name used in errors and logs.
    const ENTITY_NAME: &'static str;

    fn new(uuid: Uuid) -> Self;
    fn as_uuid(&self) -> Uuid;

    /// Create a fresh timestamp-sortable identifier.
    fn now_v7() -> Self {
        Self::new(Uuid::now_v7())
    }

    fn nil() -> Self {
        Self::new(Uuid::nil())
    }
}

macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident, $entity:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl EntityIdType for $name {
            const ENTITY_NAME: &'static str = $entity;

            fn new(uuid: Uuid) -> Self {
                Self(uuid)
            }

            fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_entity_id!(
    /// Identifier of an agent proposal.
    ProposalId,
    "proposal"
);
define_entity_id!(
    /// Identifier of a detected conflict (singleton conflicts included).
    ConflictId,
    "conflict"
);
define_entity_id!(DecisionId, "decision");
define_entity_id!(PolicyId, "policy");
define_entity_id!(
    /// Identifier of an auto-adaptation attempt.
    AttemptId,
    "attempt"
);
define_entity_id!(SuggestionId, "suggestion");
define_entity_id!(ChangeRecordId, "preference_change");
define_entity_id!(AuditEntryId, "audit_entry");
define_entity_id!(EventId, "event");
define_entity_id!(FeedbackId, "feedback");
define_entity_id!(PatternId, "pattern");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_ids_are_time_sortable() {
        let first = ProposalId::now_v7();
        let second = ProposalId::now_v7();
        assert!(first <= second);
        assert_ne!(first, second);
    }

    #[test]
    fn test_typed_id_round_trips_through_string() {
        let id = DecisionId::now_v7();
        let parsed: DecisionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_typed_id_serializes_transparently() {
        let uuid = new_entity_id();
        let id = AttemptId::new(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", uuid));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(compute_content_hash(b"policy"), compute_content_hash(b"policy"));
        assert_ne!(compute_content_hash(b"policy"), compute_content_hash(b"policy2"));
    }
}
