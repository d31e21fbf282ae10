//! Append-only audit entries with a Blake3 hash chain
//!
//! Each entry hashes its own content together with the previous entry's
//! hash, so rewriting any past entry breaks every hash after it.

use crate::{AuditEntryId, EntityIdType, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    DecisionRecorded,
    DecisionExecuted,
    EscalationResolved,
    AdaptationAttempted,
    PreferenceRolledBack,
}

impl AuditKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditKind::DecisionRecorded => "decision_recorded",
            AuditKind::DecisionExecuted => "decision_executed",
            AuditKind::EscalationResolved => "escalation_resolved",
            AuditKind::AdaptationAttempted => "adaptation_attempted",
            AuditKind::PreferenceRolledBack => "preference_rolled_back",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Link to the previous entry. The first entry has a zero `prev_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HashChain {
    pub prev_hash: [u8; 32],
    pub entry_hash: [u8; 32],
}

/// Entry content before it is sealed into the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditDraft {
    pub kind: AuditKind,
    pub subject_id: Uuid,
    pub summary: String,
    pub payload: serde_json::Value,
    pub recorded_at: Timestamp,
}

impl AuditDraft {
    pub fn new(
        kind: AuditKind,
        subject_id: impl Into<Uuid>,
        summary: impl Into<String>,
        payload: serde_json::Value,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            kind,
            subject_id: subject_id.into(),
            summary: summary.into(),
            payload,
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: AuditEntryId,
    pub sequence: u64,
    pub kind: AuditKind,
    pub subject_id: Uuid,
    pub summary: String,
    pub payload: serde_json::Value,
    pub recorded_at: Timestamp,
    pub hash_chain: HashChain,
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    sequence: u64,
    kind: AuditKind,
    subject_id: &'a Uuid,
    summary: &'a str,
    payload: &'a serde_json::Value,
    recorded_at: &'a Timestamp,
    prev_hash: &'a [u8; 32],
}

impl AuditEntry {
    /// Seal a draft after `previous` (or as the first entry).
    pub fn seal(draft: AuditDraft, previous: Option<&AuditEntry>) -> Self {
        let (sequence, prev_hash) = match previous {
            Some(prev) => (prev.sequence + 1, prev.hash_chain.entry_hash),
            None => (0, [0u8; 32]),
        };
        let mut entry = Self {
            entry_id: AuditEntryId::now_v7(),
            sequence,
            kind: draft.kind,
            subject_id: draft.subject_id,
            summary: draft.summary,
            payload: draft.payload,
            recorded_at: draft.recorded_at,
            hash_chain: HashChain {
                prev_hash,
                entry_hash: [0u8; 32],
            },
        };
        entry.hash_chain.entry_hash = entry.compute_hash();
        entry
    }

    pub fn compute_hash(&self) -> [u8; 32] {
        let canonical = CanonicalEntry {
            sequence: self.sequence,
            kind: self.kind,
            subject_id: &self.subject_id,
            summary: &self.summary,
            payload: &self.payload,
            recorded_at: &self.recorded_at,
            prev_hash: &self.hash_chain.prev_hash,
        };
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        blake3::hash(&bytes).into()
    }

    pub fn entry_hash_hex(&self) -> String {
        hex::encode(self.hash_chain.entry_hash)
    }
}

/// First position where an audit chain fails verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainBreak {
    pub sequence: u64,
}

/// Verify a chain given in sequence order.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainBreak> {
    let mut expected_prev = [0u8; 32];
    for (position, entry) in entries.iter().enumerate() {
        if entry.sequence != position as u64
            || entry.hash_chain.prev_hash != expected_prev
            || entry.compute_hash() != entry.hash_chain.entry_hash
        {
            return Err(ChainBreak {
                sequence: entry.sequence,
            });
        }
        expected_prev = entry.hash_chain.entry_hash;
    }
    Ok(())
}
