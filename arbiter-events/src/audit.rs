//! Append-only audit trail.
//!
//! Every decision, execution, escalation resolution, adaptation attempt and
//! rollback lands here. Entries are sealed into a Blake3 hash chain by the
//! repository at append time.

use arbiter_core::{
    verify_chain, ArbiterError, ArbiterResult, AuditDraft, AuditEntry, AuditKind, Timestamp,
};
use arbiter_storage::AuditRepository;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Entry counts per kind, for analytics views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Clone)]
pub struct AuditTrail {
    repo: Arc<dyn AuditRepository>,
}

impl AuditTrail {
    pub fn new(repo: Arc<dyn AuditRepository>) -> Self {
        Self { repo }
    }

    /// Build the draft for an entry without storing it.
    pub fn draft(
        kind: AuditKind,
        subject_id: impl Into<Uuid>,
        summary: impl Into<String>,
        payload: &impl Serialize,
        now: Timestamp,
    ) -> ArbiterResult<AuditDraft> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| ArbiterError::invalid_value("audit.payload", e.to_string()))?;
        Ok(AuditDraft::new(kind, subject_id, summary, payload, now))
    }

    pub async fn record(
        &self,
        kind: AuditKind,
        subject_id: impl Into<Uuid>,
        summary: impl Into<String>,
        payload: &impl Serialize,
        now: Timestamp,
    ) -> ArbiterResult<AuditEntry> {
        let draft = Self::draft(kind, subject_id, summary, payload, now)?;
        self.append(draft).await
    }

    pub async fn append(&self, draft: AuditDraft) -> ArbiterResult<AuditEntry> {
        let entry = self.repo.audit_append(draft).await?;
        debug!(
            sequence = entry.sequence,
            kind = %entry.kind,
            subject_id = %entry.subject_id,
            "Audit entry appended"
        );
        Ok(entry)
    }

    /// Append unless an entry of the same kind already exists for the
    /// subject. Used when replaying interrupted commits.
    pub async fn append_once(&self, draft: AuditDraft) -> ArbiterResult<AuditEntry> {
        let existing = self.repo.audit_find_by_subject(draft.subject_id).await?;
        if let Some(entry) = existing.into_iter().find(|e| e.kind == draft.kind) {
            return Ok(entry);
        }
        self.append(draft).await
    }

    pub async fn entries_for(&self, subject_id: impl Into<Uuid>) -> ArbiterResult<Vec<AuditEntry>> {
        self.repo.audit_find_by_subject(subject_id.into()).await
    }

    /// Human-readable history of one subject, oldest first.
    pub async fn explain(&self, subject_id: impl Into<Uuid>) -> ArbiterResult<Vec<String>> {
        let entries = self.entries_for(subject_id).await?;
        Ok(entries
            .iter()
            .map(|e| format!("[{}] {}: {}", e.recorded_at.to_rfc3339(), e.kind, e.summary))
            .collect())
    }

    /// Sequence number of the first entry that fails verification, if any.
    pub async fn first_break(&self) -> ArbiterResult<Option<u64>> {
        let entries = self.repo.audit_list().await?;
        match verify_chain(&entries) {
            Ok(()) => Ok(None),
            Err(chain_break) => {
                warn!(sequence = chain_break.sequence, "Audit chain verification failed");
                Ok(Some(chain_break.sequence))
            }
        }
    }

    pub async fn summarize(&self) -> ArbiterResult<AuditSummary> {
        let entries = self.repo.audit_list().await?;
        let mut summary = AuditSummary {
            total: entries.len(),
            ..AuditSummary::default()
        };
        for entry in &entries {
            *summary
                .by_kind
                .entry(entry.kind.as_db_str().to_string())
                .or_default() += 1;
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}
