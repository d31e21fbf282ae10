//! In-memory implementation of every repository trait.
//!
//! Intended as a test double. Failures can be injected per operation name to
//! exercise retry, compensation and replay paths.

use crate::{
    AttemptRepository, AuditRepository, ConflictRepository, DecisionIntent,
    DecisionJournalRepository, ExecutionIntent, DecisionRepository, PolicyRepository, PreferenceRepository,
    ProposalRepository,
};
use ::async_trait::async_trait;
use arbiter_core::{
    AdaptationPolicy, ArbiterError, ArbiterResult, ArbitrationDecision, ArbitrationPolicy,
    AttemptId, AttemptOutcome, AttemptResult, AuditDraft, AuditEntry, AutoAdaptationAttempt,
    Conflict, ConflictId, DecisionId, EntityIdType, FeedbackSignal, LearnedSuggestion,
    ObservedPattern, PatternId, PolicyId, PolicySubject, PreferenceChangeRecord, PreferenceKey,
    PreferenceState, Proposal, ProposalId, ProposalStatus, StorageError, SuggestionId, TargetRef,
    Timestamp,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

fn read<T>(lock: &RwLock<T>) -> ArbiterResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| ArbiterError::Storage(StorageError::LockPoisoned))
}

fn write<T>(lock: &RwLock<T>) -> ArbiterResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ArbiterError::Storage(StorageError::LockPoisoned))
}

fn already_exists(entity_type: &'static str) -> ArbiterError {
    ArbiterError::Storage(StorageError::InsertFailed {
        entity_type,
        reason: "already exists".to_string(),
    })
}

fn not_found(entity_type: &'static str, id: Uuid) -> ArbiterError {
    ArbiterError::Storage(StorageError::NotFound { entity_type, id })
}

/// Shared in-memory store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    proposals: Arc<RwLock<HashMap<ProposalId, Proposal>>>,
    policies: Arc<RwLock<HashMap<PolicyId, ArbitrationPolicy>>>,
    adaptation_policy: Arc<RwLock<Option<AdaptationPolicy>>>,
    conflicts: Arc<RwLock<HashMap<ConflictId, Conflict>>>,
    decisions: Arc<RwLock<HashMap<DecisionId, ArbitrationDecision>>>,
    attempts: Arc<RwLock<HashMap<AttemptId, AutoAdaptationAttempt>>>,
    feedback: Arc<RwLock<Vec<FeedbackSignal>>>,
    patterns: Arc<RwLock<HashMap<PatternId, ObservedPattern>>>,
    suggestions: Arc<RwLock<HashMap<SuggestionId, LearnedSuggestion>>>,
    preferences: Arc<RwLock<HashMap<PreferenceKey, PreferenceState>>>,
    history: Arc<RwLock<Vec<PreferenceChangeRecord>>>,
    audit: Arc<RwLock<Vec<AuditEntry>>>,
    journal: Arc<RwLock<HashMap<DecisionId, DecisionIntent>>>,
    executions: Arc<RwLock<HashMap<DecisionId, ExecutionIntent>>>,
    faults: Arc<Mutex<HashMap<&'static str, u32>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `operation` fail with a transient error.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(operation, times);
        }
    }

    fn check_fault(&self, operation: &'static str) -> ArbiterResult<()> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| ArbiterError::Storage(StorageError::LockPoisoned))?;
        if let Some(remaining) = faults.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ArbiterError::Storage(StorageError::Unavailable {
                    reason: format!("injected failure in {}", operation),
                }));
            }
        }
        Ok(())
    }

    /// Overwrite an audit entry in place. Only useful for tamper tests.
    pub fn tamper_audit_entry(&self, sequence: u64, summary: &str) -> ArbiterResult<()> {
        let mut audit = write(&self.audit)?;
        let entry = audit
            .iter_mut()
            .find(|e| e.sequence == sequence)
            .ok_or_else(|| ArbiterError::invalid_value("sequence", "no such audit entry"))?;
        entry.summary = summary.to_string();
        Ok(())
    }
}

fn sorted_by_creation(mut proposals: Vec<Proposal>) -> Vec<Proposal> {
    proposals.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.proposal_id.cmp(&b.proposal_id))
    });
    proposals
}

// ============================================================================
// PROPOSALS
// ============================================================================

#[async_trait]
impl ProposalRepository for MemoryStore {
    async fn proposal_insert(&self, proposal: &Proposal) -> ArbiterResult<()> {
        self.check_fault("proposal_insert")?;
        let mut proposals = write(&self.proposals)?;
        if proposals.contains_key(&proposal.proposal_id) {
            return Err(already_exists("proposal"));
        }
        proposals.insert(proposal.proposal_id, proposal.clone());
        Ok(())
    }

    async fn proposal_get(&self, id: ProposalId) -> ArbiterResult<Option<Proposal>> {
        Ok(read(&self.proposals)?.get(&id).cloned())
    }

    async fn proposal_update(&self, proposal: &Proposal) -> ArbiterResult<()> {
        self.check_fault("proposal_update")?;
        let mut proposals = write(&self.proposals)?;
        let slot = proposals
            .get_mut(&proposal.proposal_id)
            .ok_or_else(|| not_found("proposal", proposal.proposal_id.as_uuid()))?;
        *slot = proposal.clone();
        Ok(())
    }

    async fn proposal_list_pending(&self) -> ArbiterResult<Vec<Proposal>> {
        self.proposal_list_by_status(ProposalStatus::Pending).await
    }

    async fn proposal_list_pending_for_target(
        &self,
        target: &TargetRef,
    ) -> ArbiterResult<Vec<Proposal>> {
        let proposals = read(&self.proposals)?;
        Ok(sorted_by_creation(
            proposals
                .values()
                .filter(|p| p.status == ProposalStatus::Pending && &p.target == target)
                .cloned()
                .collect(),
        ))
    }

    async fn proposal_list_by_agent(&self, agent_name: &str) -> ArbiterResult<Vec<Proposal>> {
        let proposals = read(&self.proposals)?;
        Ok(sorted_by_creation(
            proposals
                .values()
                .filter(|p| p.agent_name == agent_name)
                .cloned()
                .collect(),
        ))
    }

    async fn proposal_list_by_status(
        &self,
        status: ProposalStatus,
    ) -> ArbiterResult<Vec<Proposal>> {
        let proposals = read(&self.proposals)?;
        Ok(sorted_by_creation(
            proposals
                .values()
                .filter(|p| p.status == status)
                .cloned()
                .collect(),
        ))
    }
}

// ============================================================================
// POLICIES
// ============================================================================

impl MemoryStore {
    fn latest_policy(
        &self,
        matches: impl Fn(&PolicySubject) -> bool,
    ) -> ArbiterResult<Option<ArbitrationPolicy>> {
        let policies = read(&self.policies)?;
        Ok(policies
            .values()
            .filter(|p| matches(&p.subject))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.policy_id.cmp(&b.policy_id))
            })
            .cloned())
    }
}

#[async_trait]
impl PolicyRepository for MemoryStore {
    async fn policy_insert(&self, policy: &ArbitrationPolicy) -> ArbiterResult<()> {
        let mut policies = write(&self.policies)?;
        if policies.contains_key(&policy.policy_id) {
            return Err(already_exists("policy"));
        }
        policies.insert(policy.policy_id, policy.clone());
        Ok(())
    }

    async fn policy_get(&self, id: PolicyId) -> ArbiterResult<Option<ArbitrationPolicy>> {
        Ok(read(&self.policies)?.get(&id).cloned())
    }

    async fn policy_find_default(&self) -> ArbiterResult<Option<ArbitrationPolicy>> {
        self.latest_policy(|s| matches!(s, PolicySubject::Default))
    }

    async fn policy_find_for_agent(
        &self,
        agent_name: &str,
    ) -> ArbiterResult<Option<ArbitrationPolicy>> {
        self.latest_policy(|s| matches!(s, PolicySubject::Agent { agent_name: a } if a == agent_name))
    }

    async fn policy_find_for_preference(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<ArbitrationPolicy>> {
        self.latest_policy(|s| {
            matches!(s, PolicySubject::Preference { category: c, key: k } if c == category && k == key)
        })
    }

    async fn adaptation_policy_get(&self) -> ArbiterResult<Option<AdaptationPolicy>> {
        Ok(read(&self.adaptation_policy)?.clone())
    }

    async fn adaptation_policy_save(&self, policy: &AdaptationPolicy) -> ArbiterResult<()> {
        *write(&self.adaptation_policy)? = Some(policy.clone());
        Ok(())
    }
}

// ============================================================================
// CONFLICTS AND DECISIONS
// ============================================================================

#[async_trait]
impl ConflictRepository for MemoryStore {
    async fn conflict_save(&self, conflict: &Conflict) -> ArbiterResult<()> {
        self.check_fault("conflict_save")?;
        let mut conflicts = write(&self.conflicts)?;
        if let Some(existing) = conflicts.get(&conflict.conflict_id) {
            if existing != conflict {
                return Err(ArbiterError::Storage(StorageError::UpdateFailed {
                    entity_type: "conflict",
                    id: conflict.conflict_id.as_uuid(),
                    reason: "conflicts are immutable".to_string(),
                }));
            }
            return Ok(());
        }
        conflicts.insert(conflict.conflict_id, conflict.clone());
        Ok(())
    }

    async fn conflict_get(&self, id: ConflictId) -> ArbiterResult<Option<Conflict>> {
        Ok(read(&self.conflicts)?.get(&id).cloned())
    }
}

#[async_trait]
impl DecisionRepository for MemoryStore {
    async fn decision_save(&self, decision: &ArbitrationDecision) -> ArbiterResult<()> {
        self.check_fault("decision_save")?;
        write(&self.decisions)?.insert(decision.decision_id, decision.clone());
        Ok(())
    }

    async fn decision_get(&self, id: DecisionId) -> ArbiterResult<Option<ArbitrationDecision>> {
        Ok(read(&self.decisions)?.get(&id).cloned())
    }

    async fn decision_find_by_conflict(
        &self,
        conflict_id: ConflictId,
    ) -> ArbiterResult<Option<ArbitrationDecision>> {
        Ok(read(&self.decisions)?
            .values()
            .find(|d| d.conflict_id == conflict_id)
            .cloned())
    }

    async fn decision_list_pending_approval(&self) -> ArbiterResult<Vec<ArbitrationDecision>> {
        let mut pending: Vec<_> = read(&self.decisions)?
            .values()
            .filter(|d| d.requires_human_approval)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.decided_at.cmp(&b.decided_at));
        Ok(pending)
    }

    async fn decision_mark_executed(&self, id: DecisionId, at: Timestamp) -> ArbiterResult<bool> {
        self.check_fault("decision_mark_executed")?;
        let mut decisions = write(&self.decisions)?;
        let decision = decisions
            .get_mut(&id)
            .ok_or_else(|| not_found("decision", id.as_uuid()))?;
        decision.mark_executed(at)
    }
}

// ============================================================================
// ATTEMPTS AND LEARNING
// ============================================================================

#[async_trait]
impl AttemptRepository for MemoryStore {
    async fn attempt_insert(&self, attempt: &AutoAdaptationAttempt) -> ArbiterResult<()> {
        self.check_fault("attempt_insert")?;
        let mut attempts = write(&self.attempts)?;
        if attempts.contains_key(&attempt.attempt_id) {
            return Err(already_exists("attempt"));
        }
        attempts.insert(attempt.attempt_id, attempt.clone());
        Ok(())
    }

    async fn attempt_get(&self, id: AttemptId) -> ArbiterResult<Option<AutoAdaptationAttempt>> {
        Ok(read(&self.attempts)?.get(&id).cloned())
    }

    async fn attempt_update(&self, attempt: &AutoAdaptationAttempt) -> ArbiterResult<()> {
        self.check_fault("attempt_update")?;
        let mut attempts = write(&self.attempts)?;
        let slot = attempts
            .get_mut(&attempt.attempt_id)
            .ok_or_else(|| not_found("attempt", attempt.attempt_id.as_uuid()))?;
        *slot = attempt.clone();
        Ok(())
    }

    async fn attempt_delete(&self, id: AttemptId) -> ArbiterResult<()> {
        write(&self.attempts)?.remove(&id);
        Ok(())
    }

    async fn attempt_find_by_suggestion(
        &self,
        suggestion_id: SuggestionId,
    ) -> ArbiterResult<Option<AutoAdaptationAttempt>> {
        Ok(read(&self.attempts)?
            .values()
            .find(|a| a.suggestion_id == suggestion_id)
            .cloned())
    }

    async fn attempt_list_by_agent(
        &self,
        agent_name: &str,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>> {
        let mut list: Vec<_> = read(&self.attempts)?
            .values()
            .filter(|a| a.agent_name == agent_name)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.attempt_id.cmp(&b.attempt_id));
        Ok(list)
    }

    async fn attempt_list_by_result(
        &self,
        result: AttemptResult,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>> {
        let mut list: Vec<_> = read(&self.attempts)?
            .values()
            .filter(|a| a.result() == result)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.attempt_id.cmp(&b.attempt_id));
        Ok(list)
    }

    async fn attempt_list_by_rolled_back(
        &self,
        rolled_back: bool,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>> {
        let mut list: Vec<_> = read(&self.attempts)?
            .values()
            .filter(|a| a.rolled_back == rolled_back)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.attempt_id.cmp(&b.attempt_id));
        Ok(list)
    }

    async fn attempt_latest_active(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<AutoAdaptationAttempt>> {
        Ok(read(&self.attempts)?
            .values()
            .filter(|a| a.category == category && a.key == key && a.is_active())
            .max_by(|a, b| {
                a.attempted_at
                    .cmp(&b.attempted_at)
                    .then(a.attempt_id.cmp(&b.attempt_id))
            })
            .cloned())
    }

    async fn attempt_count_applied_since(&self, since: Timestamp) -> ArbiterResult<u32> {
        Ok(read(&self.attempts)?
            .values()
            .filter(|a| a.outcome == AttemptOutcome::Applied && a.attempted_at >= since)
            .count() as u32)
    }

    async fn feedback_insert(&self, feedback: &FeedbackSignal) -> ArbiterResult<()> {
        write(&self.feedback)?.push(feedback.clone());
        Ok(())
    }

    async fn feedback_list_by_agent(
        &self,
        agent_name: &str,
    ) -> ArbiterResult<Vec<FeedbackSignal>> {
        Ok(read(&self.feedback)?
            .iter()
            .filter(|f| f.agent_name == agent_name)
            .cloned()
            .collect())
    }

    async fn pattern_save(&self, pattern: &ObservedPattern) -> ArbiterResult<()> {
        write(&self.patterns)?.insert(pattern.pattern_id, pattern.clone());
        Ok(())
    }

    async fn pattern_list(&self) -> ArbiterResult<Vec<ObservedPattern>> {
        let mut list: Vec<_> = read(&self.patterns)?.values().cloned().collect();
        list.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
        Ok(list)
    }

    async fn suggestion_insert(&self, suggestion: &LearnedSuggestion) -> ArbiterResult<()> {
        let mut suggestions = write(&self.suggestions)?;
        if suggestions.contains_key(&suggestion.suggestion_id) {
            return Err(already_exists("suggestion"));
        }
        suggestions.insert(suggestion.suggestion_id, suggestion.clone());
        Ok(())
    }

    async fn suggestion_get(&self, id: SuggestionId) -> ArbiterResult<Option<LearnedSuggestion>> {
        Ok(read(&self.suggestions)?.get(&id).cloned())
    }

    async fn suggestion_list_pending(&self) -> ArbiterResult<Vec<LearnedSuggestion>> {
        let mut list: Vec<_> = read(&self.suggestions)?
            .values()
            .filter(|s| !s.processed)
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.suggestion_id.cmp(&b.suggestion_id))
        });
        Ok(list)
    }

    async fn suggestion_mark_processed(&self, id: SuggestionId) -> ArbiterResult<()> {
        let mut suggestions = write(&self.suggestions)?;
        let suggestion = suggestions
            .get_mut(&id)
            .ok_or_else(|| not_found("suggestion", id.as_uuid()))?;
        suggestion.processed = true;
        Ok(())
    }
}

// ============================================================================
// PREFERENCES
// ============================================================================

#[async_trait]
impl PreferenceRepository for MemoryStore {
    async fn preference_get(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<PreferenceState>> {
        Ok(read(&self.preferences)?
            .get(&PreferenceKey::new(category, key))
            .cloned())
    }

    async fn preference_upsert(&self, state: &PreferenceState) -> ArbiterResult<()> {
        self.check_fault("preference_upsert")?;
        write(&self.preferences)?.insert(state.preference_key(), state.clone());
        Ok(())
    }

    async fn preference_reset(&self, category: &str, key: &str) -> ArbiterResult<()> {
        write(&self.preferences)?.remove(&PreferenceKey::new(category, key));
        Ok(())
    }

    async fn preference_append_change(
        &self,
        record: &PreferenceChangeRecord,
    ) -> ArbiterResult<()> {
        self.check_fault("preference_append_change")?;
        write(&self.history)?.push(record.clone());
        Ok(())
    }

    async fn preference_history(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Vec<PreferenceChangeRecord>> {
        let mut records: Vec<_> = read(&self.history)?
            .iter()
            .filter(|r| r.category == category && r.key == key)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.changed_at
                .cmp(&a.changed_at)
                .then(b.record_id.cmp(&a.record_id))
        });
        Ok(records)
    }

    async fn preference_last_change(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<PreferenceChangeRecord>> {
        Ok(self
            .preference_history(category, key)
            .await?
            .into_iter()
            .next())
    }
}

// ============================================================================
// AUDIT AND JOURNAL
// ============================================================================

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn audit_append(&self, draft: AuditDraft) -> ArbiterResult<AuditEntry> {
        self.check_fault("audit_append")?;
        let mut audit = write(&self.audit)?;
        let entry = AuditEntry::seal(draft, audit.last());
        audit.push(entry.clone());
        Ok(entry)
    }

    async fn audit_list(&self) -> ArbiterResult<Vec<AuditEntry>> {
        Ok(read(&self.audit)?.clone())
    }

    async fn audit_find_by_subject(&self, subject_id: Uuid) -> ArbiterResult<Vec<AuditEntry>> {
        Ok(read(&self.audit)?
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DecisionJournalRepository for MemoryStore {
    async fn journal_record(&self, intent: &DecisionIntent) -> ArbiterResult<()> {
        self.check_fault("journal_record")?;
        write(&self.journal)?.insert(intent.decision_id(), intent.clone());
        Ok(())
    }

    async fn journal_mark_committed(&self, decision_id: DecisionId) -> ArbiterResult<()> {
        self.check_fault("journal_mark_committed")?;
        let mut journal = write(&self.journal)?;
        let intent = journal
            .get_mut(&decision_id)
            .ok_or_else(|| not_found("decision_intent", decision_id.as_uuid()))?;
        intent.committed = true;
        Ok(())
    }

    async fn journal_list_uncommitted(&self) -> ArbiterResult<Vec<DecisionIntent>> {
        let mut list: Vec<_> = read(&self.journal)?
            .values()
            .filter(|i| !i.committed)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(list)
    }

    async fn execution_record(
        &self,
        decision_id: DecisionId,
        proposal_id: ProposalId,
        now: Timestamp,
    ) -> ArbiterResult<ExecutionIntent> {
        self.check_fault("execution_record")?;
        let mut executions = write(&self.executions)?;
        let intent = executions.entry(decision_id).or_insert(ExecutionIntent {
            decision_id,
            proposal_id,
            applied: false,
            completed: false,
            recorded_at: now,
        });
        Ok(*intent)
    }

    async fn execution_mark_applied(&self, decision_id: DecisionId) -> ArbiterResult<()> {
        self.check_fault("execution_mark_applied")?;
        let mut executions = write(&self.executions)?;
        let intent = executions
            .get_mut(&decision_id)
            .ok_or_else(|| not_found("execution_intent", decision_id.as_uuid()))?;
        intent.applied = true;
        Ok(())
    }

    async fn execution_mark_completed(&self, decision_id: DecisionId) -> ArbiterResult<()> {
        self.check_fault("execution_mark_completed")?;
        let mut executions = write(&self.executions)?;
        let intent = executions
            .get_mut(&decision_id)
            .ok_or_else(|| not_found("execution_intent", decision_id.as_uuid()))?;
        intent.completed = true;
        Ok(())
    }

    async fn execution_list_incomplete(&self) -> ArbiterResult<Vec<ExecutionIntent>> {
        let mut list: Vec<_> = read(&self.executions)?
            .values()
            .filter(|i| !i.completed)
            .copied()
            .collect();
        list.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then(a.decision_id.cmp(&b.decision_id))
        });
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{AuditKind, ChangeSource, NewProposal, PreferenceValue, ProposedAction};
    use chrono::{Duration, Utc};

    fn proposal(agent: &str) -> Proposal {
        let action = ProposedAction::apply_preference("coaching", "tone", "direct".into(), None)
            .unwrap();
        Proposal::new(NewProposal::new(agent, action).with_confidence(0.9), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_proposal_insert_and_duplicate() {
        let store = MemoryStore::new();
        let p = proposal("coach");
        store.proposal_insert(&p).await.unwrap();
        let err = store.proposal_insert(&p).await.unwrap_err();
        assert!(matches!(err, ArbiterError::Storage(StorageError::InsertFailed { .. })));
        assert_eq!(store.proposal_get(p.proposal_id).await.unwrap(), Some(p));
    }

    #[tokio::test]
    async fn test_update_missing_proposal_is_not_found() {
        let store = MemoryStore::new();
        let err = store.proposal_update(&proposal("coach")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pending_for_target_filters_status() {
        let store = MemoryStore::new();
        let a = proposal("coach");
        let mut b = proposal("logger");
        b.status = ProposalStatus::Suppressed;
        store.proposal_insert(&a).await.unwrap();
        store.proposal_insert(&b).await.unwrap();
        let pending = store.proposal_list_pending_for_target(&a.target).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].proposal_id, a.proposal_id);
    }

    #[tokio::test]
    async fn test_injected_fault_is_transient_and_one_shot() {
        let store = MemoryStore::new();
        store.fail_next("proposal_insert", 1);
        let err = store.proposal_insert(&proposal("coach")).await.unwrap_err();
        assert!(err.is_transient());
        store.proposal_insert(&proposal("coach")).await.unwrap();
    }

    #[tokio::test]
    async fn test_history_is_most_recent_first() {
        let store = MemoryStore::new();
        let key = PreferenceKey::new("coaching", "tone");
        let now = Utc::now();
        for (i, value) in ["gentle", "direct", "playful"].iter().enumerate() {
            let record = PreferenceChangeRecord::new(
                "coach",
                &key,
                None,
                PreferenceValue::from(*value),
                ChangeSource::User,
                "set",
                now + Duration::seconds(i as i64),
            );
            store.preference_append_change(&record).await.unwrap();
        }
        let history = store.preference_history("coaching", "tone").await.unwrap();
        assert_eq!(history[0].new_value, "playful".into());
        assert_eq!(
            store
                .preference_last_change("coaching", "tone")
                .await
                .unwrap()
                .map(|r| r.new_value),
            Some("playful".into())
        );
    }

    #[tokio::test]
    async fn test_execution_record_keeps_first_intent() {
        let store = MemoryStore::new();
        let decision_id = DecisionId::now_v7();
        let proposal_id = ProposalId::now_v7();
        let now = Utc::now();
        store.execution_record(decision_id, proposal_id, now).await.unwrap();
        store.execution_mark_applied(decision_id).await.unwrap();

        let again = store
            .execution_record(decision_id, proposal_id, now + Duration::seconds(5))
            .await
            .unwrap();
        assert!(again.applied);
        assert_eq!(again.recorded_at, now);
        assert_eq!(store.execution_list_incomplete().await.unwrap(), vec![again]);

        store.execution_mark_completed(decision_id).await.unwrap();
        assert!(store.execution_list_incomplete().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_append_chains_entries() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            let draft = AuditDraft::new(
                AuditKind::DecisionRecorded,
                Uuid::now_v7(),
                "recorded",
                serde_json::json!({}),
                Utc::now(),
            );
            store.audit_append(draft).await.unwrap();
        }
        let entries = store.audit_list().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(arbiter_core::verify_chain(&entries).is_ok());
        store.tamper_audit_entry(1, "forged").unwrap();
        assert!(arbiter_core::verify_chain(&store.audit_list().await.unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_policy_lookup_by_subject() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let agent = ArbitrationPolicy::new(
            "coach rules",
            PolicySubject::Agent {
                agent_name: "coach".to_string(),
            },
            arbiter_core::ResolutionStrategy::Weighted,
            now,
        )
        .unwrap();
        store.policy_insert(&agent).await.unwrap();
        assert!(store.policy_find_default().await.unwrap().is_none());
        assert_eq!(
            store.policy_find_for_agent("coach").await.unwrap().map(|p| p.policy_id),
            Some(agent.policy_id)
        );
        assert!(store.policy_find_for_agent("logger").await.unwrap().is_none());
    }
}
