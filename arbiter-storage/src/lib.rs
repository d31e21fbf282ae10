//! ARBITER Storage - Repository Traits and In-Memory Test Double
//!
//! Persistence is an external collaborator. The core talks to it only through
//! the async repository traits below; `MemoryStore` implements all of them for
//! tests and local tooling and is not meant for production use.

pub mod memory;

pub use memory::MemoryStore;

use ::async_trait::async_trait;
use arbiter_core::{
    AdaptationPolicy, ArbiterResult, ArbitrationDecision, ArbitrationPolicy, AttemptId,
    AttemptResult, AuditDraft, AuditEntry, AutoAdaptationAttempt, Conflict, ConflictId,
    DecisionId, FeedbackSignal, LearnedSuggestion, ObservedPattern, PolicyId,
    PreferenceChangeRecord, PreferenceState, Proposal, ProposalId, ProposalStatus,
    SuggestionId, TargetRef, Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// JOURNAL TYPES
// ============================================================================

/// Status change a decision commit applies to one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTransition {
    pub proposal_id: ProposalId,
    pub status: ProposalStatus,
}

/// Everything one decision commit writes, recorded before the first write so
/// an interrupted commit can be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionIntent {
    pub decision: ArbitrationDecision,
    pub conflict: Conflict,
    pub transitions: Vec<ProposalTransition>,
    pub audit: AuditDraft,
    pub committed: bool,
    pub recorded_at: Timestamp,
}

impl DecisionIntent {
    pub fn decision_id(&self) -> DecisionId {
        self.decision.decision_id
    }
}

/// Progress of one decision execution. Recorded before the effect is
/// applied and completed after the decision is flagged executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub decision_id: DecisionId,
    pub proposal_id: ProposalId,
    /// The effect has been applied.
    pub applied: bool,
    pub completed: bool,
    pub recorded_at: Timestamp,
}

// ============================================================================
// REPOSITORIES
// ============================================================================

#[async_trait]
pub trait ProposalRepository: Send + Sync {
    /// Insert a new proposal. Fails if the id already exists.
    async fn proposal_insert(&self, proposal: &Proposal) -> ArbiterResult<()>;

    async fn proposal_get(&self, id: ProposalId) -> ArbiterResult<Option<Proposal>>;

    /// Replace a stored proposal.
    async fn proposal_update(&self, proposal: &Proposal) -> ArbiterResult<()>;

    /// Pending proposals ordered by creation time.
    async fn proposal_list_pending(&self) -> ArbiterResult<Vec<Proposal>>;

    async fn proposal_list_pending_for_target(
        &self,
        target: &TargetRef,
    ) -> ArbiterResult<Vec<Proposal>>;

    async fn proposal_list_by_agent(&self, agent_name: &str) -> ArbiterResult<Vec<Proposal>>;

    async fn proposal_list_by_status(&self, status: ProposalStatus)
        -> ArbiterResult<Vec<Proposal>>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    async fn policy_insert(&self, policy: &ArbitrationPolicy) -> ArbiterResult<()>;

    async fn policy_get(&self, id: PolicyId) -> ArbiterResult<Option<ArbitrationPolicy>>;

    /// Most recently created default-scope policy.
    async fn policy_find_default(&self) -> ArbiterResult<Option<ArbitrationPolicy>>;

    async fn policy_find_for_agent(
        &self,
        agent_name: &str,
    ) -> ArbiterResult<Option<ArbitrationPolicy>>;

    async fn policy_find_for_preference(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<ArbitrationPolicy>>;

    async fn adaptation_policy_get(&self) -> ArbiterResult<Option<AdaptationPolicy>>;

    async fn adaptation_policy_save(&self, policy: &AdaptationPolicy) -> ArbiterResult<()>;
}

#[async_trait]
pub trait ConflictRepository: Send + Sync {
    /// Insert or overwrite with identical content (replay-safe).
    async fn conflict_save(&self, conflict: &Conflict) -> ArbiterResult<()>;

    async fn conflict_get(&self, id: ConflictId) -> ArbiterResult<Option<Conflict>>;
}

#[async_trait]
pub trait DecisionRepository: Send + Sync {
    /// Insert or replace a decision (replay-safe).
    async fn decision_save(&self, decision: &ArbitrationDecision) -> ArbiterResult<()>;

    async fn decision_get(&self, id: DecisionId) -> ArbiterResult<Option<ArbitrationDecision>>;

    async fn decision_find_by_conflict(
        &self,
        conflict_id: ConflictId,
    ) -> ArbiterResult<Option<ArbitrationDecision>>;

    async fn decision_list_pending_approval(&self) -> ArbiterResult<Vec<ArbitrationDecision>>;

    /// Atomically flip `executed`. Returns `false` when it already was.
    async fn decision_mark_executed(&self, id: DecisionId, at: Timestamp) -> ArbiterResult<bool>;
}

#[async_trait]
pub trait AttemptRepository: Send + Sync {
    async fn attempt_insert(&self, attempt: &AutoAdaptationAttempt) -> ArbiterResult<()>;

    async fn attempt_get(&self, id: AttemptId) -> ArbiterResult<Option<AutoAdaptationAttempt>>;

    async fn attempt_update(&self, attempt: &AutoAdaptationAttempt) -> ArbiterResult<()>;

    /// Drop an attempt whose write was aborted. Missing ids are ignored.
    async fn attempt_delete(&self, id: AttemptId) -> ArbiterResult<()>;

    async fn attempt_find_by_suggestion(
        &self,
        suggestion_id: SuggestionId,
    ) -> ArbiterResult<Option<AutoAdaptationAttempt>>;

    async fn attempt_list_by_agent(
        &self,
        agent_name: &str,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>>;

    async fn attempt_list_by_result(
        &self,
        result: AttemptResult,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>>;

    async fn attempt_list_by_rolled_back(
        &self,
        rolled_back: bool,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>>;

    /// Most recent applied, not rolled back attempt for a preference.
    async fn attempt_latest_active(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<AutoAdaptationAttempt>>;

    /// Applied attempts at or after `since`, rolled back ones included.
    async fn attempt_count_applied_since(&self, since: Timestamp) -> ArbiterResult<u32>;

    async fn feedback_insert(&self, feedback: &FeedbackSignal) -> ArbiterResult<()>;

    async fn feedback_list_by_agent(&self, agent_name: &str)
        -> ArbiterResult<Vec<FeedbackSignal>>;

    /// Insert or replace by pattern id.
    async fn pattern_save(&self, pattern: &ObservedPattern) -> ArbiterResult<()>;

    async fn pattern_list(&self) -> ArbiterResult<Vec<ObservedPattern>>;

    async fn suggestion_insert(&self, suggestion: &LearnedSuggestion) -> ArbiterResult<()>;

    async fn suggestion_get(&self, id: SuggestionId) -> ArbiterResult<Option<LearnedSuggestion>>;

    /// Unprocessed suggestions in creation order.
    async fn suggestion_list_pending(&self) -> ArbiterResult<Vec<LearnedSuggestion>>;

    async fn suggestion_mark_processed(&self, id: SuggestionId) -> ArbiterResult<()>;
}

#[async_trait]
pub trait PreferenceRepository: Send + Sync {
    async fn preference_get(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<PreferenceState>>;

    async fn preference_upsert(&self, state: &PreferenceState) -> ArbiterResult<()>;

    /// Remove a stored value so reads fall back to the registry default.
    async fn preference_reset(&self, category: &str, key: &str) -> ArbiterResult<()>;

    async fn preference_append_change(&self, record: &PreferenceChangeRecord)
        -> ArbiterResult<()>;

    /// Change history, most recent first.
    async fn preference_history(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Vec<PreferenceChangeRecord>>;

    async fn preference_last_change(
        &self,
        category: &str,
        key: &str,
    ) -> ArbiterResult<Option<PreferenceChangeRecord>>;
}

#[async_trait]
pub trait AuditRepository: Send + Sync {
    /// Seal the draft after the current last entry and store it.
    async fn audit_append(&self, draft: AuditDraft) -> ArbiterResult<AuditEntry>;

    /// Whole ledger in sequence order.
    async fn audit_list(&self) -> ArbiterResult<Vec<AuditEntry>>;

    async fn audit_find_by_subject(&self, subject_id: Uuid) -> ArbiterResult<Vec<AuditEntry>>;
}

#[async_trait]
pub trait DecisionJournalRepository: Send + Sync {
    /// Record or overwrite an intent keyed by decision id.
    async fn journal_record(&self, intent: &DecisionIntent) -> ArbiterResult<()>;

    async fn journal_mark_committed(&self, decision_id: DecisionId) -> ArbiterResult<()>;

    async fn journal_list_uncommitted(&self) -> ArbiterResult<Vec<DecisionIntent>>;

    /// Record an execution intent unless one exists for the decision, and
    /// return the stored intent.
    async fn execution_record(
        &self,
        decision_id: DecisionId,
        proposal_id: ProposalId,
        now: Timestamp,
    ) -> ArbiterResult<ExecutionIntent>;

    async fn execution_mark_applied(&self, decision_id: DecisionId) -> ArbiterResult<()>;

    async fn execution_mark_completed(&self, decision_id: DecisionId) -> ArbiterResult<()>;

    /// Executions started but not completed, oldest first.
    async fn execution_list_incomplete(&self) -> ArbiterResult<Vec<ExecutionIntent>>;
}

/// Every repository the core needs, as one object.
pub trait ArbiterStore:
    ProposalRepository
    + PolicyRepository
    + ConflictRepository
    + DecisionRepository
    + AttemptRepository
    + PreferenceRepository
    + AuditRepository
    + DecisionJournalRepository
{
}

impl<T> ArbiterStore for T where
    T: ProposalRepository
        + PolicyRepository
        + ConflictRepository
        + DecisionRepository
        + AttemptRepository
        + PreferenceRepository
        + AuditRepository
        + DecisionJournalRepository
{
}
