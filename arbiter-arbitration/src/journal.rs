//! Decision journal
//!
//! A decision commit touches several records: the conflict, the decision,
//! every proposal status and an audit entry. The intent describing all of
//! them is recorded first, each step is idempotent, and the intent is marked
//! committed last. `replay_uncommitted` re-drives anything interrupted.

use crate::retry::with_retry;
use arbiter_core::{
    ArbiterError, ArbiterResult, ArbitrationDecision, AuditKind, Conflict, DecisionId,
    DecisionOutcome, ProposalStatus, RetryConfig, Timestamp,
};
use arbiter_events::AuditTrail;
use arbiter_storage::{ArbiterStore, DecisionIntent, ProposalTransition};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DecisionJournal<S> {
    store: Arc<S>,
    audit: AuditTrail,
    retry: RetryConfig,
}

impl<S: ArbiterStore + 'static> DecisionJournal<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            audit,
            retry,
        }
    }

    /// Proposal transitions implied by a decision.
    ///
    /// An escalated decision parks its non-vetoed proposals as pending;
    /// otherwise the winner wins and every suppressed proposal takes the
    /// status of its reason.
    pub fn transitions_for(
        decision: &ArbitrationDecision,
        conflict: &Conflict,
    ) -> Vec<ProposalTransition> {
        let mut statuses: BTreeMap<_, ProposalStatus> = BTreeMap::new();
        for suppression in &decision.suppressions {
            statuses.insert(suppression.proposal_id, suppression.reason.proposal_status());
        }
        if decision.outcome == DecisionOutcome::Escalated {
            for id in &conflict.proposal_ids {
                statuses.entry(*id).or_insert(ProposalStatus::Pending);
            }
        } else if let Some(winner) = decision.winning_proposal_id {
            statuses.insert(winner, ProposalStatus::Won);
        }
        statuses
            .into_iter()
            .map(|(proposal_id, status)| ProposalTransition {
                proposal_id,
                status,
            })
            .collect()
    }

    /// Build the intent for committing `decision`.
    pub fn intent_for(
        decision: &ArbitrationDecision,
        conflict: &Conflict,
        kind: AuditKind,
        now: Timestamp,
    ) -> ArbiterResult<DecisionIntent> {
        let summary = match kind {
            AuditKind::EscalationResolved => format!(
                "escalation on {} resolved: {}",
                conflict.target, decision.outcome
            ),
            _ => format!(
                "{} on {}: {}",
                decision.outcome, conflict.target, decision.reasoning_summary
            ),
        };
        let payload = json!({
            "conflict_id": conflict.conflict_id,
            "conflict_type": conflict.conflict_type,
            "policy_id": decision.policy_id,
            "outcome": decision.outcome,
            "strategy": decision.strategy_used,
            "winning_proposal_id": decision.winning_proposal_id,
            "suppressed": decision.suppressed_proposal_ids,
            "vetoed": decision.vetoed_proposal_ids,
            "escalation": decision.escalation,
            "human_resolution": decision.human_resolution,
        });
        let audit = AuditTrail::draft(kind, decision.decision_id, summary, &payload, now)?;
        Ok(DecisionIntent {
            decision: decision.clone(),
            conflict: conflict.clone(),
            transitions: Self::transitions_for(decision, conflict),
            audit,
            committed: false,
            recorded_at: now,
        })
    }

    /// Record the intent, then apply it.
    pub async fn commit(&self, intent: &DecisionIntent) -> ArbiterResult<()> {
        with_retry(&self.retry, "journal_record", || self.store.journal_record(intent)).await?;
        self.apply(intent).await
    }

    async fn apply(&self, intent: &DecisionIntent) -> ArbiterResult<()> {
        let decision_id = intent.decision_id();
        with_retry(&self.retry, "conflict_save", || {
            self.store.conflict_save(&intent.conflict)
        })
        .await?;
        with_retry(&self.retry, "decision_save", || {
            self.store.decision_save(&intent.decision)
        })
        .await?;
        for transition in &intent.transitions {
            with_retry(&self.retry, "proposal_update", || {
                self.apply_transition(*transition, decision_id, intent.recorded_at)
            })
            .await?;
        }
        with_retry(&self.retry, "audit_append", || {
            self.audit.append_once(intent.audit.clone())
        })
        .await?;
        with_retry(&self.retry, "journal_mark_committed", || {
            self.store.journal_mark_committed(decision_id)
        })
        .await?;
        debug!(
            decision_id = %decision_id,
            transitions = intent.transitions.len(),
            "Decision committed"
        );
        Ok(())
    }

    /// Apply one transition unless it already took effect.
    async fn apply_transition(
        &self,
        transition: ProposalTransition,
        decision_id: DecisionId,
        at: Timestamp,
    ) -> ArbiterResult<()> {
        let mut proposal = self
            .store
            .proposal_get(transition.proposal_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("proposal", transition.proposal_id))?;

        if proposal.decision_id == Some(decision_id) && proposal.status == transition.status {
            return Ok(());
        }
        if transition.status == ProposalStatus::Pending {
            proposal.attach_decision(decision_id)?;
        } else {
            proposal.transition(transition.status, decision_id, at)?;
        }
        self.store.proposal_update(&proposal).await
    }

    /// Re-drive every intent not marked committed. Returns how many were
    /// completed.
    pub async fn replay_uncommitted(&self) -> ArbiterResult<usize> {
        let pending = self.store.journal_list_uncommitted().await?;
        for intent in &pending {
            info!(decision_id = %intent.decision_id(), "Replaying interrupted decision commit");
            self.apply(intent).await?;
        }
        Ok(pending.len())
    }
}

impl<S> std::fmt::Debug for DecisionJournal<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionJournal")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ArbitrationEngine;
    use arbiter_core::{
        ArbitrationPolicy, ConflictType, NewProposal, PolicySubject, Proposal, ProposedAction,
        ResolutionStrategy,
    };
    use arbiter_storage::{
        AuditRepository, DecisionJournalRepository, DecisionRepository, MemoryStore,
        ProposalRepository,
    };
    use chrono::Utc;

    fn no_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        }
    }

    async fn setup(store: &MemoryStore) -> (Conflict, ArbitrationDecision) {
        let now = Utc::now();
        let mut proposals = Vec::new();
        for (agent, priority) in [("coach", 1), ("scheduler", 4)] {
            let action = ProposedAction::send_nudge("push", format!("from {}", agent)).unwrap();
            let p = Proposal::new(
                NewProposal::new(agent, action)
                    .with_confidence(0.7)
                    .with_priority(priority),
                now,
            )
            .unwrap();
            store.proposal_insert(&p).await.unwrap();
            proposals.push(p);
        }
        let conflict = Conflict::new(
            proposals[0].target.clone(),
            proposals.iter().map(|p| p.proposal_id),
            Some(ConflictType::SameTarget),
            now,
        )
        .unwrap();
        let policy = ArbitrationPolicy::new(
            "p",
            PolicySubject::Default,
            ResolutionStrategy::Priority,
            now,
        )
        .unwrap();
        let decision = ArbitrationEngine::arbitrate(&conflict, &proposals, &policy, now).unwrap();
        (conflict, decision)
    }

    fn recorded(decision: &ArbitrationDecision, conflict: &Conflict) -> DecisionIntent {
        DecisionJournal::<MemoryStore>::intent_for(
            decision,
            conflict,
            AuditKind::DecisionRecorded,
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_applies_every_step() {
        let store = MemoryStore::new();
        let journal = DecisionJournal::new(Arc::new(store.clone()), no_retry());
        let (conflict, decision) = setup(&store).await;
        let intent = recorded(&decision, &conflict);
        journal.commit(&intent).await.unwrap();

        let winner = decision.winning_proposal_id.unwrap();
        let stored = store.proposal_get(winner).await.unwrap().unwrap();
        assert_eq!(stored.status, ProposalStatus::Won);
        assert_eq!(stored.decision_id, Some(decision.decision_id));
        assert!(store.decision_get(decision.decision_id).await.unwrap().is_some());
        assert_eq!(store.audit_list().await.unwrap().len(), 1);
        assert!(store.journal_list_uncommitted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_commit_is_replayed_once() {
        let store = MemoryStore::new();
        let journal = DecisionJournal::new(Arc::new(store.clone()), no_retry());
        let (conflict, decision) = setup(&store).await;
        let intent = recorded(&decision, &conflict);

        store.fail_next("audit_append", 1);
        assert!(journal.commit(&intent).await.is_err());
        assert_eq!(store.journal_list_uncommitted().await.unwrap().len(), 1);

        assert_eq!(journal.replay_uncommitted().await.unwrap(), 1);
        assert_eq!(journal.replay_uncommitted().await.unwrap(), 0);
        assert_eq!(store.audit_list().await.unwrap().len(), 1);
        let suppressed = decision.suppressed_proposal_ids[0];
        assert_eq!(
            store.proposal_get(suppressed).await.unwrap().unwrap().status,
            ProposalStatus::Suppressed
        );
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = MemoryStore::new();
        let retry = RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
            backoff_multiplier: 1.0,
        };
        let journal = DecisionJournal::new(Arc::new(store.clone()), retry);
        let (conflict, decision) = setup(&store).await;
        let intent = recorded(&decision, &conflict);
        store.fail_next("decision_save", 2);
        journal.commit(&intent).await.unwrap();
        assert!(store.journal_list_uncommitted().await.unwrap().is_empty());
    }
}
