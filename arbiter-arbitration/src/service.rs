//! Arbitration service
//!
//! Ties intake, detection, policy resolution, the engine, the journal and
//! the execution gate together. Work on one target is serialized by an
//! advisory async lock; different targets never wait on each other.

use crate::detector::ConflictDetector;
use crate::engine::ArbitrationEngine;
use crate::gate::{EffectApplier, ExecutionGate, ExecutionOutcome};
use crate::journal::DecisionJournal;
use crate::resolver::PolicyResolver;
use arbiter_core::{
    ArbiterError, ArbiterResult, ArbitrationDecision, ArbitrationPolicy, AuditKind, Conflict,
    DecisionId, DomainEvent, NewProposal, PolicyId, Proposal, ProposalId, ProposedAction,
    RetryConfig, Suppression, TargetRef, Timestamp,
};
use arbiter_events::{AuditTrail, EventDispatcher};
use arbiter_storage::ArbiterStore;
use arbiter_telemetry::ObservabilityContext;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Supplies confidence for proposals submitted without one.
#[async_trait]
pub trait ConfidenceScorer: Send + Sync {
    async fn score(&self, proposal: &Proposal) -> ArbiterResult<f64>;
}

pub struct ArbitrationService<S> {
    store: Arc<S>,
    resolver: PolicyResolver,
    journal: DecisionJournal<S>,
    gate: ExecutionGate<S>,
    audit: AuditTrail,
    dispatcher: Arc<EventDispatcher>,
    observability: ObservabilityContext,
    scorer: Option<Arc<dyn ConfidenceScorer>>,
    target_locks: DashMap<TargetRef, Arc<Mutex<()>>>,
}

impl<S: ArbiterStore + 'static> ArbitrationService<S> {
    pub fn new(
        store: Arc<S>,
        applier: Arc<dyn EffectApplier>,
        dispatcher: Arc<EventDispatcher>,
        observability: ObservabilityContext,
        retry: RetryConfig,
    ) -> Self {
        Self {
            resolver: PolicyResolver::new(store.clone()),
            journal: DecisionJournal::new(store.clone(), retry.clone()),
            gate: ExecutionGate::new(
                store.clone(),
                applier,
                dispatcher.clone(),
                observability.clone(),
                retry,
            ),
            audit: AuditTrail::new(store.clone()),
            store,
            dispatcher,
            observability,
            scorer: None,
            target_locks: DashMap::new(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ConfidenceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    fn lock_for(&self, target: &TargetRef) -> Arc<Mutex<()>> {
        self.target_locks.entry(target.clone()).or_default().clone()
    }

    pub async fn register_policy(&self, policy: &ArbitrationPolicy) -> ArbiterResult<PolicyId> {
        policy.validate()?;
        self.store.policy_insert(policy).await?;
        info!(
            policy_id = %policy.policy_id,
            name = %policy.name,
            strategy = %policy.resolution_strategy,
            "Arbitration policy registered"
        );
        Ok(policy.policy_id)
    }

    // ------------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------------

    /// Validate and store a proposal, scoring it first when it arrives
    /// without a confidence and a scorer is configured.
    pub async fn submit(&self, input: NewProposal, now: Timestamp) -> ArbiterResult<Proposal> {
        let mut proposal = Proposal::new(input, now)?;
        let lock = self.lock_for(&proposal.target);
        let _guard = lock.lock().await;

        if !proposal.is_scored() {
            self.try_score(&mut proposal).await;
        }
        // Snapshot the value the change would replace when the agent did not.
        if let ProposedAction::ApplyPreference {
            category,
            key,
            current_value,
            ..
        } = &mut proposal.action
        {
            if current_value.is_none() {
                *current_value = self
                    .store
                    .preference_get(category, key)
                    .await?
                    .map(|state| state.value);
            }
        }
        self.store.proposal_insert(&proposal).await?;
        debug!(
            proposal_id = %proposal.proposal_id,
            agent = %proposal.agent_name,
            target = %proposal.target,
            scored = proposal.is_scored(),
            "Proposal submitted"
        );
        Ok(proposal)
    }

    /// Score pending proposals that are still missing a confidence.
    /// Returns how many were scored.
    pub async fn score_pending(&self) -> ArbiterResult<usize> {
        if self.scorer.is_none() {
            return Ok(0);
        }
        let mut scored = 0;
        for pending in self.store.proposal_list_pending().await? {
            if pending.is_scored() {
                continue;
            }
            let lock = self.lock_for(&pending.target);
            let _guard = lock.lock().await;
            let Some(mut proposal) = self.store.proposal_get(pending.proposal_id).await? else {
                continue;
            };
            if proposal.is_scored() || !self.try_score(&mut proposal).await {
                continue;
            }
            self.store.proposal_update(&proposal).await?;
            scored += 1;
        }
        Ok(scored)
    }

    /// A scorer failure leaves the proposal unscored, and so ineligible.
    async fn try_score(&self, proposal: &mut Proposal) -> bool {
        let Some(scorer) = &self.scorer else {
            return false;
        };
        let result = match scorer.score(proposal).await {
            Ok(confidence) => proposal.set_confidence(confidence),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    proposal_id = %proposal.proposal_id,
                    error = %e,
                    "Confidence scoring failed, proposal stays unscored"
                );
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Arbitration
    // ------------------------------------------------------------------------

    /// Detect and arbitrate the eligible proposals on one target.
    ///
    /// `None` when nothing on the target is eligible.
    pub async fn process_target(
        &self,
        target: &TargetRef,
        now: Timestamp,
    ) -> ArbiterResult<Option<ArbitrationDecision>> {
        let lock = self.lock_for(target);
        let _guard = lock.lock().await;

        let pending = self.store.proposal_list_pending_for_target(target).await?;
        let Some(group) = ConflictDetector::group_by_target(pending).remove(target) else {
            return Ok(None);
        };

        let policy = self.resolver.resolve(target, &group).await?;
        let detected = ConflictDetector::detect(group, &policy, now)?;
        self.observability
            .metrics
            .record_conflict_detected(detected.conflict.conflict_type);

        let decision =
            ArbitrationEngine::arbitrate(&detected.conflict, &detected.proposals, &policy, now)?;
        let intent = DecisionJournal::<S>::intent_for(
            &decision,
            &detected.conflict,
            AuditKind::DecisionRecorded,
            now,
        )?;
        self.journal.commit(&intent).await?;

        info!(
            decision_id = %decision.decision_id,
            conflict_id = %detected.conflict.conflict_id,
            target = %target,
            policy = %policy.name,
            outcome = %decision.outcome,
            proposals = detected.proposals.len(),
            "Arbitration decided"
        );
        self.announce(
            &decision,
            &detected.conflict,
            &agent_names(&detected.proposals),
            &decision.suppressions,
            now,
        );
        Ok(Some(decision))
    }

    /// Arbitrate every target with eligible proposals, in target order.
    pub async fn process_pending(&self, now: Timestamp) -> ArbiterResult<Vec<ArbitrationDecision>> {
        let pending = self.store.proposal_list_pending().await?;
        let targets: Vec<TargetRef> = ConflictDetector::group_by_target(pending)
            .into_keys()
            .collect();

        let mut decisions = Vec::with_capacity(targets.len());
        for target in &targets {
            if let Some(decision) = self.process_target(target, now).await? {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    /// Apply the winner of a decision through the execution gate.
    pub async fn execute(
        &self,
        decision_id: DecisionId,
        now: Timestamp,
    ) -> ArbiterResult<ExecutionOutcome> {
        let (_, conflict) = self.load(decision_id).await?;
        let lock = self.lock_for(&conflict.target);
        let _guard = lock.lock().await;
        self.gate.execute(decision_id, now).await
    }

    // ------------------------------------------------------------------------
    // Human approval
    // ------------------------------------------------------------------------

    pub async fn pending_approvals(&self) -> ArbiterResult<Vec<ArbitrationDecision>> {
        self.store.decision_list_pending_approval().await
    }

    /// Close an escalation by approving one of its proposals.
    pub async fn approve_escalation(
        &self,
        decision_id: DecisionId,
        proposal_id: ProposalId,
        approver: &str,
        note: Option<String>,
        now: Timestamp,
    ) -> ArbiterResult<ArbitrationDecision> {
        self.resolve_escalation(decision_id, approver, now, |decision, conflict| {
            decision.approve(proposal_id, &conflict.proposal_ids, approver, note, now)
        })
        .await
    }

    /// Close an escalation by vetoing every proposal in it.
    pub async fn reject_escalation(
        &self,
        decision_id: DecisionId,
        approver: &str,
        note: Option<String>,
        now: Timestamp,
    ) -> ArbiterResult<ArbitrationDecision> {
        self.resolve_escalation(decision_id, approver, now, |decision, conflict| {
            decision.reject(&conflict.proposal_ids, approver, note, now)
        })
        .await
    }

    async fn resolve_escalation<F>(
        &self,
        decision_id: DecisionId,
        approver: &str,
        now: Timestamp,
        resolve: F,
    ) -> ArbiterResult<ArbitrationDecision>
    where
        F: FnOnce(&mut ArbitrationDecision, &Conflict) -> ArbiterResult<()>,
    {
        let (_, conflict) = self.load(decision_id).await?;
        let lock = self.lock_for(&conflict.target);
        let _guard = lock.lock().await;

        // Reload under the lock; another caller may have resolved it.
        let (mut decision, conflict) = self.load(decision_id).await?;
        let already_suppressed = decision.suppressions.len();
        resolve(&mut decision, &conflict)?;

        let intent = DecisionJournal::<S>::intent_for(
            &decision,
            &conflict,
            AuditKind::EscalationResolved,
            now,
        )?;
        self.journal.commit(&intent).await?;

        let mut proposals = Vec::with_capacity(conflict.proposal_ids.len());
        for id in &conflict.proposal_ids {
            if let Some(p) = self.store.proposal_get(*id).await? {
                proposals.push(p);
            }
        }
        info!(
            decision_id = %decision_id,
            approver,
            outcome = %decision.outcome,
            winner = ?decision.winning_proposal_id,
            "Escalation resolved"
        );
        self.announce(
            &decision,
            &conflict,
            &agent_names(&proposals),
            &decision.suppressions[already_suppressed..],
            now,
        );
        Ok(decision)
    }

    // ------------------------------------------------------------------------
    // Recovery and explanation
    // ------------------------------------------------------------------------

    /// Re-drive interrupted decision commits, then interrupted executions.
    /// Returns how many of either were finished.
    pub async fn replay_uncommitted(&self) -> ArbiterResult<usize> {
        let commits = self.journal.replay_uncommitted().await?;
        let executions = self.gate.replay_incomplete().await?;
        Ok(commits + executions)
    }

    /// Audit history of a decision, oldest first.
    pub async fn explain(&self, decision_id: DecisionId) -> ArbiterResult<Vec<String>> {
        self.audit.explain(decision_id).await
    }

    async fn load(&self, decision_id: DecisionId) -> ArbiterResult<(ArbitrationDecision, Conflict)> {
        let decision = self
            .store
            .decision_get(decision_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("decision", decision_id))?;
        let conflict = self
            .store
            .conflict_get(decision.conflict_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("conflict", decision.conflict_id))?;
        Ok((decision, conflict))
    }

    /// Publish suppression events for `suppressions`, then the resolution or
    /// escalation of the decision itself.
    fn announce(
        &self,
        decision: &ArbitrationDecision,
        conflict: &Conflict,
        agents: &HashMap<ProposalId, String>,
        suppressions: &[Suppression],
        now: Timestamp,
    ) {
        let metrics = &self.observability.metrics;
        for suppression in suppressions {
            self.dispatcher.publish(
                DomainEvent::ActionSuppressed {
                    decision_id: decision.decision_id,
                    proposal_id: suppression.proposal_id,
                    agent_name: agents
                        .get(&suppression.proposal_id)
                        .cloned()
                        .unwrap_or_default(),
                    reason: suppression.reason,
                    explanation: suppression.explanation.clone(),
                },
                now,
            );
            metrics.record_suppression(suppression.reason);
        }

        match &decision.escalation {
            Some(escalation) if decision.requires_human_approval => {
                self.dispatcher.publish(
                    DomainEvent::ArbitrationEscalated {
                        decision_id: decision.decision_id,
                        conflict_id: conflict.conflict_id,
                        reason: escalation.reason,
                        proposal_ids: conflict.proposal_ids.clone(),
                        suggested_resolution: escalation.suggested_resolution,
                    },
                    now,
                );
                metrics.record_escalation(escalation.reason);
            }
            _ => {
                self.dispatcher.publish(
                    DomainEvent::ArbitrationResolved {
                        decision_id: decision.decision_id,
                        conflict_id: conflict.conflict_id,
                        policy_id: decision.policy_id,
                        outcome: decision.outcome,
                        winning_proposal_id: decision.winning_proposal_id,
                        strategy: decision.strategy_used,
                    },
                    now,
                );
            }
        }
        metrics.record_resolution(decision.outcome);
    }
}

fn agent_names(proposals: &[Proposal]) -> HashMap<ProposalId, String> {
    proposals
        .iter()
        .map(|p| (p.proposal_id, p.agent_name.clone()))
        .collect()
}

impl<S> std::fmt::Debug for ArbitrationService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbitrationService")
            .field("gate", &self.gate)
            .field("scorer", &self.scorer.is_some())
            .field("locked_targets", &self.target_locks.len())
            .finish_non_exhaustive()
    }
}
