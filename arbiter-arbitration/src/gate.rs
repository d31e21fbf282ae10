//! Execution gate
//!
//! The only path by which a winning proposal's effect is applied. An
//! execution intent is recorded before the effect, every later step is
//! idempotent, and the decision's executed flag is set last. An execution
//! that stops part way is finished by calling `execute` again or by
//! `replay_incomplete`; concurrent callers for the same decision are turned
//! away while one is in flight.

use crate::retry::with_retry;
use arbiter_core::{
    ActionType, ArbiterError, ArbiterResult, ArbitrationDecision, AuditKind, ChangeSource,
    DecisionId, DomainEvent, PreferenceChangeRecord, PreferenceRegistry, PreferenceState,
    Proposal, ProposalId, ProposalStatus, ProposedAction, RetryConfig, Timestamp,
    ValidationError,
};
use arbiter_events::{AuditTrail, EventDispatcher};
use arbiter_storage::{ArbiterStore, ExecutionIntent, PreferenceRepository};
use arbiter_telemetry::ObservabilityContext;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

// ============================================================================
// APPLIERS
// ============================================================================

/// Applies the side effect of a winning proposal.
#[async_trait]
pub trait EffectApplier: Send + Sync {
    async fn apply(
        &self,
        proposal: &Proposal,
        decision: &ArbitrationDecision,
        now: Timestamp,
    ) -> ArbiterResult<()>;

    /// Whether `decision`'s effect is already in place. Consulted when an
    /// execution resumes after the effect may have been applied but before
    /// that was recorded. Appliers that cannot tell report `false`.
    async fn already_applied(
        &self,
        _proposal: &Proposal,
        _decision: &ArbitrationDecision,
    ) -> ArbiterResult<bool> {
        Ok(false)
    }
}

/// Reason written on the change record of a preference set by a decision.
pub fn decision_change_reason(decision_id: DecisionId) -> String {
    format!("decision {}", decision_id)
}

/// Routes each action type to its applier.
#[derive(Default, Clone)]
pub struct ApplierRegistry {
    appliers: HashMap<ActionType, Arc<dyn EffectApplier>>,
}

impl ApplierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action_type: ActionType, applier: Arc<dyn EffectApplier>) -> Self {
        self.appliers.insert(action_type, applier);
        self
    }

    pub fn handles(&self, action_type: ActionType) -> bool {
        self.appliers.contains_key(&action_type)
    }
}

#[async_trait]
impl EffectApplier for ApplierRegistry {
    async fn apply(
        &self,
        proposal: &Proposal,
        decision: &ArbitrationDecision,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        self.route(proposal)?.apply(proposal, decision, now).await
    }

    async fn already_applied(
        &self,
        proposal: &Proposal,
        decision: &ArbitrationDecision,
    ) -> ArbiterResult<bool> {
        self.route(proposal)?.already_applied(proposal, decision).await
    }
}

impl ApplierRegistry {
    fn route(&self, proposal: &Proposal) -> ArbiterResult<&Arc<dyn EffectApplier>> {
        let action_type = proposal.action_type();
        self.appliers
            .get(&action_type)
            .ok_or_else(|| ArbiterError::Collaborator {
                collaborator: "effect_applier",
                reason: format!("no applier registered for {}", action_type),
            })
    }
}

impl std::fmt::Debug for ApplierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handled: Vec<_> = self.appliers.keys().map(|t| t.as_db_str()).collect();
        handled.sort_unstable();
        f.debug_struct("ApplierRegistry")
            .field("handled", &handled)
            .finish()
    }
}

/// Writes `apply_preference` winners to the preference store.
pub struct PreferenceEffectApplier<S> {
    store: Arc<S>,
    registry: Arc<PreferenceRegistry>,
}

impl<S: PreferenceRepository> PreferenceEffectApplier<S> {
    pub fn new(store: Arc<S>, registry: Arc<PreferenceRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl<S: PreferenceRepository + 'static> EffectApplier for PreferenceEffectApplier<S> {
    async fn apply(
        &self,
        proposal: &Proposal,
        decision: &ArbitrationDecision,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        let ProposedAction::ApplyPreference {
            category,
            key,
            value,
            ..
        } = &proposal.action
        else {
            return Err(ArbiterError::invalid_value(
                "action",
                format!("{} is not a preference change", proposal.action_type()),
            ));
        };

        let definition = self.registry.require(category, key)?;
        if !definition.allows(value) {
            return Err(ArbiterError::invalid_value(
                format!("{}/{}", category, key),
                format!("{} is not an allowed value", value),
            ));
        }

        let current = self.store.preference_get(category, key).await?;
        let mut state = match current {
            Some(state) => state,
            None => PreferenceState::from_default(definition, now),
        };
        if state.locked {
            return Err(ArbiterError::Validation(ValidationError::ConstraintViolation {
                constraint: format!("{}/{} locked", category, key),
                reason: "locked preferences are only changed by the user".to_string(),
            }));
        }

        // One change record per decision, written before the value, so a
        // resumed apply keeps the value this decision first replaced.
        if self.decision_record(category, key, decision.decision_id).await?.is_none() {
            let record = PreferenceChangeRecord::new(
                &proposal.agent_name,
                &state.preference_key(),
                Some(state.value.clone()),
                value.clone(),
                ChangeSource::Arbitration,
                decision_change_reason(decision.decision_id),
                now,
            );
            self.store.preference_append_change(&record).await?;
        }

        state.value = value.clone();
        state.updated_at = now;
        self.store.preference_upsert(&state).await
    }

    /// Landed when the decision's change record exists and the stored value
    /// matches it.
    async fn already_applied(
        &self,
        proposal: &Proposal,
        decision: &ArbitrationDecision,
    ) -> ArbiterResult<bool> {
        let ProposedAction::ApplyPreference { category, key, .. } = &proposal.action else {
            return Ok(false);
        };
        let Some(record) = self.decision_record(category, key, decision.decision_id).await? else {
            return Ok(false);
        };
        let stored = self.store.preference_get(category, key).await?;
        Ok(stored.is_some_and(|state| state.value == record.new_value))
    }
}

impl<S: PreferenceRepository> PreferenceEffectApplier<S> {
    async fn decision_record(
        &self,
        category: &str,
        key: &str,
        decision_id: DecisionId,
    ) -> ArbiterResult<Option<PreferenceChangeRecord>> {
        let reason = decision_change_reason(decision_id);
        Ok(self
            .store
            .preference_history(category, key)
            .await?
            .into_iter()
            .find(|r| r.changed_by == ChangeSource::Arbitration && r.reason == reason))
    }
}

impl<S> std::fmt::Debug for PreferenceEffectApplier<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceEffectApplier")
            .field("preferences", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// GATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Executed {
        decision_id: DecisionId,
        proposal_id: ProposalId,
    },
    /// The effect was applied by an earlier call; nothing was done.
    AlreadyExecuted { decision_id: DecisionId },
}

/// Removes the in-flight marker when execution ends, however it ends.
struct InFlight<'a> {
    claims: &'a DashMap<DecisionId, ()>,
    decision_id: DecisionId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.decision_id);
    }
}

pub struct ExecutionGate<S> {
    store: Arc<S>,
    applier: Arc<dyn EffectApplier>,
    audit: AuditTrail,
    dispatcher: Arc<EventDispatcher>,
    observability: ObservabilityContext,
    retry: RetryConfig,
    in_flight: DashMap<DecisionId, ()>,
}

impl<S: ArbiterStore + 'static> ExecutionGate<S> {
    pub fn new(
        store: Arc<S>,
        applier: Arc<dyn EffectApplier>,
        dispatcher: Arc<EventDispatcher>,
        observability: ObservabilityContext,
        retry: RetryConfig,
    ) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self {
            store,
            applier,
            audit,
            dispatcher,
            observability,
            retry,
            in_flight: DashMap::new(),
        }
    }

    fn claim(&self, decision_id: DecisionId) -> ArbiterResult<InFlight<'_>> {
        if self.in_flight.insert(decision_id, ()).is_some() {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                "execution in progress",
            ));
        }
        Ok(InFlight {
            claims: &self.in_flight,
            decision_id,
        })
    }

    /// Apply the winner of `decision_id` exactly once.
    pub async fn execute(
        &self,
        decision_id: DecisionId,
        now: Timestamp,
    ) -> ArbiterResult<ExecutionOutcome> {
        let _claim = self.claim(decision_id)?;

        let decision = self.load_decision(decision_id).await?;
        if decision.executed {
            debug!(decision_id = %decision_id, "Decision already executed");
            return Ok(ExecutionOutcome::AlreadyExecuted { decision_id });
        }
        if !decision.can_execute() {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                format!(
                    "not executable (outcome {}, requires approval {})",
                    decision.outcome, decision.requires_human_approval
                ),
            ));
        }
        let proposal_id = decision
            .winning_proposal_id
            .ok_or_else(|| ArbiterError::invalid_state("decision", decision_id, "no winner"))?;

        let intent = with_retry(&self.retry, "execution_record", || {
            self.store.execution_record(decision_id, proposal_id, now)
        })
        .await?;
        if intent.applied {
            info!(decision_id = %decision_id, "Resuming interrupted execution");
        }
        self.finish(&intent, &decision, now).await
    }

    /// Finish every execution that stopped part way. Returns how many were
    /// finished.
    pub async fn replay_incomplete(&self) -> ArbiterResult<usize> {
        let pending = self.store.execution_list_incomplete().await?;
        for intent in &pending {
            let _claim = self.claim(intent.decision_id)?;
            info!(decision_id = %intent.decision_id, "Replaying interrupted execution");
            let decision = self.load_decision(intent.decision_id).await?;
            if decision.executed {
                with_retry(&self.retry, "execution_mark_completed", || {
                    self.store.execution_mark_completed(intent.decision_id)
                })
                .await?;
                continue;
            }
            self.finish(intent, &decision, intent.recorded_at).await?;
        }
        Ok(pending.len())
    }

    async fn load_decision(&self, decision_id: DecisionId) -> ArbiterResult<ArbitrationDecision> {
        self.store
            .decision_get(decision_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("decision", decision_id))
    }

    /// Drive an execution intent to completion. Every step checks whether it
    /// already took effect, so a resumed execution never repeats one.
    async fn finish(
        &self,
        intent: &ExecutionIntent,
        decision: &ArbitrationDecision,
        now: Timestamp,
    ) -> ArbiterResult<ExecutionOutcome> {
        let decision_id = intent.decision_id;
        let proposal_id = intent.proposal_id;
        let mut proposal = self
            .store
            .proposal_get(proposal_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("proposal", proposal_id))?;

        if !intent.applied {
            if self.applier.already_applied(&proposal, decision).await? {
                debug!(decision_id = %decision_id, "Effect already in place");
            } else {
                self.applier.apply(&proposal, decision, now).await?;
            }
            with_retry(&self.retry, "execution_mark_applied", || {
                self.store.execution_mark_applied(decision_id)
            })
            .await?;
        }

        let payload = json!({
            "proposal_id": proposal_id,
            "agent_name": proposal.agent_name,
            "action": proposal.action,
        });
        let draft = AuditTrail::draft(
            AuditKind::DecisionExecuted,
            decision_id,
            format!(
                "executed {} from {} on {}",
                proposal.action_type(),
                proposal.agent_name,
                proposal.target
            ),
            &payload,
            now,
        )?;
        with_retry(&self.retry, "audit_append", || {
            self.audit.append_once(draft.clone())
        })
        .await?;

        if proposal.status == ProposalStatus::Won {
            proposal.transition(ProposalStatus::Executed, decision_id, now)?;
            with_retry(&self.retry, "proposal_update", || {
                self.store.proposal_update(&proposal)
            })
            .await?;
        }

        let flipped = with_retry(&self.retry, "decision_mark_executed", || {
            self.store.decision_mark_executed(decision_id, now)
        })
        .await?;
        with_retry(&self.retry, "execution_mark_completed", || {
            self.store.execution_mark_completed(decision_id)
        })
        .await?;
        if !flipped {
            return Ok(ExecutionOutcome::AlreadyExecuted { decision_id });
        }

        self.dispatcher.publish(
            DomainEvent::DecisionExecuted {
                decision_id,
                proposal_id,
            },
            now,
        );
        self.observability.metrics.record_execution();
        info!(
            decision_id = %decision_id,
            proposal_id = %proposal_id,
            agent = %proposal.agent_name,
            "Decision executed"
        );
        Ok(ExecutionOutcome::Executed {
            decision_id,
            proposal_id,
        })
    }
}

impl<S> std::fmt::Debug for ExecutionGate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGate")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
