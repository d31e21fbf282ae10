//! Arbitration engine
//!
//! Pure and synchronous: given a conflict, its proposals and the governing
//! policy, produce a decision. Order of evaluation:
//!
//! 1. veto rules remove contenders (all vetoed ends here)
//! 2. escalation thresholds over the survivors
//! 3. singleton groups select their lone proposal
//! 4. the policy's strategy, which may itself escalate

use crate::escalation::check_thresholds;
use crate::strategy::{self, apply_vetoes};
use arbiter_core::{
    ArbiterError, ArbiterResult, ArbitrationDecision, ArbitrationPolicy, Conflict, DecisionId,
    DecisionOutcome, EntityIdType, Escalation, EscalationReason, Proposal, Timestamp,
};

pub struct ArbitrationEngine;

impl ArbitrationEngine {
    pub fn arbitrate(
        conflict: &Conflict,
        proposals: &[Proposal],
        policy: &ArbitrationPolicy,
        now: Timestamp,
    ) -> ArbiterResult<ArbitrationDecision> {
        let mut ordered: Vec<&Proposal> = proposals.iter().collect();
        ordered.sort_by_key(|p| p.proposal_id);
        Self::check_inputs(conflict, &ordered)?;

        let filter = apply_vetoes(&ordered, &policy.veto_rules);
        let mut decision = ArbitrationDecision {
            decision_id: DecisionId::now_v7(),
            conflict_id: conflict.conflict_id,
            policy_id: policy.policy_id,
            outcome: DecisionOutcome::AllVetoed,
            winning_proposal_id: None,
            suppressed_proposal_ids: Vec::new(),
            vetoed_proposal_ids: filter.vetoed.iter().map(|s| s.proposal_id).collect(),
            suppressions: filter.vetoed,
            strategy_used: None,
            reasoning_summary: String::new(),
            decision_factors: Vec::new(),
            escalation: None,
            requires_human_approval: false,
            human_resolution: None,
            executed: false,
            executed_at: None,
            decided_at: now,
        };
        let contenders = filter.contenders;

        if contenders.is_empty() {
            decision.reasoning_summary = format!(
                "all {} proposal(s) on {} vetoed by policy '{}'",
                ordered.len(),
                conflict.target,
                policy.name
            );
            return Ok(decision);
        }

        let any_vetoed = !decision.vetoed_proposal_ids.is_empty();
        if let Some(mut escalation) =
            check_thresholds(&contenders, &policy.escalation, any_vetoed)
        {
            let advisory = strategy::resolve(policy.resolution_strategy, &contenders, policy);
            escalation.suggested_resolution = advisory
                .winner
                .or(advisory.escalation.and_then(|e| e.suggested_resolution));
            decision.decision_factors = advisory.factors;
            return Ok(Self::escalate(decision, escalation));
        }

        if let [lone] = contenders.as_slice() {
            if conflict.is_singleton() {
                decision.outcome = DecisionOutcome::NoConflict;
                decision.winning_proposal_id = Some(lone.proposal_id);
                decision.reasoning_summary = format!(
                    "single proposal {} from {} on {}, no conflict",
                    lone.proposal_id, lone.agent_name, conflict.target
                );
                return Ok(decision);
            }
        }

        let outcome = strategy::resolve(policy.resolution_strategy, &contenders, policy);
        decision.strategy_used = Some(policy.resolution_strategy);
        decision.decision_factors = outcome.factors;
        decision.reasoning_summary = outcome.summary;

        match (outcome.winner, outcome.escalation) {
            (_, Some(escalation)) => Ok(Self::escalate(decision, escalation)),
            (Some(winner), None) => {
                decision.outcome = DecisionOutcome::WinnerSelected;
                decision.winning_proposal_id = Some(winner);
                decision
                    .suppressed_proposal_ids
                    .extend(outcome.suppressions.iter().map(|s| s.proposal_id));
                decision.suppressions.extend(outcome.suppressions);
                Ok(decision)
            }
            (None, None) => Ok(Self::escalate(
                decision,
                Escalation {
                    reason: EscalationReason::NoClearWinner,
                    detail: "strategy produced no winner".to_string(),
                    suggested_resolution: None,
                },
            )),
        }
    }

    fn escalate(mut decision: ArbitrationDecision, escalation: Escalation) -> ArbitrationDecision {
        decision.outcome = DecisionOutcome::Escalated;
        decision.requires_human_approval = true;
        decision.winning_proposal_id = None;
        decision.reasoning_summary =
            format!("escalated ({}): {}", escalation.reason, escalation.detail);
        decision.escalation = Some(escalation);
        decision
    }

    fn check_inputs(conflict: &Conflict, ordered: &[&Proposal]) -> ArbiterResult<()> {
        let ids: Vec<_> = ordered.iter().map(|p| p.proposal_id).collect();
        if ids != conflict.proposal_ids {
            return Err(ArbiterError::invalid_value(
                "proposals",
                format!("do not match the proposals of conflict {}", conflict.conflict_id),
            ));
        }
        if let Some(p) = ordered.iter().find(|p| !p.is_scored()) {
            return Err(ArbiterError::invalid_state(
                "proposal",
                p.proposal_id,
                "not scored, cannot be arbitrated",
            ));
        }
        Ok(())
    }
}
