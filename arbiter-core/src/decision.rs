//! Conflicts and arbitration decisions

use crate::{
    ArbiterError, ArbiterResult, ConflictId, ConflictType, DecisionId, DecisionOutcome,
    EntityIdType, EscalationReason, PolicyId, ProposalId, ResolutionStrategy, SuppressionReason,
    TargetRef, Timestamp,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFLICT
// ============================================================================

/// Proposals colliding on one target. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: ConflictId,
    pub target: TargetRef,
    /// Sorted and deduplicated.
    pub proposal_ids: Vec<ProposalId>,
    /// `None` for the singleton no-conflict path.
    pub conflict_type: Option<ConflictType>,
    pub detected_at: Timestamp,
}

impl Conflict {
    pub fn new(
        target: TargetRef,
        proposal_ids: impl IntoIterator<Item = ProposalId>,
        conflict_type: Option<ConflictType>,
        detected_at: Timestamp,
    ) -> ArbiterResult<Self> {
        let mut proposal_ids: Vec<ProposalId> = proposal_ids.into_iter().collect();
        proposal_ids.sort();
        proposal_ids.dedup();

        match (proposal_ids.len(), conflict_type) {
            (0, _) => return Err(ArbiterError::missing_field("conflict.proposal_ids")),
            (1, Some(_)) => {
                return Err(ArbiterError::invalid_value(
                    "conflict.conflict_type",
                    "a single proposal cannot conflict",
                ))
            }
            (n, None) if n > 1 => {
                return Err(ArbiterError::missing_field("conflict.conflict_type"));
            }
            _ => {}
        }

        Ok(Self {
            conflict_id: ConflictId::now_v7(),
            target,
            proposal_ids,
            conflict_type,
            detected_at,
        })
    }

    pub fn is_singleton(&self) -> bool {
        self.proposal_ids.len() == 1
    }

    pub fn contains(&self, proposal_id: ProposalId) -> bool {
        self.proposal_ids.binary_search(&proposal_id).is_ok()
    }
}

// ============================================================================
// DECISION PARTS
// ============================================================================

/// A loser and why it lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suppression {
    pub proposal_id: ProposalId,
    pub reason: SuppressionReason,
    pub explanation: String,
}

/// One input that weighed on a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionFactor {
    pub proposal_id: ProposalId,
    pub agent_name: String,
    pub factor: String,
    pub value: f64,
    /// Signed contribution to the proposal's standing.
    pub impact: f64,
}

/// Why a human must decide, with an advisory pick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub reason: EscalationReason,
    pub detail: String,
    /// Advisory only; never executed without approval.
    pub suggested_resolution: Option<ProposalId>,
}

/// How a human closed an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanResolution {
    pub resolved_by: String,
    pub approved_proposal_id: Option<ProposalId>,
    pub note: Option<String>,
    pub resolved_at: Timestamp,
}

// ============================================================================
// DECISION
// ============================================================================

/// The result of arbitrating one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationDecision {
    pub decision_id: DecisionId,
    pub conflict_id: ConflictId,
    pub policy_id: PolicyId,
    pub outcome: DecisionOutcome,
    pub winning_proposal_id: Option<ProposalId>,
    pub suppressed_proposal_ids: Vec<ProposalId>,
    pub vetoed_proposal_ids: Vec<ProposalId>,
    pub suppressions: Vec<Suppression>,
    pub strategy_used: Option<ResolutionStrategy>,
    pub reasoning_summary: String,
    pub decision_factors: Vec<DecisionFactor>,
    pub escalation: Option<Escalation>,
    pub requires_human_approval: bool,
    pub human_resolution: Option<HumanResolution>,
    pub executed: bool,
    pub executed_at: Option<Timestamp>,
    pub decided_at: Timestamp,
}

impl ArbitrationDecision {
    /// Whether the execution gate may apply the winner.
    pub fn can_execute(&self) -> bool {
        !self.executed
            && !self.requires_human_approval
            && self.outcome.selects_winner()
            && self.winning_proposal_id.is_some()
    }

    pub fn is_escalated(&self) -> bool {
        self.outcome == DecisionOutcome::Escalated
    }

    /// Flip `executed`. Returns `false` when it already was.
    pub fn mark_executed(&mut self, now: Timestamp) -> ArbiterResult<bool> {
        if self.executed {
            return Ok(false);
        }
        if !self.can_execute() {
            return Err(ArbiterError::invalid_state(
                "decision",
                self.decision_id,
                format!(
                    "not executable (outcome {}, requires approval {})",
                    self.outcome, self.requires_human_approval
                ),
            ));
        }
        self.executed = true;
        self.executed_at = Some(now);
        Ok(true)
    }

    /// Close an escalation by approving one of the conflict's proposals.
    /// Every other contender is suppressed with the loss reason of the
    /// strategy that escalated, and the explanation names the approver.
    pub fn approve(
        &mut self,
        proposal_id: ProposalId,
        contenders: &[ProposalId],
        approver: &str,
        note: Option<String>,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        self.require_escalated()?;
        if !contenders.contains(&proposal_id) || self.vetoed_proposal_ids.contains(&proposal_id) {
            return Err(ArbiterError::invalid_value(
                "proposal_id",
                format!("{} is not an eligible contender of this decision", proposal_id),
            ));
        }
        let reason = self
            .strategy_used
            .map_or(SuppressionReason::LostPriority, |s| s.loss_reason());
        for id in contenders {
            if *id != proposal_id && !self.vetoed_proposal_ids.contains(id) {
                self.suppressed_proposal_ids.push(*id);
                self.suppressions.push(Suppression {
                    proposal_id: *id,
                    reason,
                    explanation: format!(
                        "human approval: {} chose proposal {} instead",
                        approver, proposal_id
                    ),
                });
            }
        }
        self.outcome = DecisionOutcome::WinnerSelected;
        self.winning_proposal_id = Some(proposal_id);
        self.requires_human_approval = false;
        self.reasoning_summary = format!(
            "{}; approved by {} ({})",
            self.reasoning_summary, approver, proposal_id
        );
        self.human_resolution = Some(HumanResolution {
            resolved_by: approver.to_string(),
            approved_proposal_id: Some(proposal_id),
            note,
            resolved_at: now,
        });
        Ok(())
    }

    /// Close an escalation by rejecting every contender.
    pub fn reject(
        &mut self,
        contenders: &[ProposalId],
        approver: &str,
        note: Option<String>,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        self.require_escalated()?;
        for id in contenders {
            if !self.vetoed_proposal_ids.contains(id) {
                self.vetoed_proposal_ids.push(*id);
                self.suppressions.push(Suppression {
                    proposal_id: *id,
                    reason: SuppressionReason::Vetoed,
                    explanation: format!("rejected by {}", approver),
                });
            }
        }
        self.outcome = DecisionOutcome::AllVetoed;
        self.requires_human_approval = false;
        self.reasoning_summary = format!("{}; rejected by {}", self.reasoning_summary, approver);
        self.human_resolution = Some(HumanResolution {
            resolved_by: approver.to_string(),
            approved_proposal_id: None,
            note,
            resolved_at: now,
        });
        Ok(())
    }

    fn require_escalated(&self) -> ArbiterResult<()> {
        if !self.is_escalated() || !self.requires_human_approval {
            return Err(ArbiterError::invalid_state(
                "decision",
                self.decision_id,
                format!("only escalated decisions can be resolved, outcome is {}", self.outcome),
            ));
        }
        Ok(())
    }

    pub fn suppression_for(&self, proposal_id: ProposalId) -> Option<&Suppression> {
        self.suppressions.iter().find(|s| s.proposal_id == proposal_id)
    }
}
