//! Agent proposals

use crate::{
    ActionType, ArbiterError, ArbiterResult, DecisionId, EntityIdType, EntityId, ProposalId,
    ProposalStatus, ProposedAction, RiskLevel, TargetRef, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Input for submitting a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProposal {
    pub agent_name: String,
    pub action: ProposedAction,
    /// Left empty when the confidence scorer should fill it in.
    pub confidence: Option<f64>,
    pub cost_estimate: f64,
    pub risk_level: RiskLevel,
    pub priority: i32,
    pub originating_event_id: Option<EntityId>,
}

impl NewProposal {
    pub fn new(agent_name: impl Into<String>, action: ProposedAction) -> Self {
        Self {
            agent_name: agent_name.into(),
            action,
            confidence: None,
            cost_estimate: 0.0,
            risk_level: RiskLevel::Low,
            priority: 0,
            originating_event_id: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_cost(mut self, cost_estimate: f64) -> Self {
        self.cost_estimate = cost_estimate;
        self
    }

    pub fn with_risk(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = risk_level;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_originating_event(mut self, event_id: EntityId) -> Self {
        self.originating_event_id = Some(event_id);
        self
    }
}

/// A proposed action on a shared target, awaiting or past arbitration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub agent_name: String,
    pub action: ProposedAction,
    pub target: TargetRef,
    pub confidence: Option<f64>,
    pub cost_estimate: f64,
    pub risk_level: RiskLevel,
    pub priority: i32,
    pub originating_event_id: Option<EntityId>,
    pub status: ProposalStatus,
    pub decision_id: Option<DecisionId>,
    pub processed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Proposal {
    /// Validate input and create a pending proposal.
    pub fn new(input: NewProposal, now: Timestamp) -> ArbiterResult<Self> {
        if input.agent_name.trim().is_empty() {
            return Err(ArbiterError::missing_field("agent_name"));
        }
        input.action.validate()?;
        if let Some(confidence) = input.confidence {
            validate_confidence(confidence)?;
        }
        if !input.cost_estimate.is_finite() || input.cost_estimate < 0.0 {
            return Err(ArbiterError::invalid_value(
                "cost_estimate",
                format!("must be a non-negative number, got {}", input.cost_estimate),
            ));
        }

        Ok(Self {
            proposal_id: ProposalId::now_v7(),
            target: input.action.target(),
            agent_name: input.agent_name,
            action: input.action,
            confidence: input.confidence,
            cost_estimate: input.cost_estimate,
            risk_level: input.risk_level,
            priority: input.priority,
            originating_event_id: input.originating_event_id,
            status: ProposalStatus::Pending,
            decision_id: None,
            processed_at: None,
            created_at: now,
        })
    }

    pub fn action_type(&self) -> ActionType {
        self.action.action_type()
    }

    /// Unscored proposals are not eligible for arbitration.
    pub fn is_scored(&self) -> bool {
        self.confidence.is_some()
    }

    pub fn confidence_or_zero(&self) -> f64 {
        self.confidence.unwrap_or(0.0)
    }

    pub fn set_confidence(&mut self, confidence: f64) -> ArbiterResult<()> {
        validate_confidence(confidence)?;
        self.confidence = Some(confidence);
        Ok(())
    }

    /// Park a pending proposal under an escalated decision. It stays pending
    /// but is no longer picked up by detection.
    pub fn attach_decision(&mut self, decision_id: DecisionId) -> ArbiterResult<()> {
        if self.status != ProposalStatus::Pending {
            return Err(ArbiterError::invalid_state(
                "proposal",
                self.proposal_id,
                format!("only pending proposals can await a decision, status is {}", self.status),
            ));
        }
        self.decision_id = Some(decision_id);
        Ok(())
    }

    /// Pending, scored and not parked under an escalation.
    pub fn is_eligible(&self) -> bool {
        self.status == ProposalStatus::Pending && self.decision_id.is_none() && self.is_scored()
    }

    pub fn is_awaiting_decision(&self) -> bool {
        self.status == ProposalStatus::Pending && self.decision_id.is_some()
    }

    /// Move the proposal to `next` under `decision_id`.
    ///
    /// Leaving `pending` records the decision. Once a decision owns the
    /// proposal (won, or parked under an escalation) only that decision may
    /// move it.
    pub fn transition(
        &mut self,
        next: ProposalStatus,
        decision_id: DecisionId,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ArbiterError::invalid_state(
                "proposal",
                self.proposal_id,
                format!("cannot move from {} to {}", self.status, next),
            ));
        }
        if self.decision_id.is_some_and(|owner| owner != decision_id) {
            return Err(ArbiterError::invalid_state(
                "proposal",
                self.proposal_id,
                format!("owned by a different decision than {}", decision_id),
            ));
        }
        self.status = next;
        self.decision_id = Some(decision_id);
        self.processed_at = Some(now);
        Ok(())
    }
}

fn validate_confidence(confidence: f64) -> ArbiterResult<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ArbiterError::invalid_value(
            "confidence",
            format!("must be within [0, 1], got {}", confidence),
        ));
    }
    Ok(())
}
