//! Domain events published by arbitration and adaptation
//!
//! The set is closed: subscribers match on [`DomainEvent`] and handler
//! tables are keyed by [`EventKind`].

use crate::{
    AttemptId, BlockReason, ChangeRecordId, ConflictId, DecisionId, DecisionOutcome, EntityIdType,
    EscalationReason, EventId, PolicyId, PreferenceValue, ProposalId, ResolutionStrategy,
    SkipReason, SuppressionReason, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of [`DomainEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ActionSuppressed,
    ArbitrationResolved,
    ArbitrationEscalated,
    DecisionExecuted,
    PreferenceAutoApplied,
    PreferenceAutoBlocked,
    PreferenceAutoSkipped,
    PreferenceRolledBack,
}

impl EventKind {
    pub const ALL: &'static [EventKind] = &[
        EventKind::ActionSuppressed,
        EventKind::ArbitrationResolved,
        EventKind::ArbitrationEscalated,
        EventKind::DecisionExecuted,
        EventKind::PreferenceAutoApplied,
        EventKind::PreferenceAutoBlocked,
        EventKind::PreferenceAutoSkipped,
        EventKind::PreferenceRolledBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ActionSuppressed => "ActionSuppressed",
            EventKind::ArbitrationResolved => "ArbitrationResolved",
            EventKind::ArbitrationEscalated => "ArbitrationEscalated",
            EventKind::DecisionExecuted => "DecisionExecuted",
            EventKind::PreferenceAutoApplied => "PreferenceAutoApplied",
            EventKind::PreferenceAutoBlocked => "PreferenceAutoBlocked",
            EventKind::PreferenceAutoSkipped => "PreferenceAutoSkipped",
            EventKind::PreferenceRolledBack => "PreferenceRolledBack",
        }
    }

    /// Whether the event belongs to the arbitration flow.
    pub fn is_arbitration(&self) -> bool {
        matches!(
            self,
            EventKind::ActionSuppressed
                | EventKind::ArbitrationResolved
                | EventKind::ArbitrationEscalated
                | EventKind::DecisionExecuted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rollback restored from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "id", rename_all = "snake_case")]
pub enum RollbackSource {
    Decision(DecisionId),
    Attempt(AttemptId),
    History(ChangeRecordId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    ActionSuppressed {
        decision_id: DecisionId,
        proposal_id: ProposalId,
        agent_name: String,
        reason: SuppressionReason,
        explanation: String,
    },
    ArbitrationResolved {
        decision_id: DecisionId,
        conflict_id: ConflictId,
        policy_id: PolicyId,
        outcome: DecisionOutcome,
        winning_proposal_id: Option<ProposalId>,
        strategy: Option<ResolutionStrategy>,
    },
    ArbitrationEscalated {
        decision_id: DecisionId,
        conflict_id: ConflictId,
        reason: EscalationReason,
        proposal_ids: Vec<ProposalId>,
        suggested_resolution: Option<ProposalId>,
    },
    DecisionExecuted {
        decision_id: DecisionId,
        proposal_id: ProposalId,
    },
    PreferenceAutoApplied {
        attempt_id: AttemptId,
        agent_name: String,
        category: String,
        key: String,
        previous_value: Option<PreferenceValue>,
        new_value: PreferenceValue,
    },
    PreferenceAutoBlocked {
        attempt_id: AttemptId,
        agent_name: String,
        category: String,
        key: String,
        reason: BlockReason,
    },
    PreferenceAutoSkipped {
        attempt_id: AttemptId,
        agent_name: String,
        category: String,
        key: String,
        reason: SkipReason,
    },
    PreferenceRolledBack {
        category: String,
        key: String,
        restored_value: PreferenceValue,
        source: RollbackSource,
        reason: String,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::ActionSuppressed { .. } => EventKind::ActionSuppressed,
            DomainEvent::ArbitrationResolved { .. } => EventKind::ArbitrationResolved,
            DomainEvent::ArbitrationEscalated { .. } => EventKind::ArbitrationEscalated,
            DomainEvent::DecisionExecuted { .. } => EventKind::DecisionExecuted,
            DomainEvent::PreferenceAutoApplied { .. } => EventKind::PreferenceAutoApplied,
            DomainEvent::PreferenceAutoBlocked { .. } => EventKind::PreferenceAutoBlocked,
            DomainEvent::PreferenceAutoSkipped { .. } => EventKind::PreferenceAutoSkipped,
            DomainEvent::PreferenceRolledBack { .. } => EventKind::PreferenceRolledBack,
        }
    }
}

/// Envelope carried on the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub kind: EventKind,
    pub occurred_at: Timestamp,
    pub payload: DomainEvent,
}

impl Event {
    pub fn new(payload: DomainEvent, occurred_at: Timestamp) -> Self {
        Self {
            event_id: EventId::now_v7(),
            kind: payload.kind(),
            occurred_at,
            payload,
        }
    }
}
