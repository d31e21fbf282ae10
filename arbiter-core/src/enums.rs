//! Enum types for ARBITER entities
//!
//! Every enum persists as a snake_case reason/status code. Parsing is lenient
//! about case, whitespace, `-` and `_` so codes from older stores still load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an unknown enum code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

macro_rules! impl_db_str {
    ($ty:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        impl $ty {
            /// All variants in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Convert to database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $code),+
                }
            }

            /// Parse from database string representation.
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                let normalized = normalize_token(s);
                $(
                    if normalized == normalize_token($code) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(EnumParseError { kind: $kind, value: s.to_string() })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_db_str())
            }
        }

        impl FromStr for $ty {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// PROPOSALS
// ============================================================================

/// Declared risk of a proposal or preference.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl_db_str!(RiskLevel, "risk level", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Won,
    Suppressed,
    Vetoed,
    Executed,
}

impl_db_str!(ProposalStatus, "proposal status", {
    Pending => "pending",
    Won => "won",
    Suppressed => "suppressed",
    Vetoed => "vetoed",
    Executed => "executed",
});

impl ProposalStatus {
    /// Whether the proposal has left `pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }

    /// Allowed transitions: pending leaves exactly once, and only `won`
    /// may move on to `executed`.
    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (ProposalStatus::Pending, ProposalStatus::Won)
                | (ProposalStatus::Pending, ProposalStatus::Suppressed)
                | (ProposalStatus::Pending, ProposalStatus::Vetoed)
                | (ProposalStatus::Won, ProposalStatus::Executed)
        )
    }
}

/// Kind of target a proposal acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Preference,
    ScheduleItem,
    Task,
    Goal,
    Notification,
}

impl_db_str!(TargetType, "target type", {
    Preference => "preference",
    ScheduleItem => "schedule_item",
    Task => "task",
    Goal => "goal",
    Notification => "notification",
});

/// Discriminant of [`crate::ProposedAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ApplyPreference,
    Reschedule,
    CreateTask,
    AdjustGoal,
    SendNudge,
}

impl_db_str!(ActionType, "action type", {
    ApplyPreference => "apply_preference",
    Reschedule => "reschedule",
    CreateTask => "create_task",
    AdjustGoal => "adjust_goal",
    SendNudge => "send_nudge",
});

// ============================================================================
// ARBITRATION
// ============================================================================

/// Classification of a group of proposals sharing a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SameTarget,
    MutuallyExclusive,
    ResourceCompetition,
    InvariantViolation,
}

impl_db_str!(ConflictType, "conflict type", {
    SameTarget => "same_target",
    MutuallyExclusive => "mutually_exclusive",
    ResourceCompetition => "resource_competition",
    InvariantViolation => "invariant_violation",
});

impl ConflictType {
    /// Higher wins when several classifications apply to one group.
    pub fn precedence(&self) -> u8 {
        match self {
            ConflictType::SameTarget => 0,
            ConflictType::ResourceCompetition => 1,
            ConflictType::MutuallyExclusive => 2,
            ConflictType::InvariantViolation => 3,
        }
    }
}

/// Strategy a policy uses to pick a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    #[default]
    Priority,
    Weighted,
    Veto,
    Consensus,
}

impl_db_str!(ResolutionStrategy, "resolution strategy", {
    Priority => "priority",
    Weighted => "weighted",
    Veto => "veto",
    Consensus => "consensus",
});

impl ResolutionStrategy {
    /// Why a contender loses under this strategy.
    pub fn loss_reason(&self) -> SuppressionReason {
        match self {
            ResolutionStrategy::Priority => SuppressionReason::LostPriority,
            ResolutionStrategy::Weighted | ResolutionStrategy::Veto => SuppressionReason::LowerScore,
            ResolutionStrategy::Consensus => SuppressionReason::LostConsensus,
        }
    }
}

/// Scope an arbitration policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Default,
    Agent,
    Preference,
}

impl_db_str!(PolicyScope, "policy scope", {
    Default => "default",
    Agent => "agent",
    Preference => "preference",
});

impl PolicyScope {
    /// Higher overrides lower: preference > agent > default.
    pub fn precedence(&self) -> u8 {
        match self {
            PolicyScope::Default => 0,
            PolicyScope::Agent => 1,
            PolicyScope::Preference => 2,
        }
    }
}

/// Result of arbitrating a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    WinnerSelected,
    AllVetoed,
    Escalated,
    NoConflict,
}

impl_db_str!(DecisionOutcome, "decision outcome", {
    WinnerSelected => "winner_selected",
    AllVetoed => "all_vetoed",
    Escalated => "escalated",
    NoConflict => "no_conflict",
});

impl DecisionOutcome {
    /// Outcomes that carry an executable winner. A lone proposal on its
    /// target (`no_conflict`) executes the same way a resolved conflict does.
    pub fn selects_winner(&self) -> bool {
        matches!(
            self,
            DecisionOutcome::WinnerSelected | DecisionOutcome::NoConflict
        )
    }
}

/// Why a conflict was handed to a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    RiskThreshold,
    CostThreshold,
    ConfidenceTooLow,
    AgentAlwaysEscalate,
    VetoEscalation,
    MultiAgentConflict,
    NoClearWinner,
}

impl_db_str!(EscalationReason, "escalation reason", {
    RiskThreshold => "risk_threshold",
    CostThreshold => "cost_threshold",
    ConfidenceTooLow => "confidence_too_low",
    AgentAlwaysEscalate => "agent_always_escalate",
    VetoEscalation => "veto_escalation",
    MultiAgentConflict => "multi_agent_conflict",
    NoClearWinner => "no_clear_winner",
});

/// Why a proposal lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    LostPriority,
    LowerScore,
    Vetoed,
    LostConsensus,
}

impl_db_str!(SuppressionReason, "suppression reason", {
    LostPriority => "lost_priority",
    LowerScore => "lower_score",
    Vetoed => "vetoed",
    LostConsensus => "lost_consensus",
});

impl SuppressionReason {
    /// Terminal proposal status a loser with this reason receives.
    pub fn proposal_status(&self) -> ProposalStatus {
        match self {
            SuppressionReason::Vetoed => ProposalStatus::Vetoed,
            _ => ProposalStatus::Suppressed,
        }
    }
}

// ============================================================================
// ADAPTATION
// ============================================================================

/// Outcome of an auto-adaptation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Applied,
    Blocked,
    Skipped,
}

impl_db_str!(AttemptResult, "attempt result", {
    Applied => "applied",
    Blocked => "blocked",
    Skipped => "skipped",
});

/// Policy check that stopped a suggestion from being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    NotOptedIn,
    ManualMode,
    CooldownActive,
    RateLimited,
    RiskNotAllowed,
    PreferenceLocked,
    ConfidenceTooLow,
    NotAdaptive,
    InvalidValue,
}

impl_db_str!(BlockReason, "block reason", {
    NotOptedIn => "not_opted_in",
    ManualMode => "manual_mode",
    CooldownActive => "cooldown_active",
    RateLimited => "rate_limited",
    RiskNotAllowed => "risk_not_allowed",
    PreferenceLocked => "preference_locked",
    ConfidenceTooLow => "confidence_too_low",
    NotAdaptive => "not_adaptive",
    InvalidValue => "invalid_value",
});

/// Reason a suggestion was not evaluated at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyProcessed,
    ValueUnchanged,
}

impl_db_str!(SkipReason, "skip reason", {
    AlreadyProcessed => "already_processed",
    ValueUnchanged => "value_unchanged",
});

/// Whether learned suggestions may be applied without a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationMode {
    #[default]
    Automatic,
    Manual,
}

impl_db_str!(AdaptationMode, "adaptation mode", {
    Automatic => "automatic",
    Manual => "manual",
});

/// Who changed a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    User,
    Learning,
    Arbitration,
    Rollback,
}

impl_db_str!(ChangeSource, "change source", {
    User => "user",
    Learning => "learning",
    Arbitration => "arbitration",
    Rollback => "rollback",
});


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_escalation_reason_parses_back(idx in 0usize..EscalationReason::ALL.len()) {
            let reason = EscalationReason::ALL[idx];
            prop_assert_eq!(EscalationReason::from_db_str(reason.as_db_str()).unwrap(), reason);
        }

        #[test]
        fn prop_only_won_reaches_executed(idx in 0usize..ProposalStatus::ALL.len()) {
            let status = ProposalStatus::ALL[idx];
            prop_assert_eq!(
                status.can_transition_to(ProposalStatus::Executed),
                status == ProposalStatus::Won
            );
        }
    }
}
