//! Arbitration policies
//!
//! A policy is immutable once registered. Decisions reference it by id, so a
//! change in behaviour means registering a new policy.

use crate::{
    compute_content_hash, ActionType, ArbiterError, ArbiterResult, EntityIdType, PolicyId,
    PolicyScope, PreferenceValue, Proposal, ResolutionStrategy, RiskLevel, TargetType, Timestamp,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ============================================================================
// SCOPE
// ============================================================================

/// What a policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum PolicySubject {
    Default,
    Agent { agent_name: String },
    Preference { category: String, key: String },
}

impl PolicySubject {
    pub fn scope(&self) -> PolicyScope {
        match self {
            PolicySubject::Default => PolicyScope::Default,
            PolicySubject::Agent { .. } => PolicyScope::Agent,
            PolicySubject::Preference { .. } => PolicyScope::Preference,
        }
    }
}

// ============================================================================
// RULES
// ============================================================================

/// Predicate removing a proposal from contention. All set criteria must
/// match; a rule without criteria is rejected at validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VetoRule {
    pub name: String,
    /// Regular expression over the agent name.
    pub agent_pattern: Option<String>,
    pub action_type: Option<ActionType>,
    pub target_type: Option<TargetType>,
    pub min_risk: Option<RiskLevel>,
    pub confidence_below: Option<f64>,
    pub cost_above: Option<f64>,
}

impl VetoRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_agent_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.agent_pattern = Some(pattern.into());
        self
    }

    pub fn with_action_type(mut self, action_type: ActionType) -> Self {
        self.action_type = Some(action_type);
        self
    }

    pub fn with_min_risk(mut self, risk: RiskLevel) -> Self {
        self.min_risk = Some(risk);
        self
    }

    pub fn with_confidence_below(mut self, threshold: f64) -> Self {
        self.confidence_below = Some(threshold);
        self
    }

    pub fn with_cost_above(mut self, threshold: f64) -> Self {
        self.cost_above = Some(threshold);
        self
    }

    fn has_criteria(&self) -> bool {
        self.agent_pattern.is_some()
            || self.action_type.is_some()
            || self.target_type.is_some()
            || self.min_risk.is_some()
            || self.confidence_below.is_some()
            || self.cost_above.is_some()
    }

    pub fn matches(&self, proposal: &Proposal) -> bool {
        if !self.has_criteria() {
            return false;
        }
        if let Some(pattern) = &self.agent_pattern {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&proposal.agent_name) => {}
                _ => return false,
            }
        }
        if self.action_type.is_some_and(|t| t != proposal.action_type()) {
            return false;
        }
        if self.target_type.is_some_and(|t| t != proposal.target.target_type) {
            return false;
        }
        if self.min_risk.is_some_and(|r| proposal.risk_level < r) {
            return false;
        }
        if self
            .confidence_below
            .is_some_and(|c| proposal.confidence_or_zero() >= c)
        {
            return false;
        }
        if self.cost_above.is_some_and(|c| proposal.cost_estimate <= c) {
            return false;
        }
        true
    }
}

/// Thresholds that hand a conflict to a human before any strategy runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EscalationThresholds {
    /// Escalate when any contender's risk is at or above this level.
    pub escalate_at_risk: Option<RiskLevel>,
    /// Escalate when any contender's cost exceeds this.
    pub max_cost: Option<f64>,
    /// Escalate when any contender's confidence is below this.
    pub min_confidence: Option<f64>,
    pub always_escalate_agents: Vec<String>,
    /// Escalate when more distinct agents than this compete.
    pub max_agents: Option<usize>,
    pub escalate_on_veto: bool,
}

/// Weights of the weighted strategy:
/// `confidence_weight * confidence - cost_weight * cost / cost_scale - risk_penalty(risk)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedScoring {
    pub confidence_weight: f64,
    pub cost_weight: f64,
    pub cost_scale: f64,
    pub low_risk_penalty: f64,
    pub medium_risk_penalty: f64,
    pub high_risk_penalty: f64,
    /// Scores closer than this count as a tie.
    pub tie_epsilon: f64,
}

impl Default for WeightedScoring {
    fn default() -> Self {
        Self {
            confidence_weight: 1.0,
            cost_weight: 0.2,
            cost_scale: 10.0,
            low_risk_penalty: 0.0,
            medium_risk_penalty: 0.1,
            high_risk_penalty: 0.3,
            tie_epsilon: 1e-9,
        }
    }
}

impl WeightedScoring {
    pub fn risk_penalty(&self, risk: RiskLevel) -> f64 {
        match risk {
            RiskLevel::Low => self.low_risk_penalty,
            RiskLevel::Medium => self.medium_risk_penalty,
            RiskLevel::High => self.high_risk_penalty,
        }
    }

    pub fn score(&self, proposal: &Proposal) -> f64 {
        self.confidence_weight * proposal.confidence_or_zero()
            - self.cost_weight * proposal.cost_estimate / self.cost_scale
            - self.risk_penalty(proposal.risk_level)
    }
}

/// Agreement requirements of the consensus strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRule {
    /// Distinct agents that must back equivalent actions.
    pub quorum: usize,
    /// Absolute tolerance when comparing numeric values (minutes for times).
    pub tolerance: f64,
}

impl Default for ConsensusRule {
    fn default() -> Self {
        Self {
            quorum: 2,
            tolerance: 0.0,
        }
    }
}

/// Values on a target that exclude each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusiveValues {
    pub target_type: TargetType,
    pub key: Option<String>,
    pub values: Vec<PreferenceValue>,
}

/// Targets that can absorb at most `capacity` proposals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLimit {
    pub target_type: TargetType,
    /// Limits every target of the type when empty.
    pub target_id: Option<String>,
    pub capacity: usize,
}

/// Combined cost budget a group of proposals must not exceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInvariant {
    pub name: String,
    /// Applies to every target type when empty.
    pub target_type: Option<TargetType>,
    pub max_combined_cost: f64,
}

// ============================================================================
// POLICY
// ============================================================================

/// Declarative rules for resolving conflicts on a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationPolicy {
    pub policy_id: PolicyId,
    pub name: String,
    pub subject: PolicySubject,
    pub resolution_strategy: ResolutionStrategy,
    pub veto_rules: Vec<VetoRule>,
    pub escalation: EscalationThresholds,
    pub scoring: WeightedScoring,
    pub consensus: ConsensusRule,
    pub exclusive_values: Vec<ExclusiveValues>,
    pub capacity_limits: Vec<CapacityLimit>,
    pub invariants: Vec<DomainInvariant>,
    pub created_at: Timestamp,
}

impl ArbitrationPolicy {
    pub fn new(
        name: impl Into<String>,
        subject: PolicySubject,
        resolution_strategy: ResolutionStrategy,
        now: Timestamp,
    ) -> ArbiterResult<Self> {
        let policy = Self {
            policy_id: PolicyId::now_v7(),
            name: name.into(),
            subject,
            resolution_strategy,
            veto_rules: Vec::new(),
            escalation: EscalationThresholds::default(),
            scoring: WeightedScoring::default(),
            consensus: ConsensusRule::default(),
            exclusive_values: Vec::new(),
            capacity_limits: Vec::new(),
            invariants: Vec::new(),
            created_at: now,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn scope(&self) -> PolicyScope {
        self.subject.scope()
    }

    pub fn with_veto_rule(mut self, rule: VetoRule) -> Self {
        self.veto_rules.push(rule);
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationThresholds) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_scoring(mut self, scoring: WeightedScoring) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_consensus(mut self, consensus: ConsensusRule) -> Self {
        self.consensus = consensus;
        self
    }

    pub fn with_exclusive_values(mut self, rule: ExclusiveValues) -> Self {
        self.exclusive_values.push(rule);
        self
    }

    pub fn with_capacity_limit(mut self, limit: CapacityLimit) -> Self {
        self.capacity_limits.push(limit);
        self
    }

    pub fn with_invariant(mut self, invariant: DomainInvariant) -> Self {
        self.invariants.push(invariant);
        self
    }

    /// Check the whole policy. Builders do not validate; registration does.
    pub fn validate(&self) -> ArbiterResult<()> {
        if self.name.trim().is_empty() {
            return Err(ArbiterError::missing_field("policy.name"));
        }
        match &self.subject {
            PolicySubject::Agent { agent_name } if agent_name.trim().is_empty() => {
                return Err(ArbiterError::missing_field("policy.subject.agent_name"));
            }
            PolicySubject::Preference { category, key }
                if category.trim().is_empty() || key.trim().is_empty() =>
            {
                return Err(ArbiterError::missing_field("policy.subject.key"));
            }
            _ => {}
        }
        for rule in &self.veto_rules {
            if !rule.has_criteria() {
                return Err(ArbiterError::invalid_value(
                    format!("veto_rules.{}", rule.name),
                    "a veto rule needs at least one criterion",
                ));
            }
            if let Some(pattern) = &rule.agent_pattern {
                Regex::new(pattern).map_err(|e| {
                    ArbiterError::invalid_value(format!("veto_rules.{}", rule.name), e.to_string())
                })?;
            }
        }
        if let Some(min) = self.escalation.min_confidence {
            if !(0.0..=1.0).contains(&min) {
                return Err(ArbiterError::invalid_value(
                    "escalation.min_confidence",
                    "must be within [0, 1]",
                ));
            }
        }
        let s = &self.scoring;
        let weights = [
            s.confidence_weight,
            s.cost_weight,
            s.low_risk_penalty,
            s.medium_risk_penalty,
            s.high_risk_penalty,
            s.tie_epsilon,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ArbiterError::invalid_value(
                "scoring",
                "weights must be finite and non-negative",
            ));
        }
        if !(s.cost_scale.is_finite() && s.cost_scale > 0.0) {
            return Err(ArbiterError::invalid_value("scoring.cost_scale", "must be positive"));
        }
        if self.consensus.quorum == 0 {
            return Err(ArbiterError::invalid_value("consensus.quorum", "must be at least 1"));
        }
        if !(self.consensus.tolerance.is_finite() && self.consensus.tolerance >= 0.0) {
            return Err(ArbiterError::invalid_value(
                "consensus.tolerance",
                "must be non-negative",
            ));
        }
        if self.capacity_limits.iter().any(|l| l.capacity == 0) {
            return Err(ArbiterError::invalid_value(
                "capacity_limits",
                "capacity must be at least 1",
            ));
        }
        Ok(())
    }

    /// Hex SHA-256 over the serialized policy, stored with snapshots.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(compute_content_hash(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewProposal, ProposedAction};
    use chrono::Utc;

    fn proposal(agent: &str, confidence: f64, risk: RiskLevel) -> Proposal {
        let action = ProposedAction::apply_preference("coaching", "tone", "warm".into(), None).unwrap();
        Proposal::new(
            NewProposal::new(agent, action)
                .with_confidence(confidence)
                .with_risk(risk),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_veto_rule_requires_all_criteria() {
        let rule = VetoRule::new("risky-logger")
            .with_agent_pattern("^log")
            .with_min_risk(RiskLevel::Medium);
        assert!(rule.matches(&proposal("logger", 0.9, RiskLevel::High)));
        assert!(!rule.matches(&proposal("logger", 0.9, RiskLevel::Low)));
        assert!(!rule.matches(&proposal("coach", 0.9, RiskLevel::High)));
    }

    #[test]
    fn test_empty_veto_rule_never_matches() {
        assert!(!VetoRule::new("empty").matches(&proposal("coach", 0.1, RiskLevel::High)));
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let now = Utc::now();
        let base = ArbitrationPolicy::new("p", PolicySubject::Default, ResolutionStrategy::Veto, now)
            .unwrap();
        assert!(base.clone().with_veto_rule(VetoRule::new("empty")).validate().is_err());
        assert!(base
            .clone()
            .with_veto_rule(VetoRule::new("bad").with_agent_pattern("("))
            .validate()
            .is_err());
        assert!(base
            .clone()
            .with_consensus(ConsensusRule { quorum: 0, tolerance: 0.0 })
            .validate()
            .is_err());
        assert!(ArbitrationPolicy::new(" ", PolicySubject::Default, ResolutionStrategy::Priority, now)
            .is_err());
    }

    #[test]
    fn test_weighted_score_formula() {
        let scoring = WeightedScoring::default();
        let mut p = proposal("coach", 0.8, RiskLevel::Medium);
        p.cost_estimate = 5.0;
        let expected = 0.8 - 0.2 * 5.0 / 10.0 - 0.1;
        assert!((scoring.score(&p) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let now = Utc::now();
        let a = ArbitrationPolicy::new("p", PolicySubject::Default, ResolutionStrategy::Priority, now)
            .unwrap();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.resolution_strategy = ResolutionStrategy::Weighted;
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
