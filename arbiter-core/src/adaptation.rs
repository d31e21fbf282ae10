//! Adaptation policy, learned suggestions and auto-adaptation attempts

use crate::{
    compute_content_hash, AdaptationMode, ArbiterError, ArbiterResult, AttemptId, AttemptResult,
    BlockReason, EntityIdType, FeedbackId, PatternId, PolicyId, PreferenceKey, PreferenceValue,
    RiskLevel, SkipReason, SuggestionId, Timestamp,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

// ============================================================================
// POLICY
// ============================================================================

/// Minimum confidence per preference risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    pub low: f64,
    pub medium: f64,
    /// 1.0 means only a certain suggestion can change a high-risk preference.
    pub high: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            low: 0.70,
            medium: 0.85,
            high: 1.0,
        }
    }
}

impl ConfidenceThresholds {
    pub fn for_risk(&self, risk: RiskLevel) -> f64 {
        match risk {
            RiskLevel::Low => self.low,
            RiskLevel::Medium => self.medium,
            RiskLevel::High => self.high,
        }
    }

    pub fn passes(&self, risk: RiskLevel, confidence: f64) -> bool {
        confidence >= self.for_risk(risk)
    }
}

/// Rolling window cap on automatic applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_applies: u32,
    pub window_minutes: i64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_applies: 5,
            window_minutes: 24 * 60,
        }
    }
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::minutes(self.window_minutes)
    }
}

/// User-facing rules for automatic preference changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationPolicy {
    pub policy_id: PolicyId,
    pub user_opted_in: bool,
    pub mode: AdaptationMode,
    /// Minimum time between two changes of the same preference.
    pub cooldown_minutes: i64,
    pub rate_limit: RateLimit,
    pub allowed_risk_levels: Vec<RiskLevel>,
    pub thresholds: ConfidenceThresholds,
    pub updated_at: Timestamp,
}

impl AdaptationPolicy {
    pub fn new(now: Timestamp) -> Self {
        Self {
            policy_id: PolicyId::now_v7(),
            user_opted_in: false,
            mode: AdaptationMode::Automatic,
            cooldown_minutes: 60,
            rate_limit: RateLimit::default(),
            allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium],
            thresholds: ConfidenceThresholds::default(),
            updated_at: now,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.cooldown_minutes)
    }

    pub fn allows_risk(&self, risk: RiskLevel) -> bool {
        self.allowed_risk_levels.contains(&risk)
    }

    pub fn validate(&self) -> ArbiterResult<()> {
        if self.cooldown_minutes < 0 {
            return Err(ArbiterError::invalid_value("cooldown_minutes", "must be non-negative"));
        }
        if self.rate_limit.window_minutes <= 0 {
            return Err(ArbiterError::invalid_value(
                "rate_limit.window_minutes",
                "must be positive",
            ));
        }
        let t = &self.thresholds;
        for (field, value) in [("low", t.low), ("medium", t.medium), ("high", t.high)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ArbiterError::invalid_value(
                    format!("thresholds.{}", field),
                    "must be within [0, 1]",
                ));
            }
        }
        Ok(())
    }

    /// Freeze the policy for storage with an attempt.
    pub fn snapshot(&self, now: Timestamp) -> PolicySnapshot {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        PolicySnapshot {
            policy: self.clone(),
            fingerprint: hex::encode(compute_content_hash(&bytes)),
            captured_at: now,
        }
    }
}

/// Frozen copy of the policy that governed an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub policy: AdaptationPolicy,
    pub fingerprint: String,
    pub captured_at: Timestamp,
}

// ============================================================================
// LEARNING INPUTS
// ============================================================================

/// A preference change proposed by learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedSuggestion {
    pub suggestion_id: SuggestionId,
    pub agent_name: String,
    pub category: String,
    pub key: String,
    pub suggested_value: PreferenceValue,
    pub confidence: f64,
    pub rationale: String,
    pub processed: bool,
    pub created_at: Timestamp,
}

impl LearnedSuggestion {
    pub fn new(
        agent_name: impl Into<String>,
        key: &PreferenceKey,
        suggested_value: PreferenceValue,
        confidence: f64,
        rationale: impl Into<String>,
        now: Timestamp,
    ) -> ArbiterResult<Self> {
        let agent_name = agent_name.into();
        if agent_name.trim().is_empty() {
            return Err(ArbiterError::missing_field("agent_name"));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ArbiterError::invalid_value(
                "confidence",
                format!("must be within [0, 1], got {}", confidence),
            ));
        }
        Ok(Self {
            suggestion_id: SuggestionId::now_v7(),
            agent_name,
            category: key.category.clone(),
            key: key.key.clone(),
            suggested_value,
            confidence,
            rationale: rationale.into(),
            processed: false,
            created_at: now,
        })
    }

    pub fn preference_key(&self) -> PreferenceKey {
        PreferenceKey::new(&self.category, &self.key)
    }
}

/// Explicit user feedback about an agent's behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub feedback_id: FeedbackId,
    pub agent_name: String,
    pub category: String,
    pub key: Option<String>,
    /// -1.0 (negative) to 1.0 (positive).
    pub sentiment: f64,
    pub comment: Option<String>,
    pub created_at: Timestamp,
}

impl FeedbackSignal {
    pub fn new(
        agent_name: impl Into<String>,
        category: impl Into<String>,
        sentiment: f64,
        now: Timestamp,
    ) -> ArbiterResult<Self> {
        if !(-1.0..=1.0).contains(&sentiment) {
            return Err(ArbiterError::invalid_value("sentiment", "must be within [-1, 1]"));
        }
        Ok(Self {
            feedback_id: FeedbackId::now_v7(),
            agent_name: agent_name.into(),
            category: category.into(),
            key: None,
            sentiment,
            comment: None,
            created_at: now,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A repeated behaviour that hints at a preferred value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPattern {
    pub pattern_id: PatternId,
    pub agent_name: String,
    pub category: String,
    pub key: String,
    pub observed_value: PreferenceValue,
    pub occurrences: u32,
    pub confidence: f64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

// ============================================================================
// ATTEMPTS
// ============================================================================

/// Result of evaluating a suggestion. Block and skip reasons live inside
/// their variant so an attempt carries exactly the reason its result needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Applied,
    Blocked(BlockReason),
    Skipped(SkipReason),
}

impl AttemptOutcome {
    pub fn result(&self) -> AttemptResult {
        match self {
            AttemptOutcome::Applied => AttemptResult::Applied,
            AttemptOutcome::Blocked(_) => AttemptResult::Blocked,
            AttemptOutcome::Skipped(_) => AttemptResult::Skipped,
        }
    }

    pub fn block_reason(&self) -> Option<BlockReason> {
        match self {
            AttemptOutcome::Blocked(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            AttemptOutcome::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Machine-readable reason code, if any.
    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            AttemptOutcome::Applied => None,
            AttemptOutcome::Blocked(r) => Some(r.as_db_str()),
            AttemptOutcome::Skipped(r) => Some(r.as_db_str()),
        }
    }
}

/// Record of one governed suggestion, kept whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoAdaptationAttempt {
    pub attempt_id: AttemptId,
    pub agent_name: String,
    pub suggestion_id: SuggestionId,
    pub category: String,
    pub key: String,
    pub previous_value: Option<PreferenceValue>,
    pub suggested_value: PreferenceValue,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub outcome: AttemptOutcome,
    pub rolled_back: bool,
    pub rolled_back_at: Option<Timestamp>,
    pub rollback_reason: Option<String>,
    pub policy_id: PolicyId,
    pub policy_snapshot: PolicySnapshot,
    pub attempted_at: Timestamp,
}

impl AutoAdaptationAttempt {
    pub fn new(
        suggestion: &LearnedSuggestion,
        previous_value: Option<PreferenceValue>,
        risk_level: RiskLevel,
        outcome: AttemptOutcome,
        policy_snapshot: PolicySnapshot,
        now: Timestamp,
    ) -> Self {
        Self {
            attempt_id: AttemptId::now_v7(),
            agent_name: suggestion.agent_name.clone(),
            suggestion_id: suggestion.suggestion_id,
            category: suggestion.category.clone(),
            key: suggestion.key.clone(),
            previous_value,
            suggested_value: suggestion.suggested_value.clone(),
            confidence: suggestion.confidence,
            risk_level,
            outcome,
            rolled_back: false,
            rolled_back_at: None,
            rollback_reason: None,
            policy_id: policy_snapshot.policy.policy_id,
            policy_snapshot,
            attempted_at: now,
        }
    }

    pub fn result(&self) -> AttemptResult {
        self.outcome.result()
    }

    pub fn preference_key(&self) -> PreferenceKey {
        PreferenceKey::new(&self.category, &self.key)
    }

    /// Applied and not yet reverted.
    pub fn is_active(&self) -> bool {
        self.outcome == AttemptOutcome::Applied && !self.rolled_back
    }

    pub fn mark_rolled_back(&mut self, reason: impl Into<String>, now: Timestamp) -> ArbiterResult<()> {
        if self.outcome != AttemptOutcome::Applied {
            return Err(ArbiterError::invalid_state(
                "attempt",
                self.attempt_id,
                format!("only applied attempts can be rolled back, result is {}", self.result()),
            ));
        }
        if self.rolled_back {
            return Err(ArbiterError::invalid_state(
                "attempt",
                self.attempt_id,
                "already rolled back",
            ));
        }
        self.rolled_back = true;
        self.rolled_back_at = Some(now);
        self.rollback_reason = Some(reason.into());
        Ok(())
    }
}
