//! Adaptation policy engine
//!
//! Decides whether a learned suggestion may change a preference without a
//! human. Checks run in a fixed order and the first one that fires decides
//! the outcome; every evaluation is kept as an attempt with a frozen copy of
//! the policy that governed it.

use crate::writer::{PreferenceChange, PreferenceWriter};
use arbiter_core::{
    AdaptationMode, AdaptationPolicy, AdaptationSettings, ArbiterError, ArbiterResult,
    AttemptOutcome, AuditKind, AutoAdaptationAttempt, BlockReason, ChangeSource, DomainEvent,
    LearnedSuggestion, PreferenceChangeRecord, PreferenceDefinition, PreferenceRegistry,
    PreferenceState, PreferenceValue, RetryConfig, SkipReason, SuggestionId, Timestamp,
};
use arbiter_events::{AuditTrail, EventDispatcher};
use arbiter_storage::ArbiterStore;
use arbiter_telemetry::ObservabilityContext;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Numeric values closer than this count as unchanged.
const VALUE_TOLERANCE: f64 = 1e-9;

// ============================================================================
// EVALUATION
// ============================================================================

/// Everything the check chain looks at besides the policy.
#[derive(Debug, Clone)]
pub struct Evaluation<'a> {
    pub suggestion: &'a LearnedSuggestion,
    /// An attempt already exists for this suggestion.
    pub already_attempted: bool,
    pub definition: &'a PreferenceDefinition,
    pub current: &'a PreferenceState,
    pub last_change_at: Option<Timestamp>,
    /// Automatic applies inside the policy's rate window.
    pub applied_in_window: u32,
}

/// Run the check chain. Pure: the same inputs always give the same outcome.
pub fn evaluate(
    policy: &AdaptationPolicy,
    input: &Evaluation<'_>,
    now: Timestamp,
) -> AttemptOutcome {
    let suggestion = input.suggestion;
    let definition = input.definition;

    if suggestion.processed || input.already_attempted {
        return AttemptOutcome::Skipped(SkipReason::AlreadyProcessed);
    }
    if input
        .current
        .value
        .equivalent(&suggestion.suggested_value, VALUE_TOLERANCE)
    {
        return AttemptOutcome::Skipped(SkipReason::ValueUnchanged);
    }
    if !policy.user_opted_in {
        return AttemptOutcome::Blocked(BlockReason::NotOptedIn);
    }
    if policy.mode == AdaptationMode::Manual {
        return AttemptOutcome::Blocked(BlockReason::ManualMode);
    }
    if let Some(changed_at) = input.last_change_at {
        if now - changed_at < policy.cooldown() {
            return AttemptOutcome::Blocked(BlockReason::CooldownActive);
        }
    }
    if input.applied_in_window >= policy.rate_limit.max_applies {
        return AttemptOutcome::Blocked(BlockReason::RateLimited);
    }
    if !policy.allows_risk(definition.risk_level) {
        return AttemptOutcome::Blocked(BlockReason::RiskNotAllowed);
    }
    if input.current.locked {
        return AttemptOutcome::Blocked(BlockReason::PreferenceLocked);
    }
    if !policy
        .thresholds
        .passes(definition.risk_level, suggestion.confidence)
    {
        return AttemptOutcome::Blocked(BlockReason::ConfidenceTooLow);
    }
    if !definition.adaptive {
        return AttemptOutcome::Blocked(BlockReason::NotAdaptive);
    }
    if !value_fits(definition, &suggestion.suggested_value) {
        return AttemptOutcome::Blocked(BlockReason::InvalidValue);
    }
    AttemptOutcome::Applied
}

/// Allowed by the registry and of the same kind as the default.
fn value_fits(definition: &PreferenceDefinition, value: &PreferenceValue) -> bool {
    std::mem::discriminant(value) == std::mem::discriminant(&definition.default_value)
        && definition.allows(value)
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct AdaptationPolicyEngine<S> {
    store: Arc<S>,
    registry: Arc<PreferenceRegistry>,
    defaults: AdaptationSettings,
    writer: PreferenceWriter<S>,
    dispatcher: Arc<EventDispatcher>,
    observability: ObservabilityContext,
    /// Cooldown and rate limit are read-then-write, so evaluations run one
    /// at a time.
    serial: Mutex<()>,
}

impl<S: ArbiterStore + 'static> AdaptationPolicyEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<PreferenceRegistry>,
        defaults: AdaptationSettings,
        dispatcher: Arc<EventDispatcher>,
        observability: ObservabilityContext,
        retry: RetryConfig,
    ) -> Self {
        Self {
            writer: PreferenceWriter::new(store.clone(), retry),
            store,
            registry,
            defaults,
            dispatcher,
            observability,
            serial: Mutex::new(()),
        }
    }

    /// The stored policy, or one built from the configured defaults.
    pub async fn current_policy(&self, now: Timestamp) -> ArbiterResult<AdaptationPolicy> {
        Ok(self
            .store
            .adaptation_policy_get()
            .await?
            .unwrap_or_else(|| self.defaults.to_policy(now)))
    }

    pub async fn update_policy(&self, policy: &AdaptationPolicy) -> ArbiterResult<()> {
        policy.validate()?;
        self.store.adaptation_policy_save(policy).await?;
        info!(
            policy_id = %policy.policy_id,
            opted_in = policy.user_opted_in,
            mode = %policy.mode,
            "Adaptation policy updated"
        );
        Ok(())
    }

    /// Evaluate one stored suggestion and record the attempt.
    pub async fn process_suggestion(
        &self,
        suggestion_id: SuggestionId,
        now: Timestamp,
    ) -> ArbiterResult<AutoAdaptationAttempt> {
        let _guard = self.serial.lock().await;
        let suggestion = self
            .store
            .suggestion_get(suggestion_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("suggestion", suggestion_id))?;
        self.evaluate_and_record(&suggestion, now).await
    }

    /// Evaluate every unprocessed suggestion in creation order.
    pub async fn process_pending(
        &self,
        now: Timestamp,
    ) -> ArbiterResult<Vec<AutoAdaptationAttempt>> {
        let _guard = self.serial.lock().await;
        let pending = self.store.suggestion_list_pending().await?;
        let mut attempts = Vec::with_capacity(pending.len());
        for suggestion in &pending {
            attempts.push(self.evaluate_and_record(suggestion, now).await?);
        }
        debug!(count = attempts.len(), "Processed pending suggestions");
        Ok(attempts)
    }

    async fn evaluate_and_record(
        &self,
        suggestion: &LearnedSuggestion,
        now: Timestamp,
    ) -> ArbiterResult<AutoAdaptationAttempt> {
        let category = &suggestion.category;
        let key = &suggestion.key;
        let policy = self.current_policy(now).await?;
        let definition = self.registry.require(category, key)?;

        let stored = self.store.preference_get(category, key).await?;
        let current = stored
            .clone()
            .unwrap_or_else(|| PreferenceState::from_default(definition, now));
        let already_attempted = self
            .store
            .attempt_find_by_suggestion(suggestion.suggestion_id)
            .await?
            .is_some();
        let last_change_at = self
            .store
            .preference_last_change(category, key)
            .await?
            .map(|r| r.changed_at);
        let applied_in_window = self
            .store
            .attempt_count_applied_since(now - policy.rate_limit.window())
            .await?;

        let outcome = evaluate(
            &policy,
            &Evaluation {
                suggestion,
                already_attempted,
                definition,
                current: &current,
                last_change_at,
                applied_in_window,
            },
            now,
        );
        let attempt = AutoAdaptationAttempt::new(
            suggestion,
            Some(current.value.clone()),
            definition.risk_level,
            outcome,
            policy.snapshot(now),
            now,
        );

        if outcome == AttemptOutcome::Applied {
            self.apply(suggestion, &attempt, stored, current, now).await?;
        } else {
            let draft = self.attempt_draft(&attempt, now)?;
            self.writer.record_attempt(&attempt, &draft).await?;
        }

        if !suggestion.processed {
            self.store
                .suggestion_mark_processed(suggestion.suggestion_id)
                .await?;
        }
        self.announce(&attempt, now);
        Ok(attempt)
    }

    async fn apply(
        &self,
        suggestion: &LearnedSuggestion,
        attempt: &AutoAdaptationAttempt,
        stored: Option<PreferenceState>,
        current: PreferenceState,
        now: Timestamp,
    ) -> ArbiterResult<()> {
        let mut after = current.clone();
        after.value = suggestion.suggested_value.clone();
        after.updated_at = now;

        let change = PreferenceChange {
            before: stored,
            record: PreferenceChangeRecord::new(
                &suggestion.agent_name,
                &suggestion.preference_key(),
                Some(current.value),
                suggestion.suggested_value.clone(),
                ChangeSource::Learning,
                format!("suggestion {}: {}", suggestion.suggestion_id, suggestion.rationale),
                now,
            ),
            audit: self.attempt_draft(attempt, now)?,
            attempt: Some(attempt.clone()),
            after,
        };
        self.writer.write(&change).await?;
        Ok(())
    }

    fn attempt_draft(
        &self,
        attempt: &AutoAdaptationAttempt,
        now: Timestamp,
    ) -> ArbiterResult<arbiter_core::AuditDraft> {
        let summary = match attempt.outcome.reason_code() {
            Some(reason) => format!(
                "{} suggestion for {}/{} {}: {}",
                attempt.agent_name,
                attempt.category,
                attempt.key,
                attempt.result(),
                reason
            ),
            None => format!(
                "{} changed {}/{} to {}",
                attempt.agent_name, attempt.category, attempt.key, attempt.suggested_value
            ),
        };
        AuditTrail::draft(
            AuditKind::AdaptationAttempted,
            attempt.attempt_id,
            summary,
            attempt,
            now,
        )
    }

    fn announce(&self, attempt: &AutoAdaptationAttempt, now: Timestamp) {
        let metrics = &self.observability.metrics;
        let payload = match attempt.outcome {
            AttemptOutcome::Applied => {
                info!(
                    attempt_id = %attempt.attempt_id,
                    agent = %attempt.agent_name,
                    category = %attempt.category,
                    key = %attempt.key,
                    value = %attempt.suggested_value,
                    "Suggestion applied automatically"
                );
                metrics.record_suggestion_approved();
                DomainEvent::PreferenceAutoApplied {
                    attempt_id: attempt.attempt_id,
                    agent_name: attempt.agent_name.clone(),
                    category: attempt.category.clone(),
                    key: attempt.key.clone(),
                    previous_value: attempt.previous_value.clone(),
                    new_value: attempt.suggested_value.clone(),
                }
            }
            AttemptOutcome::Blocked(reason) => {
                info!(
                    attempt_id = %attempt.attempt_id,
                    agent = %attempt.agent_name,
                    category = %attempt.category,
                    key = %attempt.key,
                    reason = %reason,
                    "Suggestion blocked"
                );
                metrics.record_suggestion_rejected(reason.as_db_str());
                DomainEvent::PreferenceAutoBlocked {
                    attempt_id: attempt.attempt_id,
                    agent_name: attempt.agent_name.clone(),
                    category: attempt.category.clone(),
                    key: attempt.key.clone(),
                    reason,
                }
            }
            AttemptOutcome::Skipped(reason) => {
                debug!(
                    attempt_id = %attempt.attempt_id,
                    category = %attempt.category,
                    key = %attempt.key,
                    reason = %reason,
                    "Suggestion skipped"
                );
                metrics.record_suggestion_rejected(reason.as_db_str());
                DomainEvent::PreferenceAutoSkipped {
                    attempt_id: attempt.attempt_id,
                    agent_name: attempt.agent_name.clone(),
                    category: attempt.category.clone(),
                    key: attempt.key.clone(),
                    reason,
                }
            }
        };
        self.dispatcher.publish(payload, now);
    }
}

impl<S> std::fmt::Debug for AdaptationPolicyEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptationPolicyEngine")
            .field("preferences", &self.registry.len())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{PreferenceKey, RiskLevel};
    use chrono::{Duration, Utc};

    fn definition(risk_level: RiskLevel) -> PreferenceDefinition {
        PreferenceDefinition {
            category: "coaching".to_string(),
            key: "tone".to_string(),
            risk_level,
            allowed_values: vec!["gentle".into(), "direct".into()],
            default_value: "gentle".into(),
            adaptive: true,
        }
    }

    fn state(value: &str) -> PreferenceState {
        PreferenceState {
            category: "coaching".to_string(),
            key: "tone".to_string(),
            value: value.into(),
            locked: false,
            updated_at: Utc::now(),
        }
    }

    fn suggestion(value: &str, confidence: f64) -> LearnedSuggestion {
        LearnedSuggestion::new(
            "coach",
            &PreferenceKey::new("coaching", "tone"),
            value.into(),
            confidence,
            "user ignores gentle reminders",
            Utc::now(),
        )
        .unwrap()
    }

    fn opted_in() -> AdaptationPolicy {
        AdaptationPolicy {
            user_opted_in: true,
            ..AdaptationPolicy::new(Utc::now())
        }
    }

    fn run(
        policy: &AdaptationPolicy,
        suggestion: &LearnedSuggestion,
        definition: &PreferenceDefinition,
        current: &PreferenceState,
    ) -> AttemptOutcome {
        evaluate(
            policy,
            &Evaluation {
                suggestion,
                already_attempted: false,
                definition,
                current,
                last_change_at: None,
                applied_in_window: 0,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_confident_suggestion_applies() {
        let outcome = run(
            &opted_in(),
            &suggestion("direct", 0.9),
            &definition(RiskLevel::Medium),
            &state("gentle"),
        );
        assert_eq!(outcome, AttemptOutcome::Applied);
    }

    #[test]
    fn test_medium_risk_needs_085() {
        let def = definition(RiskLevel::Medium);
        let current = state("gentle");
        assert_eq!(
            run(&opted_in(), &suggestion("direct", 0.6), &def, &current),
            AttemptOutcome::Blocked(BlockReason::ConfidenceTooLow)
        );
        assert_eq!(
            run(&opted_in(), &suggestion("direct", 0.85), &def, &current),
            AttemptOutcome::Applied
        );
    }

    #[test]
    fn test_high_risk_needs_full_confidence() {
        let policy = AdaptationPolicy {
            allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High],
            ..opted_in()
        };
        let def = definition(RiskLevel::High);
        let current = state("gentle");
        assert_eq!(
            run(&policy, &suggestion("direct", 0.99), &def, &current),
            AttemptOutcome::Blocked(BlockReason::ConfidenceTooLow)
        );
        assert_eq!(
            run(&policy, &suggestion("direct", 1.0), &def, &current),
            AttemptOutcome::Applied
        );
    }

    #[test]
    fn test_mismatched_kind_is_invalid() {
        let outcome = run(
            &opted_in(),
            &LearnedSuggestion::new(
                "coach",
                &PreferenceKey::new("coaching", "tone"),
                PreferenceValue::Flag(true),
                0.95,
                "guess",
                Utc::now(),
            )
            .unwrap(),
            &PreferenceDefinition {
                allowed_values: vec![],
                ..definition(RiskLevel::Low)
            },
            &state("gentle"),
        );
        assert_eq!(outcome, AttemptOutcome::Blocked(BlockReason::InvalidValue));
    }

    /// Start from an input that trips every check, then clear them one at a
    /// time. Each step must surface the next reason in the chain.
    #[test]
    fn test_checks_fire_in_order() {
        let now = Utc::now();
        let mut policy = AdaptationPolicy {
            user_opted_in: false,
            mode: AdaptationMode::Manual,
            allowed_risk_levels: vec![RiskLevel::Low],
            ..AdaptationPolicy::new(now)
        };
        let mut def = PreferenceDefinition {
            adaptive: false,
            ..definition(RiskLevel::Medium)
        };
        let mut current = PreferenceState {
            locked: true,
            ..state("gentle")
        };
        let mut s = suggestion("sarcastic", 0.5);
        s.processed = true;
        let mut last_change_at = Some(now - Duration::minutes(5));
        let mut applied_in_window = policy.rate_limit.max_applies;

        let mut seen = Vec::new();
        loop {
            let outcome = evaluate(
                &policy,
                &Evaluation {
                    suggestion: &s,
                    already_attempted: false,
                    definition: &def,
                    current: &current,
                    last_change_at,
                    applied_in_window,
                },
                now,
            );
            seen.push(outcome);
            match outcome {
                AttemptOutcome::Applied => break,
                AttemptOutcome::Skipped(SkipReason::AlreadyProcessed) => s.processed = false,
                AttemptOutcome::Skipped(SkipReason::ValueUnchanged) => unreachable!(),
                AttemptOutcome::Blocked(reason) => match reason {
                    BlockReason::NotOptedIn => policy.user_opted_in = true,
                    BlockReason::ManualMode => policy.mode = AdaptationMode::Automatic,
                    BlockReason::CooldownActive => last_change_at = None,
                    BlockReason::RateLimited => applied_in_window = 0,
                    BlockReason::RiskNotAllowed => {
                        policy.allowed_risk_levels.push(RiskLevel::Medium)
                    }
                    BlockReason::PreferenceLocked => current.locked = false,
                    BlockReason::ConfidenceTooLow => s.confidence = 0.9,
                    BlockReason::NotAdaptive => def.adaptive = true,
                    BlockReason::InvalidValue => s.suggested_value = "direct".into(),
                },
            }
        }

        assert_eq!(
            seen,
            vec![
                AttemptOutcome::Skipped(SkipReason::AlreadyProcessed),
                AttemptOutcome::Blocked(BlockReason::NotOptedIn),
                AttemptOutcome::Blocked(BlockReason::ManualMode),
                AttemptOutcome::Blocked(BlockReason::CooldownActive),
                AttemptOutcome::Blocked(BlockReason::RateLimited),
                AttemptOutcome::Blocked(BlockReason::RiskNotAllowed),
                AttemptOutcome::Blocked(BlockReason::PreferenceLocked),
                AttemptOutcome::Blocked(BlockReason::ConfidenceTooLow),
                AttemptOutcome::Blocked(BlockReason::NotAdaptive),
                AttemptOutcome::Blocked(BlockReason::InvalidValue),
                AttemptOutcome::Applied,
            ]
        );
    }

    #[test]
    fn test_unchanged_value_is_skipped_before_policy() {
        let policy = AdaptationPolicy::new(Utc::now());
        let outcome = run(
            &policy,
            &suggestion("gentle", 0.1),
            &definition(RiskLevel::Medium),
            &state("gentle"),
        );
        assert_eq!(outcome, AttemptOutcome::Skipped(SkipReason::ValueUnchanged));
    }

    #[test]
    fn test_cooldown_expires() {
        let now = Utc::now();
        let policy = opted_in();
        let s = suggestion("direct", 0.9);
        let def = definition(RiskLevel::Medium);
        let current = state("gentle");
        let outcome = evaluate(
            &policy,
            &Evaluation {
                suggestion: &s,
                already_attempted: false,
                definition: &def,
                current: &current,
                last_change_at: Some(now - policy.cooldown() - Duration::seconds(1)),
                applied_in_window: 0,
            },
            now,
        );
        assert_eq!(outcome, AttemptOutcome::Applied);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            /// Nothing applies without opt-in.
            #[test]
            fn prop_opt_out_never_applies(confidence in 0.0f64..=1.0, direct in any::<bool>()) {
                let policy = AdaptationPolicy::new(Utc::now());
                let value = if direct { "direct" } else { "gentle" };
                let outcome = run(
                    &policy,
                    &suggestion(value, confidence),
                    &definition(RiskLevel::Low),
                    &state("gentle"),
                );
                prop_assert_ne!(outcome, AttemptOutcome::Applied);
            }

            /// An applied outcome always clears the risk threshold.
            #[test]
            fn prop_applied_clears_threshold(confidence in 0.0f64..=1.0, risk in 0usize..3) {
                let risk = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High][risk];
                let policy = AdaptationPolicy {
                    allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium, RiskLevel::High],
                    ..opted_in()
                };
                let outcome = run(
                    &policy,
                    &suggestion("direct", confidence),
                    &definition(risk),
                    &state("gentle"),
                );
                if outcome == AttemptOutcome::Applied {
                    prop_assert!(confidence >= policy.thresholds.for_risk(risk));
                }
            }
        }
    }
}
