//! Learning intake
//!
//! Collects feedback and observed behaviour, and turns patterns that have
//! been seen often enough into suggestions for the policy engine.

use arbiter_core::{
    ArbiterResult, EntityIdType, FeedbackSignal, LearnedSuggestion, LearningConfig,
    ObservedPattern, PatternId, PreferenceKey, PreferenceRegistry, PreferenceState,
    PreferenceValue, Timestamp,
};
use arbiter_storage::ArbiterStore;
use std::sync::Arc;
use tracing::{debug, info};

const VALUE_TOLERANCE: f64 = 1e-9;

/// How far the mean feedback sentiment can move a pattern's confidence.
const FEEDBACK_WEIGHT: f64 = 0.1;

/// Confidence after `occurrences` sightings: 3 gives 0.6, 8 gives 0.8.
pub fn pattern_confidence(occurrences: u32) -> f64 {
    let n = f64::from(occurrences);
    n / (n + 2.0)
}

/// Shift `confidence` by the mean sentiment of `feedback`.
pub fn adjust_for_feedback(confidence: f64, feedback: &[FeedbackSignal]) -> f64 {
    if feedback.is_empty() {
        return confidence;
    }
    let mean = feedback.iter().map(|f| f.sentiment).sum::<f64>() / feedback.len() as f64;
    (confidence + FEEDBACK_WEIGHT * mean).clamp(0.0, 1.0)
}

pub struct LearningIntake<S> {
    store: Arc<S>,
    registry: Arc<PreferenceRegistry>,
    config: LearningConfig,
}

impl<S: ArbiterStore + 'static> LearningIntake<S> {
    pub fn new(store: Arc<S>, registry: Arc<PreferenceRegistry>, config: LearningConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub async fn record_feedback(&self, feedback: &FeedbackSignal) -> ArbiterResult<()> {
        self.store.feedback_insert(feedback).await?;
        debug!(
            agent = %feedback.agent_name,
            category = %feedback.category,
            sentiment = feedback.sentiment,
            "Feedback recorded"
        );
        Ok(())
    }

    /// Count one sighting of `value` for a preference. Sightings of the same
    /// agent, preference and value accumulate in one pattern.
    pub async fn observe(
        &self,
        agent_name: &str,
        key: &PreferenceKey,
        value: PreferenceValue,
        now: Timestamp,
    ) -> ArbiterResult<ObservedPattern> {
        self.registry.require(&key.category, &key.key)?;

        let existing = self.store.pattern_list().await?.into_iter().find(|p| {
            p.agent_name == agent_name
                && p.category == key.category
                && p.key == key.key
                && p.observed_value.equivalent(&value, VALUE_TOLERANCE)
        });
        let pattern = match existing {
            Some(mut pattern) => {
                pattern.occurrences += 1;
                pattern.confidence = pattern_confidence(pattern.occurrences);
                pattern.last_seen = now;
                pattern
            }
            None => ObservedPattern {
                pattern_id: PatternId::now_v7(),
                agent_name: agent_name.to_string(),
                category: key.category.clone(),
                key: key.key.clone(),
                observed_value: value,
                occurrences: 1,
                confidence: pattern_confidence(1),
                first_seen: now,
                last_seen: now,
            },
        };
        self.store.pattern_save(&pattern).await?;
        Ok(pattern)
    }

    /// Store a suggestion produced elsewhere, such as an external suggester.
    pub async fn submit_suggestion(&self, suggestion: &LearnedSuggestion) -> ArbiterResult<()> {
        self.registry
            .require(&suggestion.category, &suggestion.key)?;
        self.store.suggestion_insert(suggestion).await
    }

    /// Turn mature patterns into suggestions.
    ///
    /// A pattern qualifies once it reaches `min_occurrences` and its
    /// feedback-adjusted confidence reaches `min_confidence`. Patterns that
    /// match the current value or an unprocessed suggestion are left alone.
    pub async fn derive_suggestions(&self, now: Timestamp) -> ArbiterResult<Vec<LearnedSuggestion>> {
        let mut pending = self.store.suggestion_list_pending().await?;
        let mut derived = Vec::new();

        for pattern in self.store.pattern_list().await? {
            if pattern.occurrences < self.config.min_occurrences {
                continue;
            }
            let feedback: Vec<_> = self
                .store
                .feedback_list_by_agent(&pattern.agent_name)
                .await?
                .into_iter()
                .filter(|f| {
                    f.category == pattern.category
                        && f.key.as_deref().map_or(true, |k| k == pattern.key)
                })
                .collect();
            let confidence = adjust_for_feedback(pattern.confidence, &feedback);
            if confidence < self.config.min_confidence {
                continue;
            }
            let already_pending = pending.iter().any(|s| {
                s.agent_name == pattern.agent_name
                    && s.category == pattern.category
                    && s.key == pattern.key
                    && s.suggested_value
                        .equivalent(&pattern.observed_value, VALUE_TOLERANCE)
            });
            if already_pending {
                continue;
            }
            let Some(definition) = self.registry.get(&pattern.category, &pattern.key) else {
                continue;
            };
            let current = self
                .store
                .preference_get(&pattern.category, &pattern.key)
                .await?
                .unwrap_or_else(|| PreferenceState::from_default(definition, now));
            if current
                .value
                .equivalent(&pattern.observed_value, VALUE_TOLERANCE)
            {
                continue;
            }

            let suggestion = LearnedSuggestion::new(
                &pattern.agent_name,
                &PreferenceKey::new(&pattern.category, &pattern.key),
                pattern.observed_value.clone(),
                confidence,
                format!(
                    "observed {} times since {}",
                    pattern.occurrences,
                    pattern.first_seen.to_rfc3339()
                ),
                now,
            )?;
            self.store.suggestion_insert(&suggestion).await?;
            pending.push(suggestion.clone());
            derived.push(suggestion);
        }

        if !derived.is_empty() {
            info!(count = derived.len(), "Derived suggestions from observed patterns");
        }
        Ok(derived)
    }
}

impl<S> std::fmt::Debug for LearningIntake<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearningIntake")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::PreferenceDefinition;
    use arbiter_storage::{AttemptRepository, MemoryStore};
    use chrono::{Duration, Utc};

    fn registry() -> Arc<PreferenceRegistry> {
        Arc::new(
            PreferenceRegistry::from_definitions(vec![PreferenceDefinition {
                category: "schedule".to_string(),
                key: "focus_minutes".to_string(),
                risk_level: arbiter_core::RiskLevel::Low,
                allowed_values: vec![],
                default_value: 25i64.into(),
                adaptive: true,
            }])
            .unwrap(),
        )
    }

    fn intake(store: &MemoryStore) -> LearningIntake<MemoryStore> {
        LearningIntake::new(Arc::new(store.clone()), registry(), LearningConfig::default())
    }

    fn focus() -> PreferenceKey {
        PreferenceKey::new("schedule", "focus_minutes")
    }

    #[test]
    fn test_pattern_confidence_grows() {
        assert!((pattern_confidence(3) - 0.6).abs() < 1e-9);
        assert!(pattern_confidence(10) > pattern_confidence(3));
        assert!(pattern_confidence(1000) < 1.0);
    }

    #[test]
    fn test_feedback_adjustment_is_clamped() {
        let now = Utc::now();
        let praise = vec![FeedbackSignal::new("planner", "schedule", 1.0, now).unwrap()];
        assert!((adjust_for_feedback(0.6, &praise) - 0.7).abs() < 1e-9);
        assert_eq!(adjust_for_feedback(0.95, &praise), 1.0);
        assert_eq!(adjust_for_feedback(0.5, &[]), 0.5);
    }

    #[tokio::test]
    async fn test_observations_accumulate() {
        let store = MemoryStore::new();
        let intake = intake(&store);
        let now = Utc::now();
        for i in 0..3 {
            intake
                .observe("planner", &focus(), 50i64.into(), now + Duration::minutes(i))
                .await
                .unwrap();
        }
        intake.observe("planner", &focus(), 45i64.into(), now).await.unwrap();

        let patterns = store.pattern_list().await.unwrap();
        assert_eq!(patterns.len(), 2);
        let fifty = patterns
            .iter()
            .find(|p| p.observed_value == PreferenceValue::Integer(50))
            .unwrap();
        assert_eq!(fifty.occurrences, 3);
        assert_eq!(fifty.last_seen, now + Duration::minutes(2));
    }

    #[tokio::test]
    async fn test_unregistered_preference_is_rejected() {
        let store = MemoryStore::new();
        let result = intake(&store)
            .observe("planner", &PreferenceKey::new("nope", "nope"), 1i64.into(), Utc::now())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mature_pattern_becomes_one_suggestion() {
        let store = MemoryStore::new();
        let intake = intake(&store);
        let now = Utc::now();
        for _ in 0..2 {
            intake.observe("planner", &focus(), 50i64.into(), now).await.unwrap();
        }
        assert!(intake.derive_suggestions(now).await.unwrap().is_empty());

        intake.observe("planner", &focus(), 50i64.into(), now).await.unwrap();
        let derived = intake.derive_suggestions(now).await.unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].suggested_value, PreferenceValue::Integer(50));
        assert!((derived[0].confidence - 0.6).abs() < 1e-9);

        // Already pending, so not derived again.
        assert!(intake.derive_suggestions(now).await.unwrap().is_empty());
        assert_eq!(store.suggestion_list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_negative_feedback_holds_back_a_pattern() {
        let store = MemoryStore::new();
        let intake = intake(&store);
        let now = Utc::now();
        for _ in 0..3 {
            intake.observe("planner", &focus(), 50i64.into(), now).await.unwrap();
        }
        intake
            .record_feedback(
                &FeedbackSignal::new("planner", "schedule", -1.0, now)
                    .unwrap()
                    .with_key("focus_minutes"),
            )
            .await
            .unwrap();

        assert!(intake.derive_suggestions(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pattern_matching_current_value_is_ignored() {
        let store = MemoryStore::new();
        let intake = intake(&store);
        let now = Utc::now();
        for _ in 0..5 {
            intake.observe("planner", &focus(), 25i64.into(), now).await.unwrap();
        }
        assert!(intake.derive_suggestions(now).await.unwrap().is_empty());
    }
}
