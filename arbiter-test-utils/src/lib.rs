//! ARBITER Test Utilities
//!
//! Centralized test infrastructure for the ARBITER workspace:
//! - Proptest generators for proposals, actions and policies
//! - A recording event handler
//! - Test fixtures for common scenarios
//! - Custom assertions for decision and audit invariants

// Re-export the in-memory store from its source crate
pub use arbiter_storage::MemoryStore;

// Re-export core types for convenience
pub use arbiter_core::{
    AdaptationPolicy, ArbiterConfig, ArbiterError, ArbiterResult, ArbitrationDecision,
    ArbitrationPolicy, AuditEntry, ConfigError, DecisionOutcome, EntityIdType, Event, EventKind,
    LearnedSuggestion, NewProposal, PolicySubject, PreferenceDefinition, PreferenceKey,
    PreferenceRegistry, PreferenceValue, Proposal, ProposalId, ProposalStatus, ProposedAction,
    ResolutionStrategy, RetryConfig, RiskLevel, StorageError, Timestamp, ValidationError,
};

use arbiter_events::{EventDispatcher, EventHandler};
use chrono::Utc;
use std::sync::{Arc, Mutex};

// ============================================================================
// RECORDING HANDLER
// ============================================================================

/// Event handler that keeps every event it sees, in order.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Dispatcher with a recorder registered for every kind.
pub fn recording_dispatcher() -> (Arc<EventDispatcher>, Arc<RecordingHandler>) {
    let dispatcher = Arc::new(EventDispatcher::default());
    let recorder = Arc::new(RecordingHandler::new());
    dispatcher
        .register_all(recorder.clone())
        .expect("fresh dispatcher accepts handlers");
    (dispatcher, recorder)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating ARBITER entity types.

    use super::*;
    use proptest::prelude::*;

    pub const AGENTS: &[&str] = &["coach", "planner", "scheduler", "finance", "wellness"];
    const TONES: &[&str] = &["gentle", "direct", "playful"];
    const CHANNELS: &[&str] = &["push", "email"];

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // 2020-2030
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_agent_name() -> impl Strategy<Value = String> {
        prop::sample::select(AGENTS).prop_map(str::to_string)
    }

    pub fn arb_confidence() -> impl Strategy<Value = f64> {
        (0u32..=100).prop_map(|c| c as f64 / 100.0)
    }

    pub fn arb_risk_level() -> impl Strategy<Value = RiskLevel> {
        prop_oneof![
            Just(RiskLevel::Low),
            Just(RiskLevel::Medium),
            Just(RiskLevel::High),
        ]
    }

    pub fn arb_strategy() -> impl Strategy<Value = ResolutionStrategy> {
        prop::sample::select(ResolutionStrategy::ALL)
    }

    pub fn arb_preference_value() -> impl Strategy<Value = PreferenceValue> {
        prop_oneof![
            any::<bool>().prop_map(PreferenceValue::Flag),
            (0i64..120).prop_map(PreferenceValue::Integer),
            prop::sample::select(TONES).prop_map(PreferenceValue::from),
        ]
    }

    /// Any well-formed action payload.
    pub fn arb_action() -> impl Strategy<Value = ProposedAction> {
        prop_oneof![
            arb_preference_value().prop_filter_map("valid preference action", |v| {
                ProposedAction::apply_preference("coaching", "tone", v, None).ok()
            }),
            prop::sample::select(CHANNELS).prop_filter_map("valid nudge", |channel| {
                ProposedAction::send_nudge(channel, "take a break").ok()
            }),
            (0i64..90).prop_filter_map("valid goal action", |minutes| {
                ProposedAction::adjust_goal("fitness", "daily_minutes", minutes.into()).ok()
            }),
        ]
    }

    /// A scored, pending proposal.
    pub fn arb_proposal() -> impl Strategy<Value = Proposal> {
        (
            arb_agent_name(),
            arb_action(),
            arb_confidence(),
            0u32..50,
            arb_risk_level(),
            -5i32..10,
        )
            .prop_filter_map("valid proposal", |(agent, action, confidence, cost, risk, priority)| {
                let input = NewProposal::new(agent, action)
                    .with_confidence(confidence)
                    .with_cost(cost as f64)
                    .with_risk(risk)
                    .with_priority(priority);
                Proposal::new(input, Utc::now()).ok()
            })
    }

    /// Between one and `max` scored proposals that all target the push
    /// notification channel.
    pub fn arb_contenders(max: usize) -> impl Strategy<Value = Vec<Proposal>> {
        prop::collection::vec(
            (arb_agent_name(), arb_confidence(), 0u32..50, arb_risk_level(), -5i32..10),
            1..=max.max(1),
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .filter_map(|(agent, confidence, cost, risk, priority)| {
                    let action = ProposedAction::send_nudge("push", "stand up").ok()?;
                    let input = NewProposal::new(agent, action)
                        .with_confidence(confidence)
                        .with_cost(cost as f64)
                        .with_risk(risk)
                        .with_priority(priority);
                    Proposal::new(input, Utc::now()).ok()
                })
                .collect()
        })
    }

    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (0u32..5, 1u64..50, 50u64..1000, 1.0f64..3.0).prop_map(
            |(max_retries, initial_backoff_ms, max_backoff_ms, backoff_multiplier)| RetryConfig {
                max_retries,
                initial_backoff_ms,
                max_backoff_ms,
                backoff_multiplier,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Preferences shared by most tests.
    ///
    /// - `coaching/tone`: medium risk, gentle or direct
    /// - `notifications/quiet_hours`: low risk flag
    /// - `schedule/focus_minutes`: low risk, any integer
    /// - `finance/budget_alerts`: high risk flag
    /// - `privacy/share_location`: not adaptive
    pub fn preference_definitions() -> Vec<PreferenceDefinition> {
        vec![
            PreferenceDefinition {
                category: "coaching".to_string(),
                key: "tone".to_string(),
                risk_level: RiskLevel::Medium,
                allowed_values: vec!["gentle".into(), "direct".into()],
                default_value: "gentle".into(),
                adaptive: true,
            },
            PreferenceDefinition {
                category: "notifications".to_string(),
                key: "quiet_hours".to_string(),
                risk_level: RiskLevel::Low,
                allowed_values: vec![],
                default_value: false.into(),
                adaptive: true,
            },
            PreferenceDefinition {
                category: "schedule".to_string(),
                key: "focus_minutes".to_string(),
                risk_level: RiskLevel::Low,
                allowed_values: vec![],
                default_value: 25i64.into(),
                adaptive: true,
            },
            PreferenceDefinition {
                category: "finance".to_string(),
                key: "budget_alerts".to_string(),
                risk_level: RiskLevel::High,
                allowed_values: vec![],
                default_value: true.into(),
                adaptive: true,
            },
            PreferenceDefinition {
                category: "privacy".to_string(),
                key: "share_location".to_string(),
                risk_level: RiskLevel::Medium,
                allowed_values: vec![],
                default_value: false.into(),
                adaptive: false,
            },
        ]
    }

    pub fn preference_registry() -> Arc<PreferenceRegistry> {
        Arc::new(
            PreferenceRegistry::from_definitions(preference_definitions())
                .expect("fixture preferences are valid"),
        )
    }

    /// A valid configuration carrying the fixture preferences.
    pub fn minimal_config() -> ArbiterConfig {
        ArbiterConfig {
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                backoff_multiplier: 2.0,
            },
            preferences: preference_definitions(),
            ..ArbiterConfig::default()
        }
    }

    pub fn default_policy(strategy: ResolutionStrategy) -> ArbitrationPolicy {
        ArbitrationPolicy::new("default", PolicySubject::Default, strategy, Utc::now())
            .expect("fixture policy is valid")
    }

    pub fn agent_policy(agent: &str, strategy: ResolutionStrategy) -> ArbitrationPolicy {
        ArbitrationPolicy::new(
            format!("{}-policy", agent),
            PolicySubject::Agent {
                agent_name: agent.to_string(),
            },
            strategy,
            Utc::now(),
        )
        .expect("fixture policy is valid")
    }

    pub fn preference_policy(
        category: &str,
        key: &str,
        strategy: ResolutionStrategy,
    ) -> ArbitrationPolicy {
        ArbitrationPolicy::new(
            format!("{}-{}-policy", category, key),
            PolicySubject::Preference {
                category: category.to_string(),
                key: key.to_string(),
            },
            strategy,
            Utc::now(),
        )
        .expect("fixture policy is valid")
    }

    pub fn scored_proposal(
        agent: &str,
        action: ProposedAction,
        confidence: f64,
        priority: i32,
    ) -> Proposal {
        let input = NewProposal::new(agent, action)
            .with_confidence(confidence)
            .with_priority(priority);
        Proposal::new(input, Utc::now()).expect("fixture proposal is valid")
    }

    /// Proposal setting `coaching/tone`.
    pub fn tone_input(agent: &str, value: &str, current: Option<&str>) -> NewProposal {
        let action = ProposedAction::apply_preference(
            "coaching",
            "tone",
            value.into(),
            current.map(PreferenceValue::from),
        )
        .expect("fixture action is valid");
        NewProposal::new(agent, action)
    }

    /// Proposal nudging on the push channel.
    pub fn nudge_input(agent: &str, priority: i32) -> NewProposal {
        let action = ProposedAction::send_nudge("push", format!("reminder from {}", agent))
            .expect("fixture action is valid");
        NewProposal::new(agent, action)
            .with_priority(priority)
            .with_confidence(0.8)
    }

    /// Adaptation policy with the user opted in and default limits.
    pub fn opted_in_policy() -> AdaptationPolicy {
        AdaptationPolicy {
            user_opted_in: true,
            ..AdaptationPolicy::new(Utc::now())
        }
    }

    pub fn suggestion(
        agent: &str,
        category: &str,
        key: &str,
        value: PreferenceValue,
        confidence: f64,
    ) -> LearnedSuggestion {
        LearnedSuggestion::new(
            agent,
            &PreferenceKey::new(category, key),
            value,
            confidence,
            "observed repeatedly",
            Utc::now(),
        )
        .expect("fixture suggestion is valid")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for ARBITER-specific validation.

    use super::*;
    use std::collections::BTreeSet;

    /// Assert that an ArbiterResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that an ArbiterResult is Err.
    #[track_caller]
    pub fn assert_err<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        assert!(result.is_err(), "Expected Err, got Ok: {:?}", result);
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_invalid_state<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        match result {
            Err(ArbiterError::InvalidState { .. }) => {}
            other => panic!("Expected InvalidState error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        match result {
            Err(ArbiterError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &ArbiterResult<T>) {
        match result {
            Err(ArbiterError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Winner, suppressed and vetoed are disjoint. Unless escalated, they
    /// cover exactly `proposal_ids`.
    #[track_caller]
    pub fn assert_decision_partition(decision: &ArbitrationDecision, proposal_ids: &[ProposalId]) {
        let suppressed: BTreeSet<_> = decision.suppressed_proposal_ids.iter().copied().collect();
        let vetoed: BTreeSet<_> = decision.vetoed_proposal_ids.iter().copied().collect();
        assert_eq!(
            suppressed.len(),
            decision.suppressed_proposal_ids.len(),
            "Duplicate suppressed ids"
        );
        assert!(suppressed.is_disjoint(&vetoed), "Suppressed and vetoed overlap");
        if let Some(winner) = decision.winning_proposal_id {
            assert!(!suppressed.contains(&winner), "Winner is also suppressed");
            assert!(!vetoed.contains(&winner), "Winner is also vetoed");
        }

        if decision.outcome == DecisionOutcome::Escalated {
            assert!(decision.winning_proposal_id.is_none(), "Escalation selected a winner");
            assert!(decision.requires_human_approval);
            return;
        }
        let mut covered: BTreeSet<_> = suppressed.union(&vetoed).copied().collect();
        covered.extend(decision.winning_proposal_id);
        let expected: BTreeSet<_> = proposal_ids.iter().copied().collect();
        assert_eq!(covered, expected, "Decision does not account for every proposal");
    }

    /// Every loser carries a reason and a non-empty explanation.
    #[track_caller]
    pub fn assert_losers_explained(decision: &ArbitrationDecision) {
        for id in decision
            .suppressed_proposal_ids
            .iter()
            .chain(&decision.vetoed_proposal_ids)
        {
            let suppression = decision
                .suppression_for(*id)
                .unwrap_or_else(|| panic!("No suppression recorded for {}", id));
            assert!(
                !suppression.explanation.trim().is_empty(),
                "Empty explanation for {}",
                id
            );
        }
    }

    #[track_caller]
    pub fn assert_chain_intact(entries: &[AuditEntry]) {
        if let Err(chain_break) = arbiter_core::verify_chain(entries) {
            panic!("Audit chain broken at sequence {}", chain_break.sequence);
        }
    }

    #[track_caller]
    pub fn assert_config_valid(config: &ArbiterConfig) {
        if let Err(e) = config.validate() {
            panic!("Config validation failed: {:?}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
