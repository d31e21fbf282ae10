//! End-to-end arbitration flows against the in-memory store.

use arbiter_arbitration::{
    ApplierRegistry, ArbitrationService, EffectApplier, ExecutionOutcome, PreferenceEffectApplier,
};
use arbiter_core::{
    ActionType, ArbitrationDecision, AuditKind, DecisionOutcome, EscalationReason,
    EscalationThresholds, EventKind, PreferenceValue, Proposal, ProposalStatus, ProposedAction,
    ResolutionStrategy, RiskLevel, SuppressionReason, Timestamp, VetoRule,
};
use arbiter_storage::{
    AuditRepository, DecisionJournalRepository, MemoryStore, PreferenceRepository,
    ProposalRepository,
};
use arbiter_telemetry::ObservabilityContext;
use arbiter_test_utils::{assertions, fixtures, recording_dispatcher, RecordingHandler};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct CountingApplier(AtomicU32);

#[async_trait]
impl EffectApplier for CountingApplier {
    async fn apply(
        &self,
        _proposal: &Proposal,
        _decision: &ArbitrationDecision,
        _now: Timestamp,
    ) -> arbiter_core::ArbiterResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    store: MemoryStore,
    service: ArbitrationService<MemoryStore>,
    recorder: Arc<RecordingHandler>,
    nudges: Arc<CountingApplier>,
}

async fn harness(default_strategy: ResolutionStrategy) -> Harness {
    let store = MemoryStore::new();
    let shared = Arc::new(store.clone());
    let nudges = Arc::new(CountingApplier::default());
    let appliers = ApplierRegistry::new()
        .with(
            ActionType::ApplyPreference,
            Arc::new(PreferenceEffectApplier::new(
                shared.clone(),
                fixtures::preference_registry(),
            )),
        )
        .with(ActionType::SendNudge, nudges.clone());
    let (dispatcher, recorder) = recording_dispatcher();
    let service = ArbitrationService::new(
        shared,
        Arc::new(appliers),
        dispatcher,
        ObservabilityContext::detached().unwrap(),
        fixtures::minimal_config().retry,
    );
    service
        .register_policy(&fixtures::default_policy(default_strategy))
        .await
        .unwrap();
    Harness {
        store,
        service,
        recorder,
        nudges,
    }
}

async fn status_of(store: &MemoryStore, proposal: &Proposal) -> ProposalStatus {
    store
        .proposal_get(proposal.proposal_id)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn test_higher_priority_wins() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let high = h.service.submit(fixtures::nudge_input("coach", 5), now).await.unwrap();
    let low = h.service.submit(fixtures::nudge_input("planner", 3), now).await.unwrap();

    let decision = h.service.process_target(&high.target, now).await.unwrap().unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::WinnerSelected);
    assert_eq!(decision.winning_proposal_id, Some(high.proposal_id));
    assert_eq!(decision.suppressed_proposal_ids, vec![low.proposal_id]);
    assert_eq!(
        decision.suppression_for(low.proposal_id).map(|s| s.reason),
        Some(SuppressionReason::LostPriority)
    );
    assertions::assert_decision_partition(&decision, &[high.proposal_id, low.proposal_id]);
    assertions::assert_losers_explained(&decision);

    assert_eq!(status_of(&h.store, &high).await, ProposalStatus::Won);
    assert_eq!(status_of(&h.store, &low).await, ProposalStatus::Suppressed);
    assert_eq!(h.recorder.count(EventKind::ActionSuppressed), 1);
    assert_eq!(h.recorder.count(EventKind::ArbitrationResolved), 1);
}

#[tokio::test]
async fn test_all_vetoed_conflict_has_no_winner() {
    let h = harness(ResolutionStrategy::Priority).await;
    let policy = fixtures::agent_policy("coach", ResolutionStrategy::Priority)
        .with_veto_rule(VetoRule::new("no risky nudges").with_min_risk(RiskLevel::High));
    h.service.register_policy(&policy).await.unwrap();

    let now = Utc::now();
    let mut submitted = Vec::new();
    for (agent, priority) in [("coach", 1), ("planner", 2), ("wellness", 3)] {
        let input = fixtures::nudge_input(agent, priority).with_risk(RiskLevel::High);
        submitted.push(h.service.submit(input, now).await.unwrap());
    }

    let decision = h
        .service
        .process_target(&submitted[0].target, now)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(decision.outcome, DecisionOutcome::AllVetoed);
    assert_eq!(decision.vetoed_proposal_ids.len(), 3);
    assert!(decision.winning_proposal_id.is_none());
    assert!(!decision.can_execute());
    for p in &submitted {
        assert_eq!(status_of(&h.store, p).await, ProposalStatus::Vetoed);
    }
    assertions::assert_invalid_state(&h.service.execute(decision.decision_id, now).await);
}

#[tokio::test]
async fn test_execution_is_idempotent() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let lone = h.service.submit(fixtures::nudge_input("coach", 1), now).await.unwrap();
    let decision = h.service.process_target(&lone.target, now).await.unwrap().unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::NoConflict);

    let first = h.service.execute(decision.decision_id, now).await.unwrap();
    let second = h.service.execute(decision.decision_id, now).await.unwrap();

    assert!(matches!(first, ExecutionOutcome::Executed { .. }));
    assert!(matches!(second, ExecutionOutcome::AlreadyExecuted { .. }));
    assert_eq!(h.nudges.0.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&h.store, &lone).await, ProposalStatus::Executed);
    assert_eq!(h.recorder.count(EventKind::DecisionExecuted), 1);

    let history = h.service.explain(decision.decision_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[1].contains("decision_executed"));
}

#[tokio::test]
async fn test_execution_interrupted_before_audit_is_finished_later() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let lone = h.service.submit(fixtures::nudge_input("coach", 1), now).await.unwrap();
    let decision = h.service.process_target(&lone.target, now).await.unwrap().unwrap();

    h.store.fail_next("audit_append", 10);
    assert!(h.service.execute(decision.decision_id, now).await.is_err());
    h.store.fail_next("audit_append", 0);

    let retried = h.service.execute(decision.decision_id, now).await.unwrap();
    assert!(matches!(retried, ExecutionOutcome::Executed { .. }));
    assert_eq!(h.nudges.0.load(Ordering::SeqCst), 1);
    let history = h.service.explain(decision.decision_id).await.unwrap();
    assert_eq!(
        history.iter().filter(|l| l.contains("decision_executed")).count(),
        1
    );
}

#[tokio::test]
async fn test_replay_finishes_an_interrupted_execution() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let lone = h.service.submit(fixtures::nudge_input("coach", 1), now).await.unwrap();
    let decision = h.service.process_target(&lone.target, now).await.unwrap().unwrap();

    h.store.fail_next("decision_mark_executed", 10);
    assert!(h.service.execute(decision.decision_id, now).await.is_err());
    h.store.fail_next("decision_mark_executed", 0);

    assert_eq!(h.service.replay_uncommitted().await.unwrap(), 1);
    assert_eq!(h.service.replay_uncommitted().await.unwrap(), 0);
    assert_eq!(h.nudges.0.load(Ordering::SeqCst), 1);
    assert_eq!(status_of(&h.store, &lone).await, ProposalStatus::Executed);
    assert_eq!(h.recorder.count(EventKind::DecisionExecuted), 1);
}

#[tokio::test]
async fn test_concurrent_execution_applies_once() {
    let h = Arc::new(harness(ResolutionStrategy::Priority).await);
    let now = Utc::now();
    let lone = h.service.submit(fixtures::nudge_input("coach", 1), now).await.unwrap();
    let decision = h.service.process_target(&lone.target, now).await.unwrap().unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let h = h.clone();
        let id = decision.decision_id;
        tasks.push(tokio::spawn(async move { h.service.execute(id, Utc::now()).await }));
    }
    let mut executed = 0;
    for task in tasks {
        if let Ok(ExecutionOutcome::Executed { .. }) = task.await.unwrap() {
            executed += 1;
        }
    }
    assert_eq!(executed, 1);
    assert_eq!(h.nudges.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_preference_policy_overrides_agent_policy() {
    let h = harness(ResolutionStrategy::Weighted).await;
    h.service
        .register_policy(&fixtures::agent_policy("coach", ResolutionStrategy::Weighted))
        .await
        .unwrap();
    h.service
        .register_policy(&fixtures::preference_policy(
            "coaching",
            "tone",
            ResolutionStrategy::Priority,
        ))
        .await
        .unwrap();

    let now = Utc::now();
    // Weighted scoring would prefer the confident coach; priority prefers
    // the planner.
    let coach = h
        .service
        .submit(
            fixtures::tone_input("coach", "direct", Some("gentle"))
                .with_confidence(0.95)
                .with_priority(1),
            now,
        )
        .await
        .unwrap();
    let planner = h
        .service
        .submit(
            fixtures::tone_input("planner", "direct", Some("gentle"))
                .with_confidence(0.5)
                .with_priority(9),
            now,
        )
        .await
        .unwrap();

    let decision = h.service.process_target(&coach.target, now).await.unwrap().unwrap();
    assert_eq!(decision.strategy_used, Some(ResolutionStrategy::Priority));
    assert_eq!(decision.winning_proposal_id, Some(planner.proposal_id));
}

#[tokio::test]
async fn test_winning_preference_is_written_on_execution() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let p = h
        .service
        .submit(
            fixtures::tone_input("coach", "direct", Some("gentle")).with_confidence(0.9),
            now,
        )
        .await
        .unwrap();
    let decision = h.service.process_target(&p.target, now).await.unwrap().unwrap();
    h.service.execute(decision.decision_id, now).await.unwrap();

    let state = h.store.preference_get("coaching", "tone").await.unwrap().unwrap();
    assert_eq!(state.value, PreferenceValue::from("direct"));
}

#[tokio::test]
async fn test_interrupted_commit_is_replayed() {
    let h = harness(ResolutionStrategy::Priority).await;
    let now = Utc::now();
    let a = h.service.submit(fixtures::nudge_input("coach", 2), now).await.unwrap();
    let b = h.service.submit(fixtures::nudge_input("planner", 1), now).await.unwrap();

    // Exhaust the retries on the audit step.
    h.store.fail_next("audit_append", 10);
    assert!(h.service.process_target(&a.target, now).await.is_err());
    assert_eq!(h.store.journal_list_uncommitted().await.unwrap().len(), 1);
    h.store.fail_next("audit_append", 0);

    assert_eq!(h.service.replay_uncommitted().await.unwrap(), 1);
    assert_eq!(h.service.replay_uncommitted().await.unwrap(), 0);
    assert_eq!(status_of(&h.store, &a).await, ProposalStatus::Won);
    assert_eq!(status_of(&h.store, &b).await, ProposalStatus::Suppressed);
    let entries = h.store.audit_list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assertions::assert_chain_intact(&entries);

    // Nothing is left to arbitrate on the target.
    assert!(h.service.process_target(&a.target, now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_escalation_waits_for_approval() {
    let h = harness(ResolutionStrategy::Priority).await;
    let policy = fixtures::agent_policy("coach", ResolutionStrategy::Priority).with_escalation(
        EscalationThresholds {
            max_cost: Some(10.0),
            ..Default::default()
        },
    );
    h.service.register_policy(&policy).await.unwrap();

    let now = Utc::now();
    let pricey = h
        .service
        .submit(fixtures::nudge_input("coach", 1).with_cost(25.0), now)
        .await
        .unwrap();
    let cheap = h.service.submit(fixtures::nudge_input("planner", 4), now).await.unwrap();

    let decision = h.service.process_target(&pricey.target, now).await.unwrap().unwrap();
    assert_eq!(decision.outcome, DecisionOutcome::Escalated);
    assert_eq!(
        decision.escalation.as_ref().map(|e| e.reason),
        Some(EscalationReason::CostThreshold)
    );
    assert_eq!(
        decision.escalation.as_ref().and_then(|e| e.suggested_resolution),
        Some(cheap.proposal_id)
    );
    assertions::assert_decision_partition(&decision, &[pricey.proposal_id, cheap.proposal_id]);
    assert_eq!(h.recorder.count(EventKind::ArbitrationEscalated), 1);
    assertions::assert_invalid_state(&h.service.execute(decision.decision_id, now).await);

    // Parked proposals are not picked up again.
    assert!(h.service.process_target(&pricey.target, now).await.unwrap().is_none());
    assert_eq!(h.service.pending_approvals().await.unwrap().len(), 1);

    let approved = h
        .service
        .approve_escalation(decision.decision_id, pricey.proposal_id, "alex", None, now)
        .await
        .unwrap();
    assert_eq!(approved.outcome, DecisionOutcome::WinnerSelected);
    assert_eq!(approved.winning_proposal_id, Some(pricey.proposal_id));
    assert_eq!(status_of(&h.store, &pricey).await, ProposalStatus::Won);
    assert_eq!(status_of(&h.store, &cheap).await, ProposalStatus::Suppressed);
    assert!(h.service.pending_approvals().await.unwrap().is_empty());

    let executed = h.service.execute(decision.decision_id, now).await.unwrap();
    assert!(matches!(executed, ExecutionOutcome::Executed { .. }));

    let kinds: Vec<_> = h
        .store
        .audit_find_by_subject(decision.decision_id.into())
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            AuditKind::DecisionRecorded,
            AuditKind::EscalationResolved,
            AuditKind::DecisionExecuted
        ]
    );
}

#[tokio::test]
async fn test_rejected_escalation_vetoes_everything() {
    let h = harness(ResolutionStrategy::Priority).await;
    let policy = fixtures::agent_policy("coach", ResolutionStrategy::Priority).with_escalation(
        EscalationThresholds {
            always_escalate_agents: vec!["coach".to_string()],
            ..Default::default()
        },
    );
    h.service.register_policy(&policy).await.unwrap();

    let now = Utc::now();
    let p = h.service.submit(fixtures::nudge_input("coach", 1), now).await.unwrap();
    let decision = h.service.process_target(&p.target, now).await.unwrap().unwrap();
    assert!(decision.is_escalated());

    let rejected = h
        .service
        .reject_escalation(decision.decision_id, "alex", Some("not today".to_string()), now)
        .await
        .unwrap();
    assert_eq!(rejected.outcome, DecisionOutcome::AllVetoed);
    assert_eq!(status_of(&h.store, &p).await, ProposalStatus::Vetoed);

    // Resolving twice is refused.
    assertions::assert_invalid_state(
        &h.service
            .reject_escalation(decision.decision_id, "alex", None, now)
            .await,
    );
}

#[tokio::test]
async fn test_missing_default_policy_is_a_config_error() {
    let store = MemoryStore::new();
    let (dispatcher, _recorder) = recording_dispatcher();
    let service = ArbitrationService::new(
        Arc::new(store.clone()),
        Arc::new(ApplierRegistry::new()),
        dispatcher,
        ObservabilityContext::detached().unwrap(),
        fixtures::minimal_config().retry,
    );
    let action = ProposedAction::send_nudge("push", "hi").unwrap();
    let p = service
        .submit(arbiter_core::NewProposal::new("coach", action).with_confidence(0.5), Utc::now())
        .await
        .unwrap();
    assertions::assert_config_error(&service.process_target(&p.target, Utc::now()).await);
}
