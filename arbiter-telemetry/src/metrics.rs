//! Prometheus Metrics Definitions
//!
//! Every metric lives on a registry owned by the metrics instance, so several
//! instances (one per test, say) never collide on names.

use arbiter_core::{
    ArbiterError, ArbiterResult, ConflictType, DecisionOutcome, EscalationReason,
    SuppressionReason, TelemetryConfig,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

fn registration_error(metric: &str, e: prometheus::Error) -> ArbiterError {
    ArbiterError::Collaborator {
        collaborator: "prometheus",
        reason: format!("Failed to register {}: {}", metric, e),
    }
}

/// Container for all ARBITER metrics.
#[derive(Clone)]
pub struct ArbiterMetrics {
    registry: Registry,

    /// Conflicts found by the detector - labels: conflict_type
    pub conflicts_detected_total: IntCounterVec,

    /// Decisions reached - labels: outcome
    pub conflicts_resolved_total: IntCounterVec,

    /// Escalations raised - labels: reason
    pub escalations_total: IntCounterVec,

    /// Losing proposals - labels: reason
    pub proposals_suppressed_total: IntCounterVec,

    pub decisions_executed_total: IntCounter,

    /// Preference rollbacks - labels: source (decision, attempt, history)
    pub rollback_preference_total: IntCounterVec,

    pub suggestion_approved_total: IntCounter,

    /// Suggestions not applied - labels: reason
    pub suggestion_rejected_total: IntCounterVec,
}

impl ArbiterMetrics {
    /// Create and register all metrics under `namespace`.
    pub fn new(namespace: &str) -> ArbiterResult<Self> {
        let registry = Registry::new();

        let counter_vec = |name: &str, help: &str, labels: &[&str]| -> ArbiterResult<IntCounterVec> {
            let counter = IntCounterVec::new(Opts::new(name, help).namespace(namespace), labels)
                .map_err(|e| registration_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| registration_error(name, e))?;
            Ok(counter)
        };
        let counter = |name: &str, help: &str| -> ArbiterResult<IntCounter> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(|e| registration_error(name, e))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| registration_error(name, e))?;
            Ok(counter)
        };

        Ok(Self {
            conflicts_detected_total: counter_vec(
                "conflicts_detected_total",
                "Conflicts detected between pending proposals",
                &["conflict_type"],
            )?,
            conflicts_resolved_total: counter_vec(
                "conflicts_resolved_total",
                "Arbitration decisions reached",
                &["outcome"],
            )?,
            escalations_total: counter_vec(
                "escalations_total",
                "Conflicts escalated to a human",
                &["reason"],
            )?,
            proposals_suppressed_total: counter_vec(
                "proposals_suppressed_total",
                "Proposals that lost arbitration",
                &["reason"],
            )?,
            decisions_executed_total: counter(
                "decisions_executed_total",
                "Winning proposals applied through the execution gate",
            )?,
            rollback_preference_total: counter_vec(
                "rollback_preference_total",
                "Preference rollbacks performed",
                &["source"],
            )?,
            suggestion_approved_total: counter(
                "suggestion_approved_total",
                "Learned suggestions applied automatically",
            )?,
            suggestion_rejected_total: counter_vec(
                "suggestion_rejected_total",
                "Learned suggestions blocked or skipped",
                &["reason"],
            )?,
            registry,
        })
    }

    pub fn from_config(config: &TelemetryConfig) -> ArbiterResult<Self> {
        Self::new(&config.metrics_namespace)
    }

    /// `None` counts a singleton group that needed no arbitration.
    pub fn record_conflict_detected(&self, conflict_type: Option<ConflictType>) {
        let label = conflict_type.map_or("none", |t| t.as_db_str());
        self.conflicts_detected_total.with_label_values(&[label]).inc();
    }

    pub fn record_resolution(&self, outcome: DecisionOutcome) {
        self.conflicts_resolved_total
            .with_label_values(&[outcome.as_db_str()])
            .inc();
    }

    pub fn record_escalation(&self, reason: EscalationReason) {
        self.escalations_total
            .with_label_values(&[reason.as_db_str()])
            .inc();
    }

    pub fn record_suppression(&self, reason: SuppressionReason) {
        self.proposals_suppressed_total
            .with_label_values(&[reason.as_db_str()])
            .inc();
    }

    pub fn record_execution(&self) {
        self.decisions_executed_total.inc();
    }

    pub fn record_rollback(&self, source: &str) {
        self.rollback_preference_total
            .with_label_values(&[source])
            .inc();
    }

    pub fn record_suggestion_approved(&self) {
        self.suggestion_approved_total.inc();
    }

    pub fn record_suggestion_rejected(&self, reason: &str) {
        self.suggestion_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> ArbiterResult<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| ArbiterError::Collaborator {
                collaborator: "prometheus",
                reason: format!("Failed to encode metrics: {}", e),
            })?;
        String::from_utf8(buffer).map_err(|e| ArbiterError::Collaborator {
            collaborator: "prometheus",
            reason: format!("Metrics output is not UTF-8: {}", e),
        })
    }
}

impl std::fmt::Debug for ArbiterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterMetrics").finish_non_exhaustive()
    }
}
