//! ARBITER Arbitration - Conflict Resolution and Gated Execution
//!
//! Turns competing agent proposals into one auditable decision per target:
//! - Conflict detection and classification
//! - Policy resolution (preference over agent over default)
//! - Veto rules, escalation thresholds and resolution strategies
//! - Journaled decision commits with replay
//! - The execution gate, the only path to side effects
//! - Human approval of escalated decisions

pub mod detector;
pub mod engine;
pub mod escalation;
pub mod gate;
pub mod journal;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod strategy;

pub use detector::{ConflictDetector, DetectedConflict};
pub use engine::ArbitrationEngine;
pub use escalation::check_thresholds;
pub use gate::{
    decision_change_reason, ApplierRegistry, EffectApplier, ExecutionGate, ExecutionOutcome,
    PreferenceEffectApplier,
};
pub use journal::DecisionJournal;
pub use resolver::PolicyResolver;
pub use retry::with_retry;
pub use service::{ArbitrationService, ConfidenceScorer};
pub use strategy::StrategyOutcome;
