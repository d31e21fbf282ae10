//! ARBITER Adaptation - Governed Preference Learning
//!
//! Decides whether learned preference changes may be applied without a human
//! and reverts them when asked:
//! - Learning intake (feedback, observed patterns, derived suggestions)
//! - The ordered adaptation check chain and attempt records
//! - Rollback of applied attempts, executed decisions and history entries

pub mod engine;
pub mod learning;
pub mod rollback;
mod writer;

pub use engine::{evaluate, AdaptationPolicyEngine, Evaluation};
pub use learning::{adjust_for_feedback, pattern_confidence, LearningIntake};
pub use rollback::{RollbackCoordinator, RollbackReport};
