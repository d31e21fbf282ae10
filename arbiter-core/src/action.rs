//! Proposed action payloads
//!
//! The payload is a closed union keyed by [`ActionType`]; the target a
//! proposal acts on is derived from its payload so the two cannot disagree.

use crate::{ActionType, ArbiterError, ArbiterResult, TargetType, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// VALUES
// ============================================================================

/// A preference or goal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreferenceValue {
    Flag(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl PreferenceValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            PreferenceValue::Integer(i) => Some(*i as f64),
            PreferenceValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Equality with an absolute tolerance for numeric values.
    pub fn equivalent(&self, other: &PreferenceValue, tolerance: f64) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= tolerance,
            _ => self == other,
        }
    }
}

impl fmt::Display for PreferenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreferenceValue::Flag(b) => write!(f, "{}", b),
            PreferenceValue::Integer(i) => write!(f, "{}", i),
            PreferenceValue::Number(n) => write!(f, "{}", n),
            PreferenceValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for PreferenceValue {
    fn from(value: bool) -> Self {
        PreferenceValue::Flag(value)
    }
}

impl From<i64> for PreferenceValue {
    fn from(value: i64) -> Self {
        PreferenceValue::Integer(value)
    }
}

impl From<f64> for PreferenceValue {
    fn from(value: f64) -> Self {
        PreferenceValue::Number(value)
    }
}

impl From<&str> for PreferenceValue {
    fn from(value: &str) -> Self {
        PreferenceValue::Text(value.to_string())
    }
}

// ============================================================================
// TARGETS
// ============================================================================

/// The shared thing proposals compete over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_type: TargetType,
    pub id: String,
    pub key: Option<String>,
}

impl TargetRef {
    pub fn new(target_type: TargetType, id: impl Into<String>) -> ArbiterResult<Self> {
        let id = id.into();
        require_non_empty("target.id", &id)?;
        Ok(Self {
            target_type,
            id,
            key: None,
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> ArbiterResult<Self> {
        let key = key.into();
        require_non_empty("target.key", &key)?;
        self.key = Some(key);
        Ok(self)
    }

    /// Target for a preference identified by category and key.
    pub fn preference(category: &str, key: &str) -> ArbiterResult<Self> {
        Self::new(TargetType::Preference, category)?.with_key(key)
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}:{}/{}", self.target_type, self.id, key),
            None => write!(f, "{}:{}", self.target_type, self.id),
        }
    }
}

// ============================================================================
// ACTIONS
// ============================================================================

/// What an agent proposes to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ProposedAction {
    ApplyPreference {
        category: String,
        key: String,
        value: PreferenceValue,
        /// Value in effect when the proposal was made; restored on rollback.
        current_value: Option<PreferenceValue>,
    },
    Reschedule {
        item_id: String,
        start_at: Timestamp,
        end_at: Timestamp,
    },
    CreateTask {
        list_id: String,
        title: String,
        due_at: Option<Timestamp>,
    },
    AdjustGoal {
        goal_id: String,
        field: String,
        value: PreferenceValue,
    },
    SendNudge {
        channel: String,
        message: String,
    },
}

impl ProposedAction {
    pub fn apply_preference(
        category: impl Into<String>,
        key: impl Into<String>,
        value: PreferenceValue,
        current_value: Option<PreferenceValue>,
    ) -> ArbiterResult<Self> {
        let action = ProposedAction::ApplyPreference {
            category: category.into(),
            key: key.into(),
            value,
            current_value,
        };
        action.validate()?;
        Ok(action)
    }

    pub fn reschedule(
        item_id: impl Into<String>,
        start_at: Timestamp,
        end_at: Timestamp,
    ) -> ArbiterResult<Self> {
        let action = ProposedAction::Reschedule {
            item_id: item_id.into(),
            start_at,
            end_at,
        };
        action.validate()?;
        Ok(action)
    }

    pub fn create_task(
        list_id: impl Into<String>,
        title: impl Into<String>,
        due_at: Option<Timestamp>,
    ) -> ArbiterResult<Self> {
        let action = ProposedAction::CreateTask {
            list_id: list_id.into(),
            title: title.into(),
            due_at,
        };
        action.validate()?;
        Ok(action)
    }

    pub fn adjust_goal(
        goal_id: impl Into<String>,
        field: impl Into<String>,
        value: PreferenceValue,
    ) -> ArbiterResult<Self> {
        let action = ProposedAction::AdjustGoal {
            goal_id: goal_id.into(),
            field: field.into(),
            value,
        };
        action.validate()?;
        Ok(action)
    }

    pub fn send_nudge(
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> ArbiterResult<Self> {
        let action = ProposedAction::SendNudge {
            channel: channel.into(),
            message: message.into(),
        };
        action.validate()?;
        Ok(action)
    }

    /// Check payload well-formedness. Payloads arriving through serde are
    /// validated again when the owning proposal is constructed.
    pub fn validate(&self) -> ArbiterResult<()> {
        match self {
            ProposedAction::ApplyPreference { category, key, .. } => {
                require_non_empty("category", category)?;
                require_non_empty("key", key)
            }
            ProposedAction::Reschedule {
                item_id,
                start_at,
                end_at,
            } => {
                require_non_empty("item_id", item_id)?;
                if end_at <= start_at {
                    return Err(ArbiterError::invalid_value(
                        "end_at",
                        "must be after start_at",
                    ));
                }
                Ok(())
            }
            ProposedAction::CreateTask { list_id, title, .. } => {
                require_non_empty("list_id", list_id)?;
                require_non_empty("title", title)
            }
            ProposedAction::AdjustGoal { goal_id, field, .. } => {
                require_non_empty("goal_id", goal_id)?;
                require_non_empty("field", field)
            }
            ProposedAction::SendNudge { channel, message } => {
                require_non_empty("channel", channel)?;
                require_non_empty("message", message)
            }
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ProposedAction::ApplyPreference { .. } => ActionType::ApplyPreference,
            ProposedAction::Reschedule { .. } => ActionType::Reschedule,
            ProposedAction::CreateTask { .. } => ActionType::CreateTask,
            ProposedAction::AdjustGoal { .. } => ActionType::AdjustGoal,
            ProposedAction::SendNudge { .. } => ActionType::SendNudge,
        }
    }

    /// Target derived from the payload.
    pub fn target(&self) -> TargetRef {
        let (target_type, id, key) = match self {
            ProposedAction::ApplyPreference { category, key, .. } => {
                (TargetType::Preference, category, Some(key))
            }
            ProposedAction::Reschedule { item_id, .. } => (TargetType::ScheduleItem, item_id, None),
            ProposedAction::CreateTask { list_id, .. } => (TargetType::Task, list_id, None),
            ProposedAction::AdjustGoal { goal_id, field, .. } => {
                (TargetType::Goal, goal_id, Some(field))
            }
            ProposedAction::SendNudge { channel, .. } => (TargetType::Notification, channel, None),
        };
        TargetRef {
            target_type,
            id: id.clone(),
            key: key.cloned(),
        }
    }

    /// Whether two actions propose the same effect, numeric values compared
    /// within `tolerance`.
    pub fn equivalent(&self, other: &ProposedAction, tolerance: f64) -> bool {
        match (self, other) {
            (
                ProposedAction::ApplyPreference { category: c1, key: k1, value: v1, .. },
                ProposedAction::ApplyPreference { category: c2, key: k2, value: v2, .. },
            ) => c1 == c2 && k1 == k2 && v1.equivalent(v2, tolerance),
            (
                ProposedAction::AdjustGoal { goal_id: g1, field: f1, value: v1 },
                ProposedAction::AdjustGoal { goal_id: g2, field: f2, value: v2 },
            ) => g1 == g2 && f1 == f2 && v1.equivalent(v2, tolerance),
            (
                ProposedAction::Reschedule { item_id: i1, start_at: s1, end_at: e1 },
                ProposedAction::Reschedule { item_id: i2, start_at: s2, end_at: e2 },
            ) => {
                let drift = |a: &Timestamp, b: &Timestamp| {
                    (a.timestamp_millis() - b.timestamp_millis()).abs() as f64 / 60_000.0
                };
                i1 == i2 && drift(s1, s2) <= tolerance && drift(e1, e2) <= tolerance
            }
            _ => self == other,
        }
    }

    /// Value the action would set, for value-carrying actions.
    pub fn proposed_value(&self) -> Option<&PreferenceValue> {
        match self {
            ProposedAction::ApplyPreference { value, .. }
            | ProposedAction::AdjustGoal { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Only preference changes carry enough state to be reverted.
    pub fn is_revertible(&self) -> bool {
        matches!(self, ProposedAction::ApplyPreference { .. })
    }
}

fn require_non_empty(field: &str, value: &str) -> ArbiterResult<()> {
    if value.trim().is_empty() {
        return Err(ArbiterError::missing_field(field));
    }
    Ok(())
}
