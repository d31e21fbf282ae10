//! Preference registry, state and change history

use crate::{
    ArbiterError, ArbiterResult, ChangeRecordId, ChangeSource, EntityIdType, PreferenceValue,
    RiskLevel, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Preference identity: the owning agent category plus the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreferenceKey {
    pub category: String,
    pub key: String,
}

impl PreferenceKey {
    pub fn new(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for PreferenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.key)
    }
}

/// Declared shape of one preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceDefinition {
    pub category: String,
    pub key: String,
    pub risk_level: RiskLevel,
    /// Any value is allowed when empty.
    #[serde(default)]
    pub allowed_values: Vec<PreferenceValue>,
    pub default_value: PreferenceValue,
    /// Whether learning may change it automatically.
    #[serde(default = "default_adaptive")]
    pub adaptive: bool,
}

fn default_adaptive() -> bool {
    true
}

impl PreferenceDefinition {
    pub fn preference_key(&self) -> PreferenceKey {
        PreferenceKey::new(&self.category, &self.key)
    }

    pub fn allows(&self, value: &PreferenceValue) -> bool {
        self.allowed_values.is_empty() || self.allowed_values.contains(value)
    }
}

/// Every known preference. Built once at startup and shared by reference.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRegistry {
    definitions: BTreeMap<PreferenceKey, PreferenceDefinition>,
}

impl PreferenceRegistry {
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = PreferenceDefinition>,
    ) -> ArbiterResult<Self> {
        let mut registry = Self::default();
        for definition in definitions {
            if definition.category.trim().is_empty() || definition.key.trim().is_empty() {
                return Err(ArbiterError::missing_field("preference.category/key"));
            }
            if !definition.allows(&definition.default_value) {
                return Err(ArbiterError::invalid_value(
                    definition.preference_key().to_string(),
                    "default value is not among the allowed values",
                ));
            }
            let key = definition.preference_key();
            if registry.definitions.insert(key.clone(), definition).is_some() {
                return Err(ArbiterError::invalid_value(
                    key.to_string(),
                    "preference defined twice",
                ));
            }
        }
        Ok(registry)
    }

    pub fn get(&self, category: &str, key: &str) -> Option<&PreferenceDefinition> {
        self.definitions.get(&PreferenceKey::new(category, key))
    }

    pub fn require(&self, category: &str, key: &str) -> ArbiterResult<&PreferenceDefinition> {
        self.get(category, key).ok_or_else(|| {
            ArbiterError::invalid_value(
                "preference",
                format!("{}/{} is not registered", category, key),
            )
        })
    }

    pub fn in_category<'a>(
        &'a self,
        category: &'a str,
    ) -> impl Iterator<Item = &'a PreferenceDefinition> + 'a {
        self.definitions
            .values()
            .filter(move |d| d.category == category)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

/// Current value of a preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceState {
    pub category: String,
    pub key: String,
    pub value: PreferenceValue,
    /// Locked preferences are never changed by learning.
    pub locked: bool,
    pub updated_at: Timestamp,
}

impl PreferenceState {
    pub fn from_default(definition: &PreferenceDefinition, now: Timestamp) -> Self {
        Self {
            category: definition.category.clone(),
            key: definition.key.clone(),
            value: definition.default_value.clone(),
            locked: false,
            updated_at: now,
        }
    }

    pub fn preference_key(&self) -> PreferenceKey {
        PreferenceKey::new(&self.category, &self.key)
    }
}

/// One entry of a preference's change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceChangeRecord {
    pub record_id: ChangeRecordId,
    pub agent_name: String,
    pub category: String,
    pub key: String,
    pub previous_value: Option<PreferenceValue>,
    pub new_value: PreferenceValue,
    pub changed_by: ChangeSource,
    pub reason: String,
    pub changed_at: Timestamp,
}

impl PreferenceChangeRecord {
    pub fn new(
        agent_name: impl Into<String>,
        key: &PreferenceKey,
        previous_value: Option<PreferenceValue>,
        new_value: PreferenceValue,
        changed_by: ChangeSource,
        reason: impl Into<String>,
        changed_at: Timestamp,
    ) -> Self {
        Self {
            record_id: ChangeRecordId::now_v7(),
            agent_name: agent_name.into(),
            category: key.category.clone(),
            key: key.key.clone(),
            previous_value,
            new_value,
            changed_by,
            reason: reason.into(),
            changed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone() -> PreferenceDefinition {
        PreferenceDefinition {
            category: "coaching".to_string(),
            key: "tone".to_string(),
            risk_level: RiskLevel::Medium,
            allowed_values: vec!["gentle".into(), "direct".into()],
            default_value: "gentle".into(),
            adaptive: true,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = PreferenceRegistry::from_definitions(vec![tone()]).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("coaching", "tone").is_some());
        assert!(registry.require("coaching", "volume").is_err());
        assert_eq!(registry.in_category("coaching").count(), 1);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_bad_defaults() {
        assert!(PreferenceRegistry::from_definitions(vec![tone(), tone()]).is_err());
        let mut bad = tone();
        bad.default_value = "shouty".into();
        assert!(PreferenceRegistry::from_definitions(vec![bad]).is_err());
    }

    #[test]
    fn test_allowed_values() {
        let def = tone();
        assert!(def.allows(&"direct".into()));
        assert!(!def.allows(&"sarcastic".into()));
        let open = PreferenceDefinition {
            allowed_values: vec![],
            ..tone()
        };
        assert!(open.allows(&"anything".into()));
    }
}
