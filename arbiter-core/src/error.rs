//! Error types for ARBITER operations
//!
//! Blocked, skipped, suppressed, vetoed and escalated outcomes are results,
//! not errors. Errors are reserved for missing entities, illegal state
//! transitions, malformed input, storage faults and bad configuration.

use thiserror::Error;
use uuid::Uuid;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: &'static str, id: Uuid },

    #[error("Insert failed for {entity_type}: {reason}")]
    InsertFailed {
        entity_type: &'static str,
        reason: String,
    },

    #[error("Update failed for {entity_type} with id {id}: {reason}")]
    UpdateFailed {
        entity_type: &'static str,
        id: Uuid,
        reason: String,
    },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Storage temporarily unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable { .. } | StorageError::TransactionFailed { .. }
        )
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    ParseFailed { reason: String },
}

/// Master error type for all ARBITER errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: &'static str, id: Uuid },

    #[error("Invalid state for {entity_type} {id}: {reason}")]
    InvalidState {
        entity_type: &'static str,
        id: Uuid,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator {collaborator} failed: {reason}")]
    Collaborator {
        collaborator: &'static str,
        reason: String,
    },
}

impl ArbiterError {
    pub fn not_found(entity_type: &'static str, id: impl Into<Uuid>) -> Self {
        ArbiterError::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        entity_type: &'static str,
        id: impl Into<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        ArbiterError::InvalidState {
            entity_type,
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ArbiterError::Validation(ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        })
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ArbiterError::Validation(ValidationError::RequiredFieldMissing {
            field: field.into(),
        })
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ArbiterError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArbiterError::NotFound { .. } | ArbiterError::Storage(StorageError::NotFound { .. })
        )
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, ArbiterError::InvalidState { .. })
    }
}

/// Result type alias for ARBITER operations.
pub type ArbiterResult<T> = Result<T, ArbiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let id = Uuid::now_v7();
        let err = StorageError::NotFound {
            entity_type: "proposal",
            id,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("proposal"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_invalid_state_display() {
        let id = Uuid::now_v7();
        let err = ArbiterError::invalid_state("decision", id, "already rolled back");
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("already rolled back"));
    }

    #[test]
    fn test_from_conversions() {
        let err: ArbiterError = StorageError::LockPoisoned.into();
        assert!(matches!(err, ArbiterError::Storage(StorageError::LockPoisoned)));

        let err: ArbiterError = ConfigError::MissingRequired {
            field: "adaptation".to_string(),
        }
        .into();
        assert!(matches!(err, ArbiterError::Config(_)));
    }

    #[test]
    fn test_transient_classification() {
        let transient: ArbiterError = StorageError::Unavailable {
            reason: "connection reset".to_string(),
        }
        .into();
        assert!(transient.is_transient());
        assert!(!ArbiterError::missing_field("agent_name").is_transient());
    }

    #[test]
    fn test_not_found_covers_storage_variant() {
        let id = Uuid::now_v7();
        let storage: ArbiterError = StorageError::NotFound {
            entity_type: "decision",
            id,
        }
        .into();
        assert!(storage.is_not_found());
        assert!(ArbiterError::not_found("decision", id).is_not_found());
    }
}
