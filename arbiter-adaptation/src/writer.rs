//! Preference writes paired with their audit entry.
//!
//! A write stores the new state, stores the attempt that caused it (if any),
//! seals the audit entry, then appends the change record. When a step before
//! the seal fails the earlier steps are undone, so a change is never visible
//! without its attempt and ledger entry.

use arbiter_arbitration::with_retry;
use arbiter_core::{
    ArbiterResult, AuditDraft, AuditEntry, AutoAdaptationAttempt, PreferenceChangeRecord,
    PreferenceState, RetryConfig,
};
use arbiter_events::AuditTrail;
use arbiter_storage::ArbiterStore;
use std::sync::Arc;
use tracing::{error, warn};

/// One preference change and everything recorded with it.
#[derive(Debug, Clone)]
pub(crate) struct PreferenceChange {
    /// Stored state before the change. `None` means the registry default.
    pub before: Option<PreferenceState>,
    pub after: PreferenceState,
    pub record: PreferenceChangeRecord,
    pub audit: AuditDraft,
    /// Attempt stored alongside the change, for learned adaptations.
    pub attempt: Option<AutoAdaptationAttempt>,
}

pub(crate) struct PreferenceWriter<S> {
    store: Arc<S>,
    audit: AuditTrail,
    retry: RetryConfig,
}

impl<S: ArbiterStore + 'static> PreferenceWriter<S> {
    pub fn new(store: Arc<S>, retry: RetryConfig) -> Self {
        Self {
            audit: AuditTrail::new(store.clone()),
            store,
            retry,
        }
    }

    pub async fn write(&self, change: &PreferenceChange) -> ArbiterResult<AuditEntry> {
        with_retry(&self.retry, "preference_upsert", || {
            self.store.preference_upsert(&change.after)
        })
        .await?;

        if let Some(attempt) = &change.attempt {
            if let Err(e) = self.insert_attempt(attempt).await {
                warn!(
                    attempt_id = %attempt.attempt_id,
                    error = %e,
                    "Attempt insert failed, restoring previous preference state"
                );
                self.compensate(change).await;
                return Err(e);
            }
        }

        let entry = match with_retry(&self.retry, "audit_append", || {
            self.audit.append(change.audit.clone())
        })
        .await
        {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    category = %change.after.category,
                    key = %change.after.key,
                    error = %e,
                    "Audit append failed, restoring previous preference state"
                );
                if let Some(attempt) = &change.attempt {
                    self.discard_attempt(attempt).await;
                }
                self.compensate(change).await;
                return Err(e);
            }
        };

        with_retry(&self.retry, "preference_append_change", || {
            self.store.preference_append_change(&change.record)
        })
        .await?;
        Ok(entry)
    }

    /// Store an attempt that changed nothing, together with its audit entry.
    pub async fn record_attempt(
        &self,
        attempt: &AutoAdaptationAttempt,
        audit: &AuditDraft,
    ) -> ArbiterResult<AuditEntry> {
        self.insert_attempt(attempt).await?;
        match with_retry(&self.retry, "audit_append", || self.audit.append(audit.clone())).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                warn!(
                    attempt_id = %attempt.attempt_id,
                    error = %e,
                    "Audit append failed, discarding attempt"
                );
                self.discard_attempt(attempt).await;
                Err(e)
            }
        }
    }

    async fn insert_attempt(&self, attempt: &AutoAdaptationAttempt) -> ArbiterResult<()> {
        with_retry(&self.retry, "attempt_insert", || self.store.attempt_insert(attempt)).await
    }

    async fn discard_attempt(&self, attempt: &AutoAdaptationAttempt) {
        let removed = with_retry(&self.retry, "attempt_delete", || {
            self.store.attempt_delete(attempt.attempt_id)
        })
        .await;
        if let Err(e) = removed {
            error!(
                attempt_id = %attempt.attempt_id,
                error = %e,
                "Failed to discard attempt after aborted write"
            );
        }
    }

    async fn compensate(&self, change: &PreferenceChange) {
        let category = &change.after.category;
        let key = &change.after.key;
        let restored = match &change.before {
            Some(state) => {
                with_retry(&self.retry, "preference_upsert", || {
                    self.store.preference_upsert(state)
                })
                .await
            }
            None => {
                with_retry(&self.retry, "preference_reset", || {
                    self.store.preference_reset(category, key)
                })
                .await
            }
        };
        if let Err(e) = restored {
            error!(
                category = %category,
                key = %key,
                error = %e,
                "Failed to restore preference after aborted write"
            );
        }
    }
}

impl<S> std::fmt::Debug for PreferenceWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceWriter")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::{AuditKind, ChangeSource, PreferenceKey, PreferenceValue};
    use arbiter_storage::{MemoryStore, PreferenceRepository};
    use chrono::Utc;

    fn retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
        }
    }

    fn change(before: Option<PreferenceState>, value: &str) -> PreferenceChange {
        let now = Utc::now();
        let key = PreferenceKey::new("coaching", "tone");
        let previous = before.as_ref().map(|s| s.value.clone());
        PreferenceChange {
            after: PreferenceState {
                category: "coaching".to_string(),
                key: "tone".to_string(),
                value: PreferenceValue::from(value),
                locked: false,
                updated_at: now,
            },
            before,
            record: PreferenceChangeRecord::new(
                "coach",
                &key,
                previous,
                PreferenceValue::from(value),
                ChangeSource::Learning,
                "test",
                now,
            ),
            audit: AuditDraft::new(
                AuditKind::AdaptationAttempted,
                uuid::Uuid::now_v7(),
                "tone changed",
                serde_json::json!({}),
                now,
            ),
            attempt: None,
        }
    }

    #[tokio::test]
    async fn test_write_records_state_history_and_audit() {
        let store = MemoryStore::new();
        let writer = PreferenceWriter::new(Arc::new(store.clone()), retry());

        writer.write(&change(None, "direct")).await.unwrap();

        let state = store.preference_get("coaching", "tone").await.unwrap().unwrap();
        assert_eq!(state.value, PreferenceValue::from("direct"));
        assert_eq!(store.preference_history("coaching", "tone").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_audit_restores_default() {
        let store = MemoryStore::new();
        let writer = PreferenceWriter::new(Arc::new(store.clone()), retry());
        store.fail_next("audit_append", 5);

        assert!(writer.write(&change(None, "direct")).await.is_err());

        assert!(store.preference_get("coaching", "tone").await.unwrap().is_none());
        assert!(store.preference_history("coaching", "tone").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_audit_restores_stored_state() {
        let store = MemoryStore::new();
        let writer = PreferenceWriter::new(Arc::new(store.clone()), retry());
        let first = change(None, "direct");
        writer.write(&first).await.unwrap();

        store.fail_next("audit_append", 5);
        let second = change(Some(first.after.clone()), "gentle");
        assert!(writer.write(&second).await.is_err());

        let state = store.preference_get("coaching", "tone").await.unwrap().unwrap();
        assert_eq!(state.value, PreferenceValue::from("direct"));
    }
}
