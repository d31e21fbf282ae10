//! Rollback coordinator
//!
//! Reverts a preference to a value that was actually recorded before: the
//! value a proposal saw when it was made, the value an applied attempt
//! replaced, or the previous value in the change history. Each rollback
//! writes the preference and its audit entry as one operation.

use crate::writer::{PreferenceChange, PreferenceWriter};
use arbiter_arbitration::{decision_change_reason, with_retry};
use arbiter_core::{
    ArbiterError, ArbiterResult, AttemptId, AuditKind, ChangeSource, DecisionId, DomainEvent,
    PreferenceChangeRecord, PreferenceKey, PreferenceRegistry, PreferenceState, PreferenceValue,
    ProposedAction, RetryConfig, RollbackSource, Timestamp,
};
use arbiter_events::{AuditTrail, EventDispatcher};
use arbiter_storage::ArbiterStore;
use arbiter_telemetry::ObservabilityContext;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// What a rollback restored.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackReport {
    pub category: String,
    pub key: String,
    /// Value in effect before the rollback.
    pub replaced_value: PreferenceValue,
    pub restored_value: PreferenceValue,
    pub source: RollbackSource,
}

fn source_label(source: &RollbackSource) -> &'static str {
    match source {
        RollbackSource::Decision(_) => "decision",
        RollbackSource::Attempt(_) => "attempt",
        RollbackSource::History(_) => "history",
    }
}

pub struct RollbackCoordinator<S> {
    store: Arc<S>,
    registry: Arc<PreferenceRegistry>,
    writer: PreferenceWriter<S>,
    audit: AuditTrail,
    dispatcher: Arc<EventDispatcher>,
    observability: ObservabilityContext,
    retry: RetryConfig,
    serial: Mutex<()>,
}

impl<S: ArbiterStore + 'static> RollbackCoordinator<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<PreferenceRegistry>,
        dispatcher: Arc<EventDispatcher>,
        observability: ObservabilityContext,
        retry: RetryConfig,
    ) -> Self {
        Self {
            writer: PreferenceWriter::new(store.clone(), retry.clone()),
            audit: AuditTrail::new(store.clone()),
            store,
            registry,
            dispatcher,
            observability,
            retry,
            serial: Mutex::new(()),
        }
    }

    /// Revert the preference written by an executed decision.
    ///
    /// # Arguments
    /// * `decision_id` - An executed decision whose winner was an `apply_preference`
    /// * `reason` - Recorded in the change history and the audit entry
    ///
    /// # Returns
    /// The restored value: the previous value on the change record the
    /// decision wrote, else the value the proposal saw. Fails with
    /// `InvalidState` when the decision never executed, has no winner, is not
    /// a preference change, has no recorded value, or was already rolled back.
    pub async fn rollback_by_decision(
        &self,
        decision_id: DecisionId,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<RollbackReport> {
        let _guard = self.serial.lock().await;
        let decision = self
            .store
            .decision_get(decision_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("decision", decision_id))?;
        if !decision.executed {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                "only executed decisions can be rolled back",
            ));
        }
        let winner = decision.winning_proposal_id.ok_or_else(|| {
            ArbiterError::invalid_state("decision", decision_id, "has no winning proposal")
        })?;
        let proposal = self
            .store
            .proposal_get(winner)
            .await?
            .ok_or_else(|| ArbiterError::not_found("proposal", winner))?;
        let ProposedAction::ApplyPreference {
            category,
            key,
            current_value,
            ..
        } = &proposal.action
        else {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                format!("{} is not revertible", proposal.action_type()),
            ));
        };

        let already = self
            .audit
            .entries_for(decision_id)
            .await?
            .iter()
            .any(|e| e.kind == AuditKind::PreferenceRolledBack);
        if already {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                "already rolled back",
            ));
        }

        // The decision's own change record holds the value it actually
        // replaced; the proposal's snapshot may be older or missing.
        let reason_marker = decision_change_reason(decision_id);
        let replaced = self
            .store
            .preference_history(category, key)
            .await?
            .into_iter()
            .find(|r| r.changed_by == ChangeSource::Arbitration && r.reason == reason_marker)
            .and_then(|r| r.previous_value);
        let Some(restored) = replaced.or_else(|| current_value.clone()) else {
            return Err(ArbiterError::invalid_state(
                "decision",
                decision_id,
                "no recorded value to restore",
            ));
        };
        self.restore(
            &proposal.agent_name,
            &PreferenceKey::new(category, key),
            restored,
            RollbackSource::Decision(decision_id),
            reason,
            now,
        )
        .await
    }

    /// Revert one applied attempt. A second call fails with `InvalidState`.
    pub async fn rollback_attempt(
        &self,
        attempt_id: AttemptId,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<RollbackReport> {
        let _guard = self.serial.lock().await;
        self.rollback_attempt_locked(attempt_id, reason, now).await
    }

    /// Revert the latest change to a preference: the most recent applied
    /// attempt still in effect, else the previous value of the most recent
    /// history record.
    pub async fn rollback_by_preference(
        &self,
        category: &str,
        key: &str,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<RollbackReport> {
        let _guard = self.serial.lock().await;
        if let Some(attempt) = self.store.attempt_latest_active(category, key).await? {
            return self
                .rollback_attempt_locked(attempt.attempt_id, reason, now)
                .await;
        }

        let history = self.store.preference_history(category, key).await?;
        let Some(last) = history.first() else {
            return Err(ArbiterError::invalid_value(
                format!("{}/{}", category, key),
                "no recorded change to roll back",
            ));
        };
        let Some(previous) = last.previous_value.clone() else {
            return Err(ArbiterError::invalid_state(
                "preference_change",
                last.record_id,
                "current value is the first recorded value",
            ));
        };
        self.restore(
            &last.agent_name,
            &PreferenceKey::new(category, key),
            previous,
            RollbackSource::History(last.record_id),
            reason,
            now,
        )
        .await
    }

    /// Revert every applied attempt still in effect for one agent type,
    /// the preference category its agents write to, newest first. Returns
    /// how many were reverted.
    pub async fn rollback_all_for_agent(
        &self,
        category: &str,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<usize> {
        let _guard = self.serial.lock().await;
        let mut active: Vec<_> = self
            .store
            .attempt_list_by_rolled_back(false)
            .await?
            .into_iter()
            .filter(|a| a.category == category && a.is_active())
            .collect();
        active.sort_by(|a, b| {
            b.attempted_at
                .cmp(&a.attempted_at)
                .then(b.attempt_id.cmp(&a.attempt_id))
        });

        for attempt in &active {
            self.rollback_attempt_locked(attempt.attempt_id, reason, now)
                .await?;
        }
        info!(category, count = active.len(), "Rolled back agent adaptations");
        Ok(active.len())
    }

    async fn rollback_attempt_locked(
        &self,
        attempt_id: AttemptId,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<RollbackReport> {
        let mut attempt = self
            .store
            .attempt_get(attempt_id)
            .await?
            .ok_or_else(|| ArbiterError::not_found("attempt", attempt_id))?;
        attempt.mark_rolled_back(reason, now)?;

        // A rollback that restored the value but failed to flag the attempt
        // is finished here instead of being applied twice.
        let recorded = self
            .audit
            .entries_for(attempt_id)
            .await?
            .into_iter()
            .any(|e| e.kind == AuditKind::PreferenceRolledBack);
        if recorded {
            with_retry(&self.retry, "attempt_update", || self.store.attempt_update(&attempt))
                .await?;
            return Err(ArbiterError::invalid_state(
                "attempt",
                attempt_id,
                "already rolled back",
            ));
        }

        let restored = match &attempt.previous_value {
            Some(value) => value.clone(),
            None => {
                self.registry
                    .require(&attempt.category, &attempt.key)?
                    .default_value
                    .clone()
            }
        };
        let report = self
            .restore(
                &attempt.agent_name,
                &attempt.preference_key(),
                restored,
                RollbackSource::Attempt(attempt_id),
                reason,
                now,
            )
            .await?;
        with_retry(&self.retry, "attempt_update", || self.store.attempt_update(&attempt)).await?;
        Ok(report)
    }

    async fn restore(
        &self,
        agent_name: &str,
        key: &PreferenceKey,
        restored: PreferenceValue,
        source: RollbackSource,
        reason: &str,
        now: Timestamp,
    ) -> ArbiterResult<RollbackReport> {
        let definition = self.registry.require(&key.category, &key.key)?;
        let stored = self.store.preference_get(&key.category, &key.key).await?;
        let mut after = stored
            .clone()
            .unwrap_or_else(|| PreferenceState::from_default(definition, now));
        let replaced = std::mem::replace(&mut after.value, restored.clone());
        after.updated_at = now;

        let subject: Uuid = match source {
            RollbackSource::Decision(id) => id.into(),
            RollbackSource::Attempt(id) => id.into(),
            RollbackSource::History(id) => id.into(),
        };
        let payload = json!({
            "category": key.category,
            "key": key.key,
            "replaced_value": replaced,
            "restored_value": restored,
            "source": source,
            "reason": reason,
        });
        let change = PreferenceChange {
            before: stored,
            record: PreferenceChangeRecord::new(
                agent_name,
                key,
                Some(replaced.clone()),
                restored.clone(),
                ChangeSource::Rollback,
                reason,
                now,
            ),
            audit: AuditTrail::draft(
                AuditKind::PreferenceRolledBack,
                subject,
                format!(
                    "{}/{} rolled back from {} to {}: {}",
                    key.category, key.key, replaced, restored, reason
                ),
                &payload,
                now,
            )?,
            attempt: None,
            after,
        };
        self.writer.write(&change).await?;

        info!(
            category = %key.category,
            key = %key.key,
            restored = %restored,
            source = source_label(&source),
            "Preference rolled back"
        );
        self.observability.metrics.record_rollback(source_label(&source));
        self.dispatcher.publish(
            DomainEvent::PreferenceRolledBack {
                category: key.category.clone(),
                key: key.key.clone(),
                restored_value: restored.clone(),
                source,
                reason: reason.to_string(),
            },
            now,
        );
        Ok(RollbackReport {
            category: key.category.clone(),
            key: key.key.clone(),
            replaced_value: replaced,
            restored_value: restored,
            source,
        })
    }
}

impl<S> std::fmt::Debug for RollbackCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("preferences", &self.registry.len())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
