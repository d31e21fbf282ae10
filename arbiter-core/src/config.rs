//! Configuration types

use crate::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for transient storage failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Event dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Defaults for a user's adaptation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationSettings {
    pub user_opted_in: bool,
    pub mode: AdaptationMode,
    pub cooldown_minutes: i64,
    pub rate_limit: RateLimit,
    pub allowed_risk_levels: Vec<RiskLevel>,
    pub thresholds: ConfidenceThresholds,
}

impl Default for AdaptationSettings {
    fn default() -> Self {
        Self {
            user_opted_in: false,
            mode: AdaptationMode::Automatic,
            cooldown_minutes: 60,
            rate_limit: RateLimit::default(),
            allowed_risk_levels: vec![RiskLevel::Low, RiskLevel::Medium],
            thresholds: ConfidenceThresholds::default(),
        }
    }
}

impl AdaptationSettings {
    pub fn to_policy(&self, now: Timestamp) -> AdaptationPolicy {
        AdaptationPolicy {
            user_opted_in: self.user_opted_in,
            mode: self.mode,
            cooldown_minutes: self.cooldown_minutes,
            rate_limit: self.rate_limit.clone(),
            allowed_risk_levels: self.allowed_risk_levels.clone(),
            thresholds: self.thresholds.clone(),
            ..AdaptationPolicy::new(now)
        }
    }
}

/// When an observed pattern becomes a suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub min_occurrences: u32,
    pub min_confidence: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            min_occurrences: 3,
            min_confidence: 0.6,
        }
    }
}

/// Logging and metrics settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `tracing-subscriber` env-filter directive.
    pub log_filter: String,
    pub json_logs: bool,
    /// Prefix of every metric name.
    pub metrics_namespace: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            json_logs: false,
            metrics_namespace: "arbiter".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArbiterConfig {
    pub retry: RetryConfig,
    pub events: EventConfig,
    pub adaptation: AdaptationSettings,
    pub learning: LearningConfig,
    pub telemetry: TelemetryConfig,
    pub preferences: Vec<PreferenceDefinition>,
}

impl ArbiterConfig {
    /// Parse TOML and validate the result.
    pub fn from_toml_str(input: &str) -> ArbiterResult<Self> {
        let config: ArbiterConfig = toml::from_str(input).map_err(|e| {
            ArbiterError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build the preference registry declared by this configuration.
    pub fn preference_registry(&self) -> ArbiterResult<PreferenceRegistry> {
        PreferenceRegistry::from_definitions(self.preferences.iter().cloned())
    }

    pub fn validate(&self) -> ArbiterResult<()> {
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "backoff_multiplier must be at least 1.0",
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(
                "retry.initial_backoff_ms",
                self.retry.initial_backoff_ms,
                "initial_backoff_ms must not exceed max_backoff_ms",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(invalid(
                "events.channel_capacity",
                self.events.channel_capacity,
                "channel_capacity must be greater than 0",
            ));
        }
        if self.adaptation.cooldown_minutes < 0 {
            return Err(invalid(
                "adaptation.cooldown_minutes",
                self.adaptation.cooldown_minutes,
                "cooldown_minutes must be non-negative",
            ));
        }
        if self.adaptation.rate_limit.window_minutes <= 0 {
            return Err(invalid(
                "adaptation.rate_limit.window_minutes",
                self.adaptation.rate_limit.window_minutes,
                "window_minutes must be greater than 0",
            ));
        }
        let t = &self.adaptation.thresholds;
        for (field, value) in [
            ("adaptation.thresholds.low", t.low),
            ("adaptation.thresholds.medium", t.medium),
            ("adaptation.thresholds.high", t.high),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, value, "threshold must be between 0.0 and 1.0"));
            }
        }
        if !(0.0..=1.0).contains(&self.learning.min_confidence) {
            return Err(invalid(
                "learning.min_confidence",
                self.learning.min_confidence,
                "min_confidence must be between 0.0 and 1.0",
            ));
        }
        if self.telemetry.metrics_namespace.trim().is_empty() {
            return Err(ArbiterError::Config(ConfigError::MissingRequired {
                field: "telemetry.metrics_namespace".to_string(),
            }));
        }
        self.preference_registry().map_err(|e| {
            invalid("preferences", self.preferences.len(), &e.to_string())
        })?;
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ArbiterError {
    ArbiterError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}
