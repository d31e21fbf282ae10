//! ARBITER Telemetry - Metrics and Logging
//!
//! Observability never gates control flow: recording a metric cannot fail and
//! logging goes through `tracing`.

pub mod metrics;

pub use metrics::ArbiterMetrics;

use arbiter_core::{ArbiterError, ArbiterResult, TelemetryConfig};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Handle passed to every component that records metrics.
#[derive(Debug, Clone)]
pub struct ObservabilityContext {
    pub metrics: Arc<ArbiterMetrics>,
}

impl ObservabilityContext {
    pub fn new(config: &TelemetryConfig) -> ArbiterResult<Self> {
        Ok(Self {
            metrics: Arc::new(ArbiterMetrics::from_config(config)?),
        })
    }

    /// Context with default settings, convenient in tests.
    pub fn detached() -> ArbiterResult<Self> {
        Self::new(&TelemetryConfig::default())
    }
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured filter when set. Fails if a
/// subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> ArbiterResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ArbiterError::Collaborator {
        collaborator: "tracing",
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(
        log_filter = %config.log_filter,
        json_logs = config.json_logs,
        metrics_namespace = %config.metrics_namespace,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_context_has_fresh_metrics() {
        let ctx = ObservabilityContext::detached().unwrap();
        assert_eq!(ctx.metrics.suggestion_approved_total.get(), 0);
        ctx.metrics.record_suggestion_approved();
        assert_eq!(ctx.metrics.suggestion_approved_total.get(), 1);
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let config = TelemetryConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
