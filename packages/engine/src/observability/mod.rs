// packages/engine/src/observability/mod.rs
//! Logging and metrics setup
//!
//! - **Tracing**: `EnvFilter` + `fmt` layer, human-readable or JSON lines on
//!   stderr. `RUST_LOG` overrides the configured level.
//! - **Metrics**: recorded with the `metrics` macros throughout the engine;
//!   exported for Prometheus scraping only when a listen address is set.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Responses by outcome (`ok`, `failed`, `error`, `timeout`, `rejected`)
pub const EVALUATIONS_TOTAL: &str = "kernel_evaluations_total";

/// Time from submission to response
pub const EVALUATION_SECONDS: &str = "kernel_evaluation_seconds";

pub const SESSIONS_STARTED_TOTAL: &str = "kernel_sessions_started_total";

pub const SESSIONS_CRASHED_TOTAL: &str = "kernel_sessions_crashed_total";

/// Pool members currently able to serve
pub const POOL_HEALTHY_MEMBERS: &str = "kernel_pool_healthy_members";

/// Install the global tracing subscriber
///
/// Returns an error if the configured filter is invalid or a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| EngineError::InvalidConfiguration(format!("log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    installed.map_err(|e| EngineError::RuntimeError(format!("tracing init: {}", e)))
}

/// Install the Prometheus exporter if a listen address is configured
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let Some(listen) = config.listen else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| EngineError::RuntimeError(format!("metrics exporter: {}", e)))?;

    describe_metrics();
    info!(%listen, "Prometheus exporter listening");
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(EVALUATIONS_TOTAL, "Kernel evaluations by outcome");
    metrics::describe_histogram!(
        EVALUATION_SECONDS,
        metrics::Unit::Seconds,
        "Time from request submission to kernel response"
    );
    metrics::describe_counter!(SESSIONS_STARTED_TOTAL, "Kernel sessions that became ready");
    metrics::describe_counter!(SESSIONS_CRASHED_TOTAL, "Kernel sessions lost to a fatal error");
    metrics::describe_gauge!(POOL_HEALTHY_MEMBERS, "Pool members able to serve requests");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "engine=loud".to_string(),
            json: false,
        };
        assert!(matches!(
            init_tracing(&config),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_metrics_disabled_without_listen_address() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }
}
