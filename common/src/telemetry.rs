// Telemetry module for structured logging and pool metrics

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging
///
/// This function sets up the tracing subscriber with:
/// - JSON formatting (with span context) or human-readable output
/// - Log levels from `RUST_LOG`, falling back to the configured level
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let registry = tracing_subscriber::registry();

    if json {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(env_filter);
        registry
            .with(json_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        let human_layer = fmt::layer().with_target(false).with_filter(env_filter);
        registry
            .with(human_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(log_level = log_level, json = json, "Structured logging initialized");

    Ok(())
}

/// Initialize Prometheus metrics exporter
///
/// Registers the pool and transaction counters:
/// - db_pool_acquired_total / db_pool_released_total
/// - db_pool_errors_total / db_pool_timeouts_total / db_pool_late_reclaimed_total
/// - db_transaction_attempts_total / db_transaction_retries_total
/// - db_pool_state: Gauge with the numeric pool state
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("db_pool_acquired_total", "Connections checked out of the pool");
    describe_counter!("db_pool_released_total", "Connections returned to the pool");
    describe_counter!("db_pool_errors_total", "Failed connection acquisitions and probes");
    describe_counter!("db_pool_timeouts_total", "Acquisitions that lost the timeout race");
    describe_counter!(
        "db_pool_late_reclaimed_total",
        "Connections that arrived after an acquire timeout and were returned"
    );
    describe_counter!("db_transaction_attempts_total", "Transaction attempts started");
    describe_counter!(
        "db_transaction_retries_total",
        "Transaction attempts retried after a transient conflict"
    );
    describe_gauge!("db_pool_state", "Pool state (0 uninitialized .. 4 closed)");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Pool counters mirrored into the metrics facade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Acquired,
    Released,
    Error,
    Timeout,
    LateReclaimed,
}

impl PoolEvent {
    fn metric_name(self) -> &'static str {
        match self {
            PoolEvent::Acquired => "db_pool_acquired_total",
            PoolEvent::Released => "db_pool_released_total",
            PoolEvent::Error => "db_pool_errors_total",
            PoolEvent::Timeout => "db_pool_timeouts_total",
            PoolEvent::LateReclaimed => "db_pool_late_reclaimed_total",
        }
    }
}

#[inline]
pub fn record_pool_event(event: PoolEvent) {
    counter!(event.metric_name()).increment(1);
}

#[inline]
pub fn record_pool_state(state_code: u8) {
    gauge!("db_pool_state").set(state_code as f64);
}

/// Record the start of a transaction attempt; `retry` is true for attempts after the first
#[inline]
pub fn record_transaction_attempt(retry: bool) {
    counter!("db_transaction_attempts_total").increment(1);
    if retry {
        counter!("db_transaction_retries_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_only_once() {
        let _ = init_logging("info", false);
        // A global subscriber is installed now
        assert!(init_logging("debug", true).is_err());
    }

    #[test]
    fn test_metrics_recording() {
        // Recording without an installed recorder must not panic
        record_pool_event(PoolEvent::Acquired);
        record_pool_event(PoolEvent::LateReclaimed);
        record_pool_state(2);
        record_transaction_attempt(true);
    }

    #[test]
    fn test_metric_names_are_distinct() {
        let events = [
            PoolEvent::Acquired,
            PoolEvent::Released,
            PoolEvent::Error,
            PoolEvent::Timeout,
            PoolEvent::LateReclaimed,
        ];
        let names: std::collections::HashSet<_> =
            events.iter().map(|e| e.metric_name()).collect();
        assert_eq!(names.len(), events.len());
    }
}
