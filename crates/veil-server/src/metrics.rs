//! Prometheus metrics for the PSI server
//!
//! Privacy-safe metrics: only operation and outcome labels, never item
//! content or per-query result counts.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

use veil_core::{Error, OperationKind};

pub const OUTCOME_OK: &str = "ok";
pub const OUTCOME_CLIENT_ERROR: &str = "client_error";
pub const OUTCOME_SERVER_ERROR: &str = "server_error";

/// Classify a handler error for the outcome label
pub fn outcome_for(error: &Error) -> &'static str {
    match error {
        Error::MalformedMessage(_)
        | Error::ContextMismatch { .. }
        | Error::InvalidOperationKind { .. }
        | Error::ParameterMismatch { .. } => OUTCOME_CLIENT_ERROR,
        _ => OUTCOME_SERVER_ERROR,
    }
}

pub fn record_request(operation: OperationKind, outcome: &str, duration: Duration) {
    counter!("psi_requests_total", "operation" => operation.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("psi_request_duration_seconds", "operation" => operation.to_string(), "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_connection_opened() {
    counter!("psi_connections_total").increment(1);
    gauge!("psi_connections_open").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("psi_connections_open").decrement(1.0);
}

pub fn record_result_parts(count: usize) {
    histogram!("psi_result_parts").record(count as f64);
}

pub fn set_db_items(items: usize) {
    gauge!("psi_db_items").set(items as f64);
}

/// Install the recorder and serve `/metrics` on `addr`
pub fn install_prometheus_exporter(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert_eq!(outcome_for(&Error::MalformedMessage("x".into())), OUTCOME_CLIENT_ERROR);
        assert_eq!(
            outcome_for(&Error::ParameterMismatch { request: 1, database: 2 }),
            OUTCOME_CLIENT_ERROR
        );
        assert_eq!(outcome_for(&Error::DatabaseNotLoaded), OUTCOME_SERVER_ERROR);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_request(OperationKind::Oprf, OUTCOME_OK, Duration::from_millis(3));
        record_connection_opened();
        record_connection_closed();
        set_db_items(10);
    }
}
