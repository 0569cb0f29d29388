//! Metrics emitted by the gateway.
//!
//! Recorded through the `metrics` facade; the binary installs the
//! Prometheus exporter when the `metrics` plugin is enabled. Without an
//! installed recorder every call here is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "gateway_queries_total",
        "Total number of GraphQL operations received"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        "Latency of sub-requests sent to upstream services in seconds"
    );
    describe_counter!(
        "gateway_errors_total",
        "Total number of failed or partially failed operations"
    );
    describe_counter!(
        "gateway_schema_refreshes_total",
        "Total number of schema refresh attempts"
    );
    describe_gauge!(
        "gateway_degraded_upstreams",
        "Number of upstreams excluded from the merged schema"
    );
}

/// Record an incoming operation.
///
/// # Arguments
/// * `kind` - The operation kind ("query", "mutation") or "invalid"
pub fn record_query(kind: &str) {
    counter!("gateway_queries_total", "kind" => kind.to_string()).increment(1);
}

/// Record one upstream sub-request.
pub fn record_upstream_request(service: &str, duration: Duration, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    histogram!(
        "gateway_upstream_request_duration_seconds",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .record(duration.as_secs_f64());
}

/// Record an operation-level error.
///
/// # Arguments
/// * `kind` - Error label, see `GatewayError::kind`
pub fn record_error(kind: &str) {
    counter!("gateway_errors_total", "kind" => kind.to_string()).increment(1);
}

/// Record a schema refresh and the resulting number of degraded upstreams.
pub fn record_refresh(success: bool, degraded: usize) {
    let outcome = if success { "ok" } else { "error" };
    counter!("gateway_schema_refreshes_total", "outcome" => outcome).increment(1);
    gauge!("gateway_degraded_upstreams").set(degraded as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_a_recorder_is_a_noop() {
        init_metrics();
        record_query("query");
        record_upstream_request("users", Duration::from_millis(3), true);
        record_error("upstream_failed");
        record_refresh(false, 2);
    }
}
