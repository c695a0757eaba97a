use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Event processing metrics
    pub static ref EVENT_COUNTER: CounterVec = register_counter_vec!(
        "checkout_events_total",
        "Total number of bus events processed by the orchestrator",
        &["event_type", "outcome"]
    )
    .expect("metric cannot be created");

    pub static ref EVENT_DURATION: HistogramVec = register_histogram_vec!(
        "checkout_event_duration_seconds",
        "Event processing duration in seconds",
        &["event_type"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("metric cannot be created");

    // Saga lifecycle metrics
    pub static ref TRANSITION_COUNTER: CounterVec = register_counter_vec!(
        "checkout_state_transitions_total",
        "Total number of saga state transitions",
        &["from_state", "to_state"]
    )
    .expect("metric cannot be created");

    pub static ref SAGA_TERMINAL_COUNTER: CounterVec = register_counter_vec!(
        "checkout_sagas_terminal_total",
        "Total number of sagas reaching a terminal state",
        &["state"]
    )
    .expect("metric cannot be created");

    // Pricing RPC metrics
    pub static ref PRICING_COUNTER: CounterVec = register_counter_vec!(
        "checkout_pricing_requests_total",
        "Total number of pricing RPCs",
        &["service", "status"]
    )
    .expect("metric cannot be created");

    pub static ref PRICING_DURATION: HistogramVec = register_histogram_vec!(
        "checkout_pricing_duration_seconds",
        "Pricing RPC duration in seconds",
        &["service"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("metric cannot be created");

    // Idempotency metrics
    pub static ref IDEMPOTENCY_CHECK: CounterVec = register_counter_vec!(
        "checkout_idempotency_checks_total",
        "Total number of idempotency checks",
        &["status"]
    )
    .expect("metric cannot be created");

    // Bus publish metrics
    pub static ref PUBLISH_RETRY_COUNTER: CounterVec = register_counter_vec!(
        "checkout_publish_retries_total",
        "Total number of retried bus publishes",
        &["topic"]
    )
    .expect("metric cannot be created");

    // Reaper metrics
    pub static ref REAPED_SAGA_COUNTER: CounterVec = register_counter_vec!(
        "checkout_reaped_sagas_total",
        "Total number of sagas the reaper forced forward",
        &["state"]
    )
    .expect("metric cannot be created");
}

/// Get all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome and duration of one consumed event.
pub fn record_event(event_type: &str, outcome: &str, duration_secs: f64) {
    EVENT_COUNTER
        .with_label_values(&[event_type, outcome])
        .inc();
    EVENT_DURATION
        .with_label_values(&[event_type])
        .observe(duration_secs);
}

pub fn record_transition(from_state: &str, to_state: &str) {
    TRANSITION_COUNTER
        .with_label_values(&[from_state, to_state])
        .inc();
}

pub fn record_terminal(state: &str) {
    SAGA_TERMINAL_COUNTER.with_label_values(&[state]).inc();
}

pub fn record_pricing(service: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    PRICING_COUNTER.with_label_values(&[service, status]).inc();
    PRICING_DURATION
        .with_label_values(&[service])
        .observe(duration_secs);
}

pub fn record_idempotency_check(duplicate: bool) {
    let status = if duplicate { "duplicate" } else { "new" };
    IDEMPOTENCY_CHECK.with_label_values(&[status]).inc();
}

pub fn record_publish_retry(topic: &str) {
    PUBLISH_RETRY_COUNTER.with_label_values(&[topic]).inc();
}

pub fn record_reaped(state: &str) {
    REAPED_SAGA_COUNTER.with_label_values(&[state]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        let result = gather_metrics();
        assert!(result.is_ok());
    }

    #[test]
    fn test_record_event() {
        record_event("InventoryReserved", "applied", 0.1);
        let metrics = gather_metrics().unwrap();
        assert!(metrics.contains("checkout_events_total"));
    }

    #[test]
    fn test_record_idempotency_check() {
        record_idempotency_check(true);
        let metrics = gather_metrics().unwrap();
        assert!(metrics.contains("checkout_idempotency_checks_total"));
    }

    #[test]
    fn test_record_transition() {
        record_transition("INITIATED", "INVENTORY_RESERVATION_PENDING");
        let metrics = gather_metrics().unwrap();
        assert!(metrics.contains("checkout_state_transitions_total"));
    }
}
