use tracing::trace;

// Counters are emitted as trace events on `hermes.metrics`; the Prometheus
// recorder only serves the `/metrics` endpoint.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "hermes.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "hermes.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

/// A best-effort stage took its degrade branch (`grouping`, `enhance`,
/// `analysis`).
pub fn fallback_applied(stage: &'static str, count: usize) {
    trace!(
        target = "hermes.metrics",
        stage = stage,
        count = count as u64,
        "fallback_applied"
    );
}

pub fn review_action(action: &'static str) {
    trace!(
        target = "hermes.metrics",
        action = action,
        "review_action_inc"
    );
}
