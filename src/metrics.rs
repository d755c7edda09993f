use tracing::trace;

// Counters are emitted as trace events; the Prometheus recorder installed in
// main only backs the /metrics endpoint.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "gemiturn.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn classification(outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "gemiturn.metrics",
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "classifications_total_inc"
    );
}

pub fn batch_completed(attempted: usize, succeeded: usize, failed: usize, elapsed_ms: u128) {
    trace!(
        target = "gemiturn.metrics",
        attempted = attempted as u64,
        succeeded = succeeded as u64,
        failed = failed as u64,
        elapsed_ms = elapsed_ms as u64,
        "batch_completed"
    );
}
