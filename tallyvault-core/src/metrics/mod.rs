//! Metrics collection for observability
//!
//! Metrics are emitted through the `metrics` facade; installing a recorder
//! (Prometheus, statsd, ...) is left to the embedding application.

use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Vault metrics
    describe_counter!("vault.mutations", "Local field writes and deletes committed");
    describe_counter!("vault.remote_ops.applied", "Remote operations merged into local state");
    describe_counter!("vault.remote_ops.duplicate", "Remote operations ignored as already applied");
    describe_histogram!("vault.mutation.duration_ms", "Local mutation duration in milliseconds");

    // CRDT / conflict metrics
    describe_counter!("crdt.conflicts.detected", "Conflict records created");
    describe_counter!("crdt.conflicts.resolved", "Conflict records resolved by a user");
    describe_counter!("crdt.conflicts.superseded", "Conflicts closed by a causally later operation");

    // Crypto metrics
    describe_counter!("crypto.fields.encrypted", "Field values sealed");
    describe_counter!("crypto.integrity_failures", "Authentication failures on decrypt or unwrap");

    // Sync metrics
    describe_counter!("sync.push.entries", "Operation log entries pushed to the relay");
    describe_counter!("sync.pull.entries", "Operation log entries pulled from the relay");
    describe_counter!("sync.retries", "Sync attempts retried after a transient failure");
    describe_histogram!("sync.exchange.duration_ms", "Push/pull round duration in milliseconds");

    // Rotation / audit metrics
    describe_counter!("rotation.entities", "Entities re-encrypted by rotation jobs");
    describe_counter!("rotation.jobs.completed", "Rotation jobs completed");
    describe_counter!("audit.entries", "Audit entries appended");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

pub fn record_integrity_failure() {
    record_counter("crypto.integrity_failures", 1);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        record_histogram(self.name, duration.as_secs_f64() * 1000.0);
    }
}
