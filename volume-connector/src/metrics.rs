//! Connector operation metrics
//!
//! Recorded through the `metrics` facade; they are no-ops until the embedding
//! process installs a recorder.

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names
pub mod names {
    /// Counter: Total connector operations by type and status
    pub const OPERATIONS_TOTAL: &str = "volume_connector_operations_total";
    /// Histogram: Duration of connector operations in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "volume_connector_operation_duration_seconds";
    /// Counter: Device removals that did not converge in time
    pub const REMOVAL_TIMEOUTS_TOTAL: &str = "volume_connector_removal_timeouts_total";
}

/// Record a connector operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

pub fn record_removal_timeout() {
    counter!(names::REMOVAL_TIMEOUTS_TOTAL).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }

    /// Finish according to `result`, passing it through.
    pub fn finish<T>(self, result: crate::Result<T>) -> crate::Result<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code()),
        }
        result
    }
}
