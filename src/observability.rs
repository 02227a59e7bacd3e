use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::messages::{Anomaly, Fault};

/// Runtime message and saga counters
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub messages_handled: AtomicU64,
    pub faults: AtomicU64,
    pub anomalies: AtomicU64,
    pub continuations_scheduled: AtomicU64,
    pub continuations_dropped: AtomicU64,
    pub sagas_completed: AtomicU64,
    pub handler_errors: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_message(&self) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self, fault: &Fault) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        warn!(wip_id = %fault.wip_id(), fault = fault.name(), "Operation fault published");
    }

    pub fn record_anomaly(&self, anomaly: &Anomaly) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        warn!(wip_id = %anomaly.wip_id(), anomaly = anomaly.name(), ?anomaly, "Consistency anomaly");
    }

    pub fn record_continuation_scheduled(&self) {
        self.continuations_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_continuation_dropped(&self) {
        self.continuations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_completed(&self) {
        self.sagas_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> RuntimeStats {
        RuntimeStats {
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            continuations_scheduled: self.continuations_scheduled.load(Ordering::Relaxed),
            continuations_dropped: self.continuations_dropped.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Runtime metrics: messages={}, faults={}, anomalies={}, continuations={}, dropped={}, completed={}, errors={}",
            stats.messages_handled,
            stats.faults,
            stats.anomalies,
            stats.continuations_scheduled,
            stats.continuations_dropped,
            stats.sagas_completed,
            stats.handler_errors
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub messages_handled: u64,
    pub faults: u64,
    pub anomalies: u64,
    pub continuations_scheduled: u64,
    pub continuations_dropped: u64,
    pub sagas_completed: u64,
    pub handler_errors: u64,
}

/// Span every inbound message is handled in, correlated by unit.
pub fn create_saga_span(message: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "saga",
        message.name = message,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
