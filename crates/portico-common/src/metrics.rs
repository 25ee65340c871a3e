//! Metrics registry
//!
//! OpenTelemetry instruments for the work queue, the object cache and the
//! reconcile engine. Instruments are created lazily on first use against the
//! global meter provider, so recording is a no-op until telemetry is
//! initialized with an OTLP endpoint.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("portico"));

// ============================================================================
// Work Queue
// ============================================================================

/// Counter of keys accepted by the queue
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_ADDS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portico_queue_adds_total")
        .with_description("Total number of keys added to the work queue")
        .with_unit("{keys}")
        .build()
});

/// Counter of rate-limited requeues
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_RETRIES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portico_queue_retries_total")
        .with_description("Total number of rate-limited requeues")
        .with_unit("{retries}")
        .build()
});

/// Gauge of keys ready to be handed to a worker
///
/// Labels:
/// - `queue`: queue name
pub static QUEUE_DEPTH: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("portico_queue_depth")
        .with_description("Number of keys waiting in the work queue")
        .with_unit("{keys}")
        .build()
});

// ============================================================================
// Reconcile
// ============================================================================

/// Histogram of reconcile duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("portico_reconcile_duration_seconds")
        .with_description("Duration of a single reconcile in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconciles
///
/// Labels:
/// - `error_type`: see `Error::kind_label`
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portico_reconcile_errors_total")
        .with_description("Total number of failed reconciles")
        .with_unit("{errors}")
        .build()
});

/// Counter of reconcile outcomes
///
/// Labels:
/// - `action`: create, delete, noop
pub static RECONCILE_ACTIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portico_reconcile_actions_total")
        .with_description("Total number of reconcile decisions by action")
        .with_unit("{actions}")
        .build()
});

// ============================================================================
// Cache
// ============================================================================

/// Counter of notifications emitted by the object cache
///
/// Labels:
/// - `kind`: Service, Ingress
/// - `event`: added, updated, deleted
pub static CACHE_EVENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("portico_cache_events_total")
        .with_description("Total number of cache notifications by kind and event")
        .with_unit("{events}")
        .build()
});

// ============================================================================
// Helpers
// ============================================================================

/// Record a queue add
pub fn record_queue_add(queue: &str, depth: usize) {
    let labels = [KeyValue::new("queue", queue.to_string())];
    QUEUE_ADDS.add(1, &labels);
    QUEUE_DEPTH.record(depth as u64, &labels);
}

/// Record the current queue depth after a key left or re-entered the queue
pub fn record_queue_depth(queue: &str, depth: usize) {
    QUEUE_DEPTH.record(depth as u64, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a rate-limited requeue
pub fn record_queue_retry(queue: &str) {
    QUEUE_RETRIES.add(1, &[KeyValue::new("queue", queue.to_string())]);
}

/// Record a cache notification
pub fn record_cache_event(kind: &'static str, event: &'static str) {
    CACHE_EVENTS.add(
        1,
        &[KeyValue::new("kind", kind), KeyValue::new("event", event)],
    );
}

/// Record the action a reconcile decided on
pub fn record_reconcile_action(action: &'static str) {
    RECONCILE_ACTIONS.add(1, &[KeyValue::new("action", action)]);
}

/// Times one reconcile
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "success")],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", "error")],
        );
        RECONCILE_ERRORS.add(1, &[KeyValue::new("error_type", error_type)]);
    }
}
