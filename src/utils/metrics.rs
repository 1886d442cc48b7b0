//! OTel-native metrics instruments.
//!
//! Instruments are created lazily from the global meter provider, so they
//! record into whatever exporter the host process installed (and into a
//! no-op meter otherwise). Feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("karma_bus"));

// ============================================================================
// Publishing
// ============================================================================

/// Total publish operations, labelled by routing key and outcome.
pub static BUS_PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("bus.publish.total")
        .with_description("Total event bus publish operations")
        .build()
});

/// Duration of publish operations, retries included.
pub static BUS_PUBLISH_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("bus.publish.duration")
        .with_description("Event bus publish duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Consuming
// ============================================================================

/// Settled deliveries, labelled by queue and outcome
/// (success, poison, transient, permanent).
pub static BUS_CONSUME_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("bus.consume.total")
        .with_description("Total deliveries settled by subscribers")
        .build()
});

/// Undecodable deliveries acked and dropped.
pub static BUS_POISON_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("bus.poison.total")
        .with_description("Total poison messages dropped")
        .build()
});

/// Duration of handler execution per delivery.
pub static BUS_HANDLE_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("bus.handle.duration")
        .with_description("Event handler duration")
        .with_unit("s")
        .build()
});

// ============================================================================
// Connection
// ============================================================================

/// Successful reconnects after a lost or invalidated connection.
pub static BUS_RECONNECT_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("bus.connection.reconnect.total")
        .with_description("Total broker reconnects")
        .build()
});

// ============================================================================
// Helper
// ============================================================================

pub fn queue_attr(queue: &str) -> KeyValue {
    KeyValue::new("queue", queue.to_string())
}

pub fn routing_key_attr(routing_key: &str) -> KeyValue {
    KeyValue::new("routing_key", routing_key.to_string())
}

/// Create an outcome label.
pub fn outcome_attr(outcome: &str) -> KeyValue {
    KeyValue::new("outcome", outcome.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_record_without_installed_provider() {
        BUS_PUBLISH_TOTAL.add(
            1,
            &[routing_key_attr("shift.created"), outcome_attr("success")],
        );
        BUS_CONSUME_TOTAL.add(1, &[queue_attr("shift.created.queue"), outcome_attr("poison")]);
        BUS_POISON_TOTAL.add(1, &[queue_attr("shift.created.queue")]);
        BUS_PUBLISH_DURATION.record(0.01, &[routing_key_attr("shift.created")]);
        BUS_HANDLE_DURATION.record(0.02, &[queue_attr("shift.created.queue")]);
        BUS_RECONNECT_TOTAL.add(1, &[]);
    }

    #[test]
    fn test_attribute_labels() {
        assert_eq!(queue_attr("q").key.as_str(), "queue");
        assert_eq!(routing_key_attr("shift.created").key.as_str(), "routing_key");
        assert_eq!(outcome_attr("transient").value.as_str(), "transient");
    }
}
