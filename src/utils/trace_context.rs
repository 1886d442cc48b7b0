//! W3C trace context carried in message headers.
//!
//! The publisher injects the context of the `bus.publish` span into the
//! envelope headers; subscribers extract it and parent their `bus.consume`
//! span on it, so one trace spans producer and consumer services.
//! Feature-gated behind `otel`.

use std::collections::HashMap;

use opentelemetry::Context;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Headers for the context of the current span. Empty when no propagator
/// is installed or the span is not recorded.
pub fn inject_trace_context() -> HashMap<String, String> {
    inject_context(&tracing::Span::current().context())
}

/// Parent `span` on the context found in `headers`, if any.
pub fn extract_trace_context(headers: &HashMap<String, String>, span: &tracing::Span) {
    if headers.is_empty() {
        return;
    }
    span.set_parent(extract_context(headers));
}

fn inject_context(cx: &Context) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut headers);
    });
    headers
}

fn extract_context(headers: &HashMap<String, String>) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| propagator.extract(headers))
}
