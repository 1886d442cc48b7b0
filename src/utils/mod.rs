//! Process-level helpers shared by the binaries.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
#[cfg(feature = "otel")]
pub mod trace_context;
