//! OpenTelemetry SDK wiring: provider bootstrap, metrics scrape endpoint,
//! process-wide accessors and context propagation.

mod global;
mod init;
pub mod propagation;
mod scrape;

pub use global::{current_trace_id, install, meter, reset, tracer};
pub use init::{init_telemetry, ShutdownError, TelemetryError, TelemetryHandle};

pub(crate) use global::trace_id_of;
