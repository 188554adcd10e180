//! Tracing-subscriber initialization
//!
//! The OpenTelemetry/OTLP exporter pipeline the teacher wires up here assumes a collector is
//! reachable from the process; this server has no such deployment target, so it keeps the plain
//! `fmt` layer plus `EnvFilter` and drops the OTLP half (see DESIGN.md for the dependency note).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_tracing_subscriber() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
