use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, EnvFilter, Registry};

/// Initializes process-wide tracing: an `EnvFilter`-driven subscriber
/// writing to stdout. No exporter is wired in — the teacher's services
/// export to Jaeger via `opentelemetry`, but this spec has no telemetry
/// backend to ship to, so the facade stops at `tracing-subscriber` (see
/// DESIGN.md for the dropped `opentelemetry*` dependencies).
pub fn init(service_name: &str) {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env())
        .with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    tracing::info!(service_name, "tracer initialized");
}
