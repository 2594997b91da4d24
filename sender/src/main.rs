use std::sync::Arc;
use std::time::Duration;

use connection::{HttpApiTransportFactory, SmtpTransportFactory, TransportFactory};
use segment::SegmentRegistry;
use shutdown::ShutdownSignal;
use supervisor::Supervisor;

mod config;
mod connection;
mod db;
mod dispatcher;
mod events;
mod http;
mod queue;
mod rate_limiter;
mod rate_meter;
mod render;
mod reputation;
mod segment;
mod shutdown;
mod signals;
mod signing;
mod supervisor;
#[cfg(test)]
mod test_support;
mod worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::app_config();

    shared::tracer::init(&cfg.tracer_service_name);

    let db = db::create_db_conn(&cfg.db_url).await;
    db::run_migrations(&db).await;

    let transport_factory = build_transport_factory(cfg).await?;
    let segments = Arc::new(SegmentRegistry::new());

    let mut supervisor = Supervisor::new(
        db.clone(),
        transport_factory,
        cfg.max_messages_per_connection,
        segments,
        cfg.max_concurrent_senders,
        cfg.max_sending_rate,
        cfg.public_url.clone(),
        Duration::from_secs(cfg.polling_interval),
    );

    let stats = supervisor.stats_handle();
    let shutdown = ShutdownSignal::new();

    signals::install(shutdown.clone(), stats);

    let http_db = db.clone();
    tokio::spawn(async move { http::server::start(http_db).await });

    supervisor.run(shutdown).await;

    Ok(())
}

/// Builds the configured transport factory (C4). Each sender worker
/// gets its own [`connection::ConnectionManager`] backed by this shared,
/// stateless factory — failure to even construct it here is a startup
/// error (bad credentials, unreachable relay) worth a clean `anyhow`
/// bail rather than a bare panic.
async fn build_transport_factory(cfg: &config::AppConfig) -> anyhow::Result<Arc<dyn TransportFactory>> {
    match cfg.email_backend.as_str() {
        "api" => {
            let factory = HttpApiTransportFactory::new(cfg)
                .await
                .map_err(|err| anyhow::anyhow!("failed to build HTTP API transport factory: {err}"))?;
            Ok(Arc::new(factory))
        }
        _ => {
            let factory = SmtpTransportFactory::new(cfg).map_err(|err| anyhow::anyhow!("failed to build SMTP transport factory: {err}"))?;
            Ok(Arc::new(factory))
        }
    }
}
