use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::body::Body;
use axum::http::Request;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use sea_orm::DatabaseConnection;
use tower_http::trace::TraceLayer;
use tracing::{info, Span};

use crate::config::app_config;
use crate::http::routes::{check_webhook_secret_middleware, click_redirect, handle_event, healthcheck, open_pixel};
use crate::reputation::BouncePolicy;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub bounce_policy: BouncePolicy,
    pub webhook_shared_secret: Option<String>,
}

/// Assembles and serves the tracking/webhook/healthcheck surface (C9,
/// C10 entrypoint). Runs alongside the supervisor's control loop as an
/// independent tokio task.
pub async fn start(db: DatabaseConnection) {
    let cfg = app_config();

    let state = AppState {
        db,
        bounce_policy: BouncePolicy {
            consecutive: cfg.bounce_consecutive,
            duration_days: cfg.bounce_duration_days,
            limit: cfg.bounce_limit,
        },
        webhook_shared_secret: cfg.webhook_shared_secret.clone(),
    };

    let healthcheck_router = Router::new().route("/healthcheck", get(healthcheck));

    let tracking_router = Router::new()
        .route("/open/:tracking_id", get(open_pixel))
        .route("/link/:tracking_id/:signature/:link", get(click_redirect));

    let webhook_router = Router::new()
        .route("/events", post(handle_event))
        .route_layer(middleware::from_fn_with_state(state.clone(), check_webhook_secret_middleware));

    let tracing_layer = TraceLayer::new_for_http().on_request(|request: &Request<Body>, _span: &Span| {
        info!("{} {}", request.method(), request.uri().path())
    });

    let app = Router::new()
        .merge(healthcheck_router)
        .merge(tracking_router)
        .merge(webhook_router)
        .layer(tracing_layer)
        .with_state(state);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), cfg.http_port);
    info!(%addr, "http server listening");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .unwrap_or_else(|_| panic!("[WEB] failed to serve app on address {addr}"));
}
