mod audio;
mod config;
mod error;
mod hub;
mod player;
mod state;
mod transport;
mod utils {
    pub mod jwt;
    pub mod clean;
}
mod routes;

use std::sync::Arc;

use axum::{Router, Extension, extract::DefaultBodyLimit};
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::EnvFilter;

use crate::{
    audio::{AudioDecoder, HttpSource},
    config::Settings,
    hub::BroadcastHub,
    player::{QueueController, SessionRegistry},
    utils::clean,
};

/* 控制端只收 JSON，1 MB 足夠 */
const BODY_LIMIT: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Settings::from_env()?;
    tracing::info!(transport = ?cfg.transport, relay = %cfg.relay_url, "starting room audio engine");

    let source = Arc::new(HttpSource::new(cfg.fetch_timeout)?);
    let (registry, events) = SessionRegistry::new(
        transport::factory_from_settings(&cfg),
        AudioDecoder::new(cfg.decode_workers),
        source,
        cfg.connect_timeout,
        cfg.default_volume,
    );
    let registry = Arc::new(registry);
    let hub = Arc::new(BroadcastHub::new());
    let ctl = QueueController::new(registry.clone(), hub.clone(), cfg.pause_timeout);

    ctl.spawn_event_loop(events);
    tokio::spawn(clean::task(registry, hub.clone()));  // 啟動清道夫

    let app = Router::new()
        .merge(routes::router())
        .layer(Extension(cfg.clone()))
        .layer(Extension(hub))
        .layer(Extension(ctl))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT));

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %cfg.bind_addr, "listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
