//! Media relay adapters. The session only sees [`TransportConnector`]; which
//! strategy sits behind it is decided once, in [`factory_from_settings`].

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use crate::{config::{Settings, TransportMode}, state::Track};

mod direct;
mod ingress;

pub use direct::DirectStream;
pub use ingress::UrlIngress;

#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("relay for room `{room}` unreachable after {secs}s")]
    Timeout { room: String, secs: u64 },
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("relay connection closed")]
    Closed,
    #[error("relay: {0}")]
    Relay(String),
    #[error("token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Idempotent: an existing live connection is reused.
    async fn connect(&self) -> Result<(), ConnectionError>;

    fn is_connected(&self) -> bool;

    /// Audio for `track` should be heard from `position_ms` on.
    async fn play(&self, track: &Track, position_ms: u64) -> Result<(), ConnectionError>;

    /// One 20 ms interleaved frame. Strategies that pull audio themselves ignore it.
    async fn submit(&self, frame: &[i16]) -> Result<(), ConnectionError>;

    /// Drops anything buffered relay-side.
    async fn pause(&self);

    async fn stop(&self);

    async fn seek(&self, position_ms: u64);

    /// Safe to call repeatedly.
    async fn disconnect(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self, room_id: &str) -> Arc<dyn TransportConnector>;
}

/* ------------ 依設定挑一次策略 ------------ */
pub struct RelayFactory {
    settings: Settings,
    http:     reqwest::Client,
}

impl TransportFactory for RelayFactory {
    fn create(&self, room_id: &str) -> Arc<dyn TransportConnector> {
        match self.settings.transport {
            TransportMode::Direct  => Arc::new(DirectStream::new(room_id, &self.settings)),
            TransportMode::Ingress => Arc::new(UrlIngress::new(room_id, &self.settings, self.http.clone())),
        }
    }
}

pub fn factory_from_settings(settings: &Settings) -> Arc<dyn TransportFactory> {
    tracing::info!(mode = ?settings.transport, relay = %settings.relay_url, "transport strategy selected");
    Arc::new(RelayFactory { settings: settings.clone(), http: reqwest::Client::new() })
}

/// Retries `attempt` with jittered linear backoff until it succeeds or `window` elapses.
pub(crate) async fn with_retry<T, F, Fut>(room: &str, window: Duration, mut attempt: F) -> Result<T, ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    let start = Instant::now();
    let mut tries: u32 = 0;
    loop {
        tries += 1;
        let remaining = window.saturating_sub(start.elapsed());
        let outcome = tokio::time::timeout(remaining, attempt()).await;
        match outcome {
            Ok(Ok(v)) => return Ok(v),
            Ok(Err(err @ ConnectionError::Rejected(_))) | Ok(Err(err @ ConnectionError::Token(_))) => return Err(err),
            Ok(Err(err)) => tracing::warn!(room, tries, error = %err, "relay connect failed"),
            Err(_) => {}
        }
        if start.elapsed() >= window {
            return Err(ConnectionError::Timeout { room: room.into(), secs: window.as_secs() });
        }
        let backoff = Duration::from_millis(tries.min(20) as u64 * 100 + rand::thread_rng().gen_range(0..100));
        tokio::time::sleep(backoff.min(window.saturating_sub(start.elapsed()))).await;
    }
}

/* ---------------- 測試用：記錄型傳輸 ---------------- */
