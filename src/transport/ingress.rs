use std::{sync::atomic::{AtomicBool, Ordering}, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::{with_retry, ConnectionError, TransportConnector};
use crate::{
    config::Settings,
    state::Track,
    utils::jwt::{relay_token, RelayGrant},
};

const URL_INPUT: u8 = 2;
const OPUS: u8 = 1;

#[derive(Deserialize)]
struct IngressInfo {
    ingress_id: String,
}

/// The relay fetches and decodes the track URL itself; we only manage the
/// ephemeral ingress resource. Frames pushed here are dropped.
pub struct UrlIngress {
    room:      String,
    api:       String,
    key:       String,
    secret:    String,
    identity:  String,
    name:      String,
    window:    Duration,
    http:      reqwest::Client,
    current:   Mutex<Option<String>>,
    connected: AtomicBool,
}

impl UrlIngress {
    pub fn new(room: &str, s: &Settings, http: reqwest::Client) -> Self {
        Self {
            room:      room.into(),
            api:       s.relay_api_url.trim_end_matches('/').into(),
            key:       s.relay_key.clone(),
            secret:    s.relay_secret.clone(),
            identity:  s.bot_identity.clone(),
            name:      s.bot_name.clone(),
            window:    s.connect_timeout,
            http,
            current:   Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<reqwest::Response, ConnectionError> {
        let grant = RelayGrant { room: self.room.clone(), ingress_admin: true, ..Default::default() };
        let token = relay_token(&self.key, &self.secret, &self.identity, &self.name, grant)?;
        let resp = self.http
            .post(format!("{}/twirp/livekit.Ingress/{method}", self.api))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| ConnectionError::Relay(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => Ok(resp),
            s if s.is_client_error() => Err(ConnectionError::Rejected(format!("{method}: {s}"))),
            s => Err(ConnectionError::Relay(format!("{method}: {s}"))),
        }
    }

    async fn create(&self, track: &Track) -> Result<String, ConnectionError> {
        let title: String = track.title.chars().take(20).collect();
        let body = json!({
            "input_type": URL_INPUT,
            "url": track.source,
            "name": format!("music-{title}"),
            "room_name": self.room,
            "participant_identity": self.identity,
            "participant_name": self.name,
            "audio": {
                "name": "music-audio",
                "options": { "audio_codec": OPUS, "bitrate": 256_000, "channels": 2, "disable_dtx": true },
            },
        });
        let info: IngressInfo = self.call("CreateIngress", &body).await?
            .json()
            .await
            .map_err(|e| ConnectionError::Relay(e.to_string()))?;
        Ok(info.ingress_id)
    }

    async fn delete_current(&self) {
        let Some(id) = self.current.lock().await.take() else { return };
        match self.call("DeleteIngress", &json!({ "ingress_id": id })).await {
            Ok(_) => tracing::info!(room = %self.room, ingress = %id, "ingress deleted"),
            Err(e) => tracing::warn!(room = %self.room, ingress = %id, error = %e, "failed to delete ingress"),
        }
    }
}

#[async_trait]
impl TransportConnector for UrlIngress {
    /// Nothing long-lived to open: ingress resources are created per play.
    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool { self.connected.load(Ordering::SeqCst) }

    async fn play(&self, track: &Track, position_ms: u64) -> Result<(), ConnectionError> {
        self.connect().await?;
        self.delete_current().await;
        if position_ms > 0 {
            // URL ingress 無法從中間開始；由 relay 從頭拉流
            tracing::debug!(room = %self.room, position_ms, "url ingress restarts from the top");
        }
        let id = with_retry(&self.room, self.window, || self.create(track)).await?;
        tracing::info!(room = %self.room, ingress = %id, title = %track.title, "ingress started");
        *self.current.lock().await = Some(id);
        Ok(())
    }

    async fn submit(&self, _frame: &[i16]) -> Result<(), ConnectionError> { Ok(()) }

    async fn pause(&self) { self.delete_current().await; }

    async fn stop(&self) { self.delete_current().await; }

    async fn seek(&self, _position_ms: u64) { self.delete_current().await; }

    async fn disconnect(&self) {
        self.delete_current().await;
        self.connected.store(false, Ordering::SeqCst);
    }
}
