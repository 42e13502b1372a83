use std::{
    borrow::Cow,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
    time::Duration,
};

use async_trait::async_trait;
use livekit::{
    options::TrackPublishOptions,
    track::{LocalAudioTrack, LocalTrack, TrackSource as PublishSource},
    webrtc::{
        audio_frame::AudioFrame,
        audio_source::{native::NativeAudioSource, AudioSourceOptions, RtcAudioSource},
    },
    Room, RoomEvent, RoomOptions,
};
use tokio::{sync::{mpsc, Mutex}, task::JoinHandle};

use super::{with_retry, ConnectionError, TransportConnector};
use crate::{
    audio::{CHANNELS, SAMPLE_RATE},
    config::Settings,
    state::Track,
    utils::jwt::{relay_token, RelayGrant},
};

/// Relay-side buffer in front of the published track.
const SOURCE_QUEUE_MS: u32 = 200;
const TRACK_NAME: &str = "music";

/* 一次 publish：房間連線 + 音源 + 已發布的 track */
struct Publication {
    room:   Room,
    source: NativeAudioSource,
    _track: LocalAudioTrack,
    watch:  JoinHandle<()>,
}

impl Publication {
    async fn close(self, room_id: &str) {
        self.watch.abort();
        if let Err(e) = self.room.close().await {
            tracing::warn!(room = %room_id, error = %e, "relay close failed");
        }
    }
}

/// Joins the relay room as the bot participant and pushes PCM frames into a
/// published microphone-class audio track.
pub struct DirectStream {
    room:      String,
    url:       String,
    key:       String,
    secret:    String,
    identity:  String,
    name:      String,
    window:    Duration,
    live:      Mutex<Option<Publication>>,
    connected: Arc<AtomicBool>,
}

impl DirectStream {
    pub fn new(room: &str, s: &Settings) -> Self {
        Self {
            room:      room.into(),
            url:       s.relay_url.trim_end_matches('/').into(),
            key:       s.relay_key.clone(),
            secret:    s.relay_secret.clone(),
            identity:  s.bot_identity.clone(),
            name:      s.bot_name.clone(),
            window:    s.connect_timeout,
            live:      Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    fn access_token(&self) -> Result<String, ConnectionError> {
        let grant = RelayGrant { room: self.room.clone(), room_join: true, can_publish: true, ..Default::default() };
        Ok(relay_token(&self.key, &self.secret, &self.identity, &self.name, grant)?)
    }

    async fn open(&self) -> Result<Publication, ConnectionError> {
        let token = self.access_token()?;
        let mut options = RoomOptions::default();
        options.auto_subscribe = false;
        let (room, events) = Room::connect(&self.url, &token, options).await
            .map_err(|e| ConnectionError::Relay(e.to_string()))?;

        let source = NativeAudioSource::new(AudioSourceOptions::default(), SAMPLE_RATE, CHANNELS as u32, SOURCE_QUEUE_MS);
        let track = LocalAudioTrack::create_audio_track(TRACK_NAME, RtcAudioSource::Native(source.clone()));
        let publish = TrackPublishOptions { source: PublishSource::Microphone, ..Default::default() };
        if let Err(e) = room.local_participant().publish_track(LocalTrack::Audio(track.clone()), publish).await {
            room.close().await.ok();
            return Err(ConnectionError::Relay(format!("publish failed: {e}")));
        }

        let watch = tokio::spawn(watch_room(self.room.clone(), events, self.connected.clone()));
        Ok(Publication { room, source, _track: track, watch })
    }

    async fn source(&self) -> Option<NativeAudioSource> {
        self.live.lock().await.as_ref().map(|p| p.source.clone())
    }
}

/* relay 主動斷線時只標記；下一次 submit 會重連 */
async fn watch_room(room_id: String, mut events: mpsc::UnboundedReceiver<RoomEvent>, connected: Arc<AtomicBool>) {
    while let Some(ev) = events.recv().await {
        if let RoomEvent::Disconnected { .. } = ev {
            tracing::warn!(room = %room_id, "relay dropped the bot participant");
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
}

fn pcm_frame(frame: &[i16]) -> AudioFrame<'_> {
    AudioFrame {
        data:                Cow::Borrowed(frame),
        sample_rate:         SAMPLE_RATE,
        num_channels:        CHANNELS as u32,
        samples_per_channel: (frame.len() / CHANNELS) as u32,
    }
}

#[async_trait]
impl TransportConnector for DirectStream {
    async fn connect(&self) -> Result<(), ConnectionError> {
        let mut guard = self.live.lock().await;
        if guard.is_some() && self.is_connected() { return Ok(()); }
        if let Some(stale) = guard.take() { stale.close(&self.room).await; }

        let publication = with_retry(&self.room, self.window, || self.open()).await?;
        *guard = Some(publication);
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(room = %self.room, identity = %self.identity, "publishing to relay");
        Ok(())
    }

    fn is_connected(&self) -> bool { self.connected.load(Ordering::SeqCst) }

    async fn play(&self, track: &Track, position_ms: u64) -> Result<(), ConnectionError> {
        self.connect().await?;
        tracing::debug!(room = %self.room, track = %track.id, position_ms, "frames follow");
        Ok(())
    }

    async fn submit(&self, frame: &[i16]) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            tracing::warn!(room = %self.room, "relay connection lost, reconnecting");
            self.connect().await?;
        }
        let source = self.source().await.ok_or(ConnectionError::Closed)?;
        source.capture_frame(&pcm_frame(frame)).await
            .map_err(|e| ConnectionError::Relay(e.to_string()))
    }

    async fn pause(&self) {
        if let Some(source) = self.source().await { source.clear_buffer(); }
    }

    async fn stop(&self) {
        if let Some(source) = self.source().await { source.clear_buffer(); }
    }

    async fn seek(&self, _position_ms: u64) {
        if let Some(source) = self.source().await { source.clear_buffer(); }
    }

    async fn disconnect(&self) {
        let taken = self.live.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(publication) = taken {
            publication.close(&self.room).await;
            tracing::info!(room = %self.room, "unpublished from relay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
    use serde_json::Value;
    use crate::{audio::FRAME_SAMPLES, config::TransportMode};

    fn settings() -> Settings {
        Settings {
            bind_addr: "127.0.0.1:0".into(), jwt_secret: "s".into(),
            relay_url: "ws://127.0.0.1:9/".into(), relay_api_url: "http://127.0.0.1:9".into(),
            relay_key: "k".into(), relay_secret: "s".into(), transport: TransportMode::Direct,
            bot_identity: "MusicBot".into(), bot_name: "Music Bot".into(), decode_workers: 1,
            connect_timeout: Duration::from_millis(300), pause_timeout: Duration::from_secs(30),
            default_volume: 0.5, fetch_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn frame_carries_format() {
        let samples = vec![0i16; FRAME_SAMPLES * CHANNELS];
        let f = pcm_frame(&samples);
        assert_eq!(f.samples_per_channel, FRAME_SAMPLES as u32);
        assert_eq!(f.num_channels, 2);
        assert_eq!(f.sample_rate, 48_000);
    }

    #[test]
    fn token_grants_publish_only() {
        let d = DirectStream::new("my room", &settings());
        let token = d.access_token().unwrap();
        let claims = decode::<Value>(&token, &DecodingKey::from_secret(b"s"), &Validation::new(Algorithm::HS256))
            .unwrap().claims;
        assert_eq!(claims["sub"], "MusicBot");
        assert_eq!(claims["iss"], "k");
        assert_eq!(claims["video"]["room"], "my room");
        assert_eq!(claims["video"]["roomJoin"], true);
        assert_eq!(claims["video"]["canPublish"], true);
        assert_eq!(claims["video"]["canSubscribe"], false);
    }

    #[tokio::test]
    async fn unreachable_relay_times_out_and_disconnect_is_idempotent() {
        let d = DirectStream::new("r", &settings());
        let err = d.connect().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout { .. }));
        assert!(!d.is_connected());
        d.pause().await;
        d.disconnect().await;
        d.disconnect().await;
    }
}
