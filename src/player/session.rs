use std::{
    sync::{atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering}, Arc},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    audio::{locator_hint, ms_to_samples, samples_to_ms, AudioDecoder, DecodeError, Pcm, TrackSource,
            CHANNELS, FRAME_MS, FRAME_SAMPLES},
    error::{AppErr, AppResult},
    state::{PlayState, Track},
    transport::TransportConnector,
};

/// ~1 s of frames between progress reports.
const REPORT_EVERY: u32 = (1000 / FRAME_MS) as u32;

#[derive(Clone, Debug, PartialEq)]
pub struct SessionProgress {
    pub position_ms: u64,
    pub duration_ms: u64,
    pub state:       PlayState,
    pub track:       Option<Track>,
}

/// What a session reports upward. `generation` identifies the load it belongs to.
#[derive(Debug)]
pub enum SessionEvent {
    /// ~1 s tick while playing; the receiver reads the live position itself.
    Progress      { room: String, generation: u64 },
    Finished      { room: String, generation: u64 },
    TransportLost { room: String, generation: u64, error: String },
}

/* ------------ pump 與 session 共用的播放頭 ------------ */
struct Playhead {
    position: AtomicUsize,
    state:    AtomicU8,
    volume:   AtomicU32,
}

impl Playhead {
    fn new(volume: f32) -> Self {
        Self {
            position: AtomicUsize::new(0),
            state:    AtomicU8::new(PlayState::Idle.as_u8()),
            volume:   AtomicU32::new(volume.to_bits()),
        }
    }
    fn position(&self) -> usize { self.position.load(Ordering::Acquire) }
    fn set_position(&self, p: usize) { self.position.store(p, Ordering::Release) }
    fn state(&self) -> PlayState { PlayState::from_u8(self.state.load(Ordering::Acquire)) }
    fn set_state(&self, s: PlayState) { self.state.store(s.as_u8(), Ordering::Release) }
    fn volume(&self) -> f32 { f32::from_bits(self.volume.load(Ordering::Relaxed)) }
    fn reset(&self, s: PlayState) {
        self.set_position(0);
        self.set_state(s);
    }
}

pub struct PlaybackSession {
    room:         String,
    transport:    Arc<dyn TransportConnector>,
    decoder:      AudioDecoder,
    source:       Arc<dyn TrackSource>,
    events:       mpsc::UnboundedSender<SessionEvent>,
    load_timeout: Duration,
    head:         Arc<Playhead>,
    pcm:          Option<Pcm>,
    track:        Option<Track>,
    generation:   u64,
    pump:         Option<(CancellationToken, JoinHandle<()>)>,
}

impl PlaybackSession {
    pub fn new(
        room: &str,
        transport: Arc<dyn TransportConnector>,
        decoder: AudioDecoder,
        source: Arc<dyn TrackSource>,
        events: mpsc::UnboundedSender<SessionEvent>,
        load_timeout: Duration,
        volume: f32,
    ) -> Self {
        Self {
            room: room.into(),
            transport, decoder, source, events, load_timeout,
            head: Arc::new(Playhead::new(volume)),
            pcm: None,
            track: None,
            generation: 0,
            pump: None,
        }
    }

    pub fn state(&self) -> PlayState { self.head.state() }
    #[cfg(test)]
    pub fn current_track(&self) -> Option<&Track> { self.track.as_ref() }
    #[cfg(test)]
    pub fn position_samples(&self) -> usize { self.head.position() }
    #[cfg(test)]
    pub fn total_samples(&self) -> usize { self.pcm.as_ref().map_or(0, Pcm::total_samples) }

    pub fn progress(&self) -> SessionProgress {
        SessionProgress {
            position_ms: samples_to_ms(self.head.position()),
            duration_ms: self.pcm.as_ref().map_or(0, Pcm::duration_ms),
            state:       self.head.state(),
            track:       self.track.clone(),
        }
    }

    /// Fetches and decodes `track`; on success the session is `Stopped` at 0.
    pub async fn load(&mut self, track: Track, generation: u64) -> AppResult<()> {
        self.halt().await;
        self.generation = generation;
        self.pcm = None;
        self.track = Some(track.clone());
        self.head.reset(PlayState::Loading);
        tracing::info!(room = %self.room, track = %track.id, generation, "loading");

        let loaded = match tokio::time::timeout(self.load_timeout, self.fetch_and_decode(&track)).await {
            Ok(res) => res,
            Err(_) => Err(DecodeError::Timeout(self.load_timeout.as_secs()).into()),
        };

        match loaded {
            Ok(pcm) => {
                tracing::info!(room = %self.room, track = %track.id, duration_ms = pcm.duration_ms(), "loaded");
                self.pcm = Some(pcm);
                self.head.reset(PlayState::Stopped);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(room = %self.room, track = %track.id, error = %e, "load failed");
                self.track = None;
                self.head.reset(PlayState::Idle);
                Err(e)
            }
        }
    }

    async fn fetch_and_decode(&self, track: &Track) -> AppResult<Pcm> {
        let bytes = self.source.fetch(&track.source).await?;
        Ok(self.decoder.decode(bytes, locator_hint(&track.source)).await?)
    }

    /// `Stopped | Paused -> Playing`. Connects the transport if needed.
    pub async fn play(&mut self) -> AppResult<()> {
        match self.state() {
            PlayState::Playing => return Ok(()),
            PlayState::Idle | PlayState::Loading => return Err(AppErr::Bad("no track loaded".into())),
            PlayState::Stopped | PlayState::Paused => {}
        }
        let (Some(pcm), Some(track)) = (self.pcm.clone(), self.track.clone()) else {
            return Err(AppErr::Bad("no track loaded".into()));
        };
        self.halt().await;

        if !self.transport.is_connected() {
            self.transport.connect().await?;
        }
        self.transport.play(&track, samples_to_ms(self.head.position())).await?;
        self.head.set_state(PlayState::Playing);
        self.spawn_pump(pcm);
        tracing::info!(room = %self.room, position = self.head.position(), "playing");
        Ok(())
    }

    pub async fn pause(&mut self) {
        if self.state() != PlayState::Playing { return; }
        self.halt().await;
        // pump 可能剛好播完，已自行轉成 Stopped
        if self.state() == PlayState::Playing {
            self.head.set_state(PlayState::Paused);
            self.transport.pause().await;
            tracing::info!(room = %self.room, position = self.head.position(), "paused");
        }
    }

    pub async fn resume(&mut self) -> AppResult<()> {
        if self.state() == PlayState::Paused {
            self.play().await?;
        }
        Ok(())
    }

    /// `Playing | Paused -> Stopped` at 0; the loaded track is kept.
    pub async fn stop(&mut self) {
        self.halt().await;
        let next = if self.pcm.is_some() { PlayState::Stopped } else { PlayState::Idle };
        self.head.reset(next);
        self.transport.stop().await;
    }

    /// Clamps to `[0, total]`; the state is unchanged.
    pub async fn seek(&mut self, position_ms: u64) -> AppResult<()> {
        let Some(pcm) = self.pcm.clone() else { return Ok(()) };
        let was_playing = self.state() == PlayState::Playing;
        self.halt().await;

        let target = ms_to_samples(position_ms).min(pcm.total_samples());
        self.head.set_position(target);
        self.transport.seek(samples_to_ms(target)).await;
        tracing::info!(room = %self.room, position_ms, sample = target, "seeked");

        if was_playing && self.state() == PlayState::Playing {
            if let Some(track) = self.track.clone() {
                self.transport.play(&track, samples_to_ms(target)).await?;
            }
            self.spawn_pump(pcm);
        }
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) {
        self.head.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 { self.head.volume() }

    /// Lets go of the relay but keeps the loaded track and position.
    pub async fn release_transport(&mut self) {
        self.transport.disconnect().await;
    }

    pub async fn disconnect(&mut self) {
        self.halt().await;
        self.transport.disconnect().await;
        self.pcm = None;
        self.track = None;
        self.head.reset(PlayState::Idle);
        tracing::info!(room = %self.room, "session disconnected");
    }

    /* 取消並等待 pump 結束；之後才可以動共用欄位 */
    async fn halt(&mut self) {
        let Some((cancel, handle)) = self.pump.take() else { return };
        cancel.cancel();
        if let Err(e) = handle.await {
            if e.is_panic() {
                tracing::error!(room = %self.room, "frame pump panicked");
                self.head.set_state(PlayState::Stopped);
            }
        }
    }

    fn spawn_pump(&mut self, pcm: Pcm) {
        let cancel = CancellationToken::new();
        let pump = FramePump {
            room:       self.room.clone(),
            generation: self.generation,
            pcm,
            head:       self.head.clone(),
            transport:  self.transport.clone(),
            events:     self.events.clone(),
        };
        let handle = tokio::spawn(pump.run(cancel.clone()));
        self.pump = Some((cancel, handle));
    }
}

/* ---------------- frame pump ---------------- */
struct FramePump {
    room:       String,
    generation: u64,
    pcm:        Pcm,
    head:       Arc<Playhead>,
    transport:  Arc<dyn TransportConnector>,
    events:     mpsc::UnboundedSender<SessionEvent>,
}

impl FramePump {
    async fn run(self, cancel: CancellationToken) {
        let total = self.pcm.total_samples();
        let mut frame = vec![0i16; FRAME_SAMPLES * CHANNELS];
        let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MS));
        let mut since_report = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tick.tick() => {}
            }

            let pos = self.head.position();
            if pos >= total {
                self.head.reset(PlayState::Stopped);
                tracing::info!(room = %self.room, generation = self.generation, "track finished");
                self.events.send(SessionEvent::Finished { room: self.room.clone(), generation: self.generation }).ok();
                return;
            }

            let copied = self.pcm.fill_frame(pos, self.head.volume(), &mut frame);
            if copied < FRAME_SAMPLES {
                tracing::debug!(room = %self.room, copied, "short tail padded with silence");
            }

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                r = self.transport.submit(&frame) => r,
            };
            if let Err(e) = sent {
                tracing::error!(room = %self.room, error = %e, "transport lost mid-track");
                self.head.set_state(PlayState::Stopped);
                self.events.send(SessionEvent::TransportLost {
                    room: self.room.clone(), generation: self.generation, error: e.to_string(),
                }).ok();
                return;
            }

            self.head.set_position((pos + FRAME_SAMPLES).min(total));

            since_report += 1;
            if since_report >= REPORT_EVERY {
                since_report = 0;
                self.events.send(SessionEvent::Progress { room: self.room.clone(), generation: self.generation }).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::testing::{wav, MemorySource},
        transport::testing::Recorder,
    };

    struct Rig {
        session:   PlaybackSession,
        transport: Arc<Recorder>,
        events:    mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn track(id: &str, ms: u64) -> Track {
        Track { id: id.into(), title: id.into(), artist: String::new(), duration_ms: ms, source: format!("mem://{id}.wav") }
    }

    fn rig(volume: f32) -> Rig {
        let source = MemorySource::default()
            .with("mem://a.wav", wav(48_000, 2, 2000))
            .with("mem://junk.wav", b"not a wav".to_vec());
        let transport = Arc::new(Recorder::default());
        let (tx, events) = mpsc::unbounded_channel();
        let session = PlaybackSession::new(
            "lobby", transport.clone(), AudioDecoder::new(1), Arc::new(source), tx, Duration::from_secs(30), volume,
        );
        Rig { session, transport, events }
    }

    fn assert_in_bounds(s: &PlaybackSession) {
        assert!(s.position_samples() <= s.total_samples(), "{} > {}", s.position_samples(), s.total_samples());
    }

    #[tokio::test(start_paused = true)]
    async fn load_moves_to_stopped_at_zero() {
        let mut r = rig(1.0);
        assert_eq!(r.session.state(), PlayState::Idle);
        r.session.load(track("a", 2000), 1).await.unwrap();
        assert_eq!(r.session.state(), PlayState::Stopped);
        assert_eq!(r.session.total_samples(), 96_000);
        assert_eq!(r.session.progress().duration_ms, 2000);
        assert_eq!(r.session.position_samples(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_returns_to_idle() {
        let mut r = rig(1.0);
        let err = r.session.load(track("junk", 0), 1).await.unwrap_err();
        assert!(matches!(err, AppErr::Decode(_)));
        assert_eq!(r.session.state(), PlayState::Idle);
        assert!(r.session.current_track().is_none());

        let err = r.session.load(track("missing", 0), 2).await.unwrap_err();
        assert!(matches!(err, AppErr::Fetch(_)));
        assert!(r.session.play().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seek_then_progress_is_exact() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 1).await.unwrap();
        r.session.seek(1500).await.unwrap();
        let p = r.session.progress();
        assert!(p.position_ms.abs_diff(1500) <= FRAME_MS);
        assert_eq!(p.state, PlayState::Stopped);

        r.session.seek(99_000).await.unwrap();
        assert_eq!(r.session.position_samples(), r.session.total_samples());
        assert_in_bounds(&r.session);
        assert!(r.transport.flushes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_while_playing_keeps_playing() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 1).await.unwrap();
        r.session.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        r.session.seek(1500).await.unwrap();
        assert_eq!(r.session.state(), PlayState::Playing);
        assert!(r.session.progress().position_ms.abs_diff(1500) <= FRAME_MS);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pos = r.session.progress().position_ms;
        assert!((1580..=1640).contains(&pos), "pos {pos}");
        assert_in_bounds(&r.session);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_then_resume_continues_where_it_left() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 1).await.unwrap();
        r.session.play().await.unwrap();
        assert!(r.transport.is_connected());

        tokio::time::sleep(Duration::from_millis(500)).await;
        r.session.pause().await;
        let paused_at = r.session.position_samples();
        let frames = r.transport.frames.load(Ordering::SeqCst);
        assert_eq!(r.session.state(), PlayState::Paused);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(r.session.position_samples(), paused_at);
        assert_eq!(r.transport.frames.load(Ordering::SeqCst), frames, "no frames while paused");

        r.session.resume().await.unwrap();
        assert_eq!(r.session.state(), PlayState::Playing);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(r.session.position_samples() - paused_at <= FRAME_SAMPLES);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_buffer_stops_and_reports_finished() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 7).await.unwrap();
        r.session.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(r.session.state(), PlayState::Stopped);
        assert_eq!(r.session.position_samples(), 0);
        assert_eq!(r.transport.frames.load(Ordering::SeqCst), 100);

        let mut progress_ticks = 0;
        let mut finished = None;
        while let Ok(ev) = r.events.try_recv() {
            match ev {
                SessionEvent::Progress { generation, .. } => {
                    progress_ticks += 1;
                    assert_eq!(generation, 7);
                }
                SessionEvent::Finished { generation, .. } => finished = Some(generation),
                SessionEvent::TransportLost { .. } => panic!("unexpected transport loss"),
            }
        }
        assert_eq!(progress_ticks, 2);
        assert_eq!(finished, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_disconnect() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 1).await.unwrap();
        r.session.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        r.session.stop().await;
        assert_eq!(r.session.state(), PlayState::Stopped);
        assert_eq!(r.session.position_samples(), 0);

        r.session.disconnect().await;
        r.session.disconnect().await;
        assert_eq!(r.session.state(), PlayState::Idle);
        assert_eq!(r.transport.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_surfaces_and_leaves_state() {
        let mut r = rig(1.0);
        r.session.load(track("a", 2000), 1).await.unwrap();
        r.transport.fail_connect.store(true, Ordering::SeqCst);
        let err = r.session.play().await.unwrap_err();
        assert!(matches!(err, AppErr::Connection(_)));
        assert_eq!(r.session.state(), PlayState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn volume_is_clamped() {
        let r = rig(0.5);
        assert_eq!(r.session.volume(), 0.5);
        r.session.set_volume(3.0);
        assert_eq!(r.session.volume(), 1.0);
    }
}
