use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{
    registry::{RoomSlot, SessionRegistry},
    session::{PlaybackSession, SessionEvent},
};
use crate::{
    error::{AppErr, AppResult},
    hub::BroadcastHub,
    state::{PlayState, Progress, QueueView, Track},
};

/// Queue bookkeeping plus every control operation, serialized per room.
pub struct QueueController {
    registry:      Arc<SessionRegistry>,
    hub:           Arc<BroadcastHub>,
    pause_timeout: Duration,
}

impl QueueController {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<BroadcastHub>, pause_timeout: Duration) -> Arc<Self> {
        Arc::new(Self { registry, hub, pause_timeout })
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry { &self.registry }

    /* ---------------- 佇列 ---------------- */
    pub async fn enqueue(&self, room: &str, track: Track, requested_by: &str) -> usize {
        let mut slot = self.registry.lock(room).await;
        let len = slot.queue.push(track, requested_by);
        tracing::info!(room, len, requested_by, "track queued");
        self.broadcast_state(&slot).await;
        len
    }

    pub async fn dequeue(&self, room: &str, index: usize) -> AppResult<()> {
        let mut slot = self.registry.lock(room).await;
        slot.queue.remove(index).ok_or_else(|| AppErr::Bad("Invalid index".into()))?;
        self.broadcast_state(&slot).await;
        Ok(())
    }

    pub async fn clear(&self, room: &str) {
        let mut slot = self.registry.lock(room).await;
        slot.queue.clear();
        self.registry.remove(&mut slot).await;
        self.broadcast_state(&slot).await;
    }

    pub async fn queue(&self, room: &str) -> QueueView {
        let Some(slot) = self.registry.lock_existing(room).await else {
            return QueueView { is_playing: false, current_song: None, current_index: 0, queue: Vec::new() };
        };
        QueueView {
            is_playing:    slot.session.as_ref().is_some_and(|s| s.state() == PlayState::Playing),
            current_song:  slot.queue.current().map(|e| e.track.clone()),
            current_index: slot.queue.current_index(),
            queue:         slot.queue.entries().to_vec(),
        }
    }

    pub async fn progress(&self, room: &str) -> Progress {
        match self.registry.lock_existing(room).await {
            Some(slot) => snapshot(&slot),
            None => Progress::idle(0, 0, None),
        }
    }

    /* ---------------- 播放控制 ---------------- */

    /// Loads the current entry and plays it; undecodable entries are skipped forward.
    pub async fn start(&self, room: &str) -> AppResult<Progress> {
        let mut slot = self.registry.lock(room).await;
        if slot.queue.is_empty() {
            return Err(AppErr::Bad("No song in queue".into()));
        }
        match self.load_and_play(&mut slot).await {
            Ok(()) => {}
            Err(e @ (AppErr::Decode(_) | AppErr::Fetch(_))) => {
                tracing::warn!(room, error = %e, "skipping unplayable track");
                if !self.advance_locked(&mut slot).await? {
                    return Err(e);
                }
            }
            Err(e) => return Err(self.fail(&mut slot, e).await),
        }
        Ok(snapshot(&slot))
    }

    /// Skip. `Ok(false)` when the queue is exhausted (the session is torn down).
    pub async fn advance(&self, room: &str) -> AppResult<bool> {
        let mut slot = self.registry.lock(room).await;
        self.advance_locked(&mut slot).await
    }

    pub async fn previous(&self, room: &str) -> AppResult<bool> {
        let mut slot = self.registry.lock(room).await;
        if !slot.queue.back() { return Ok(false); }
        if let Err(e) = self.load_and_play(&mut slot).await {
            return Err(self.fail(&mut slot, e).await);
        }
        Ok(true)
    }

    /// Only a playing session moves; anything else is answered with the current snapshot.
    pub async fn pause(&self, room: &str) -> AppResult<Progress> {
        let mut slot = self.registry.lock(room).await;
        let session = slot.session.as_mut().ok_or_else(no_player)?;
        if session.state() != PlayState::Playing {
            return Ok(snapshot(&slot));
        }
        session.pause().await;
        // pump 可能剛好播完
        if session.state() != PlayState::Paused {
            return Ok(snapshot(&slot));
        }
        let position_ms = session.progress().position_ms;
        self.arm_pause_timer(&mut slot);
        self.hub.broadcast(room, "pause", json!({ "position_ms": position_ms })).await;
        self.broadcast_state(&slot).await;
        Ok(snapshot(&slot))
    }

    pub async fn resume(&self, room: &str) -> AppResult<Progress> {
        let mut slot = self.registry.lock(room).await;
        let session = slot.session.as_mut().ok_or_else(no_player)?;
        if session.state() != PlayState::Paused {
            return Ok(snapshot(&slot));
        }
        slot.disarm_pause_timer();
        let session = slot.session.as_mut().ok_or_else(no_player)?;
        if let Err(e) = session.resume().await {
            return Err(self.fail(&mut slot, e).await);
        }
        let position_ms = session.progress().position_ms;
        self.hub.broadcast(room, "resume", json!({ "position_ms": position_ms })).await;
        self.broadcast_state(&slot).await;
        Ok(snapshot(&slot))
    }

    /// Rewinds to 0 and keeps the track loaded; the relay is released after the idle timeout.
    pub async fn stop(&self, room: &str) -> AppResult<Progress> {
        let mut slot = self.registry.lock(room).await;
        let session = slot.session.as_mut().ok_or_else(no_player)?;
        let was = session.state();
        session.stop().await;
        if matches!(was, PlayState::Playing | PlayState::Paused) {
            self.arm_pause_timer(&mut slot);
            self.hub.broadcast(room, "stop", json!({ "position_ms": 0 })).await;
            self.broadcast_state(&slot).await;
        }
        Ok(snapshot(&slot))
    }

    pub async fn seek(&self, room: &str, position_ms: u64) -> AppResult<Progress> {
        let mut slot = self.registry.lock(room).await;
        let session = slot.session.as_mut().ok_or_else(no_player)?;
        if let Err(e) = session.seek(position_ms).await {
            return Err(self.fail(&mut slot, e).await);
        }
        let position_ms = session.progress().position_ms;
        self.hub.broadcast(room, "seek", json!({ "position_ms": position_ms })).await;
        self.broadcast_state(&slot).await;
        Ok(snapshot(&slot))
    }

    pub async fn set_volume(&self, room: &str, volume: f32) -> AppResult<f32> {
        let slot = self.registry.lock(room).await;
        let session = slot.session.as_ref().ok_or_else(no_player)?;
        session.set_volume(volume);
        Ok(session.volume())
    }

    /// Tears the session down but keeps the queue.
    pub async fn stop_session(&self, room: &str) {
        let mut slot = self.registry.lock(room).await;
        self.registry.remove(&mut slot).await;
        self.broadcast_state(&slot).await;
    }

    /* ---------------- session 事件 ---------------- */
    pub fn spawn_event_loop(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.handle_event(ev).await });
            }
        })
    }

    async fn handle_event(&self, ev: SessionEvent) {
        match ev {
            SessionEvent::Progress { room, generation } => {
                let Some(slot) = self.registry.lock_existing(&room).await else { return };
                if slot.generation != generation { return; }
                // tick 排隊時可能已經 pause / seek，只廣播當下的狀態
                let playing = slot.session.as_ref().is_some_and(|s| s.state() == PlayState::Playing);
                if !playing { return; }
                self.broadcast_state(&slot).await;
            }
            SessionEvent::Finished { room, generation } => self.on_finished(&room, generation).await,
            SessionEvent::TransportLost { room, generation, error } => {
                let Some(mut slot) = self.registry.lock_existing(&room).await else { return };
                if slot.generation != generation { return; }
                tracing::error!(room = %room, error = %error, "tearing down session after transport loss");
                self.registry.remove(&mut slot).await;
                self.broadcast_state(&slot).await;
            }
        }
    }

    async fn on_finished(&self, room: &str, generation: u64) {
        let Some(mut slot) = self.registry.lock_existing(room).await else { return };
        let restarted = slot.session.as_ref().is_some_and(|s| s.state() == PlayState::Playing);
        if slot.generation != generation || restarted {
            tracing::debug!(room, generation, current = slot.generation, "ignoring stale finished signal");
            return;
        }
        if let Err(e) = self.advance_locked(&mut slot).await {
            tracing::error!(room, error = %e, "auto-advance failed");
        }
    }

    /* ---------------- 內部：呼叫端已持有房間鎖 ---------------- */
    async fn advance_locked(&self, slot: &mut RoomSlot) -> AppResult<bool> {
        while slot.queue.forward() {
            match self.load_and_play(slot).await {
                Ok(()) => return Ok(true),
                Err(e @ (AppErr::Decode(_) | AppErr::Fetch(_))) => {
                    tracing::warn!(room = %slot.room_id, index = slot.queue.current_index(), error = %e, "skipping unplayable track");
                }
                Err(e) => return Err(self.fail(slot, e).await),
            }
        }
        tracing::info!(room = %slot.room_id, "queue exhausted");
        self.registry.remove(slot).await;
        self.broadcast_state(slot).await;
        Ok(false)
    }

    async fn load_and_play(&self, slot: &mut RoomSlot) -> AppResult<()> {
        let track = slot.queue.current().map(|e| e.track.clone()).ok_or_else(|| AppErr::Bad("No song in queue".into()))?;
        slot.disarm_pause_timer();
        slot.generation += 1;
        let generation = slot.generation;
        let index = slot.queue.current_index();

        slot.queue.mark_started();
        let session = self.registry.get_or_create(slot);
        session.load(track.clone(), generation).await?;
        session.play().await?;

        self.hub.broadcast(&slot.room_id, "play", json!({ "position_ms": 0, "current_index": index, "song": track })).await;
        self.broadcast_state(slot).await;
        Ok(())
    }

    /* transport 失敗：拆掉 session，房間廣播回 idle */
    async fn fail(&self, slot: &mut RoomSlot, err: AppErr) -> AppErr {
        if matches!(err, AppErr::Connection(_)) {
            tracing::error!(room = %slot.room_id, error = %err, "transport failed, tearing down session");
            self.registry.remove(slot).await;
            self.broadcast_state(slot).await;
        }
        err
    }

    fn arm_pause_timer(&self, slot: &mut RoomSlot) {
        let token = CancellationToken::new();
        if let Some(old) = slot.pause_guard.replace(token.clone()) { old.cancel(); }

        let registry = Arc::clone(&self.registry);
        let room = slot.room_id.clone();
        let generation = slot.generation;
        let timeout = self.pause_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let Some(mut slot) = registry.lock_existing(&room).await else { return };
                    if slot.generation != generation || token.is_cancelled() { return; }
                    let idle = |s: &&mut PlaybackSession| matches!(s.state(), PlayState::Paused | PlayState::Stopped);
                    if let Some(session) = slot.session.as_mut().filter(idle) {
                        session.release_transport().await;
                        tracing::info!(room = %room, "released relay after idle timeout");
                    }
                }
            }
        });
    }

    async fn broadcast_state(&self, slot: &RoomSlot) {
        self.hub.broadcast(&slot.room_id, "music_state", json!(snapshot(slot))).await;
    }
}

fn no_player() -> AppErr { AppErr::NotFound("No player".into()) }

fn snapshot(slot: &RoomSlot) -> Progress {
    let Some(session) = slot.session.as_ref() else {
        return Progress::idle(slot.queue.current_index(), slot.queue.len(), slot.queue.current().map(|e| e.track.clone()));
    };
    let p = session.progress();
    Progress {
        position_ms:   p.position_ms,
        duration_ms:   p.duration_ms,
        state:         p.state,
        current_song:  p.track.or_else(|| slot.queue.current().map(|e| e.track.clone())),
        current_index: slot.queue.current_index(),
        queue_length:  slot.queue.len(),
    }
}
