use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use super::{queue::RoomQueue, session::{PlaybackSession, SessionEvent}};
use crate::{audio::{AudioDecoder, TrackSource}, transport::TransportFactory};

/* ------------ 每個房間一把鎖：queue + session 同鎖 ------------ */
pub struct RoomSlot {
    pub room_id:     String,
    pub queue:       RoomQueue,
    pub session:     Option<PlaybackSession>,
    /// Bumped on every load and teardown; stale session events are compared against it.
    pub generation:  u64,
    pub pause_guard: Option<CancellationToken>,
}

impl RoomSlot {
    fn new(room_id: &str) -> Self {
        Self { room_id: room_id.into(), queue: RoomQueue::default(), session: None, generation: 0, pause_guard: None }
    }

    pub fn disarm_pause_timer(&mut self) {
        if let Some(t) = self.pause_guard.take() { t.cancel(); }
    }
}

pub type SlotGuard = OwnedMutexGuard<RoomSlot>;

pub struct SessionRegistry {
    rooms:          RwLock<HashMap<String, Arc<Mutex<RoomSlot>>>>,
    transports:     Arc<dyn TransportFactory>,
    decoder:        AudioDecoder,
    source:         Arc<dyn TrackSource>,
    events:         mpsc::UnboundedSender<SessionEvent>,
    load_timeout:   Duration,
    default_volume: f32,
}

impl SessionRegistry {
    pub fn new(
        transports: Arc<dyn TransportFactory>,
        decoder: AudioDecoder,
        source: Arc<dyn TrackSource>,
        load_timeout: Duration,
        default_volume: f32,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let reg = Self {
            rooms: RwLock::default(),
            transports, decoder, source, events, load_timeout, default_volume,
        };
        (reg, rx)
    }

    /// Exclusive lock on the room, creating its slot on first use.
    pub async fn lock(&self, room_id: &str) -> SlotGuard {
        let existing = self.rooms.read().await.get(room_id).cloned();
        let slot = match existing {
            Some(s) => s,
            None => self.rooms.write().await
                .entry(room_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RoomSlot::new(room_id))))
                .clone(),
        };
        slot.lock_owned().await
    }

    pub async fn lock_existing(&self, room_id: &str) -> Option<SlotGuard> {
        let slot = self.rooms.read().await.get(room_id).cloned()?;
        Some(slot.lock_owned().await)
    }

    /// Must be called with the room's lock held (`slot` comes from [`Self::lock`]).
    pub fn get_or_create<'a>(&self, slot: &'a mut RoomSlot) -> &'a mut PlaybackSession {
        let room_id = slot.room_id.clone();
        slot.session.get_or_insert_with(|| {
            tracing::info!(room = %room_id, "creating playback session");
            PlaybackSession::new(
                &room_id,
                self.transports.create(&room_id),
                self.decoder.clone(),
                self.source.clone(),
                self.events.clone(),
                self.load_timeout,
                self.default_volume,
            )
        })
    }

    /// Disconnects and drops the session; no-op when there is none.
    pub async fn remove(&self, slot: &mut RoomSlot) {
        slot.disarm_pause_timer();
        slot.generation += 1;
        if let Some(mut session) = slot.session.take() {
            session.disconnect().await;
            tracing::info!(room = %slot.room_id, "session removed");
        }
    }

    #[cfg(test)]
    pub async fn contains(&self, room_id: &str) -> bool {
        match self.lock_existing(room_id).await {
            Some(slot) => slot.session.is_some(),
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        let slots: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut n = 0;
        for s in slots {
            if s.lock().await.session.is_some() { n += 1; }
        }
        n
    }

    /// Drops slots with no session, no queue and no listeners. Busy slots are skipped.
    pub async fn reap(&self, listening: &HashSet<String>) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();
        rooms.retain(|room_id, slot| {
            if listening.contains(room_id) { return true; }
            // 有人已拿到 Arc 但還沒上鎖
            if Arc::strong_count(slot) > 1 { return true; }
            match slot.try_lock() {
                Ok(s) => s.session.is_some() || !s.queue.is_empty(),
                Err(_) => true,
            }
        });
        before - rooms.len()
    }

    pub async fn room_count(&self) -> usize { self.rooms.read().await.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{audio::testing::MemorySource, state::Track, transport::testing::RecorderFactory};

    fn registry() -> SessionRegistry {
        let (reg, _rx) = SessionRegistry::new(
            Arc::new(RecorderFactory::default()),
            AudioDecoder::new(1),
            Arc::new(MemorySource::default()),
            Duration::from_secs(5),
            0.5,
        );
        reg
    }

    #[tokio::test]
    async fn one_session_per_room_under_concurrency() {
        let reg = Arc::new(registry());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let mut slot = reg.lock("lobby").await;
                reg.get_or_create(&mut slot);
            }));
        }
        for t in tasks { t.await.unwrap(); }
        assert_eq!(reg.session_count().await, 1);
        assert_eq!(reg.room_count().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let reg = registry();
        let mut slot = reg.lock("lobby").await;
        reg.get_or_create(&mut slot);
        reg.remove(&mut slot).await;
        reg.remove(&mut slot).await;
        assert!(slot.session.is_none());
        assert_eq!(slot.generation, 2);
        drop(slot);
        assert!(!reg.contains("lobby").await);
        assert!(!reg.contains("nowhere").await);
    }

    #[tokio::test]
    async fn reaper_keeps_busy_rooms() {
        let reg = registry();
        drop(reg.lock("empty").await);
        drop(reg.lock("heard").await);
        {
            let mut q = reg.lock("queued").await;
            q.queue.push(Track { id: "a".into(), title: "a".into(), artist: String::new(), duration_ms: 0, source: "a".into() }, "x");
        }
        let listening: HashSet<String> = ["heard".to_string()].into();
        assert_eq!(reg.reap(&listening).await, 1);
        assert!(reg.lock_existing("empty").await.is_none());
        assert!(reg.lock_existing("queued").await.is_some());
        assert!(reg.lock_existing("heard").await.is_some());
    }

    #[tokio::test]
    async fn reaper_skips_slot_about_to_be_locked() {
        let reg = registry();
        drop(reg.lock("lobby").await);
        let pending = reg.rooms.read().await.get("lobby").cloned().unwrap();

        assert_eq!(reg.reap(&HashSet::new()).await, 0);
        pending.lock().await.queue.push(
            Track { id: "a".into(), title: "a".into(), artist: String::new(), duration_ms: 0, source: "a".into() }, "x",
        );
        drop(pending);
        assert_eq!(reg.lock("lobby").await.queue.len(), 1);
        assert_eq!(reg.reap(&HashSet::new()).await, 0);
    }
}
