//! Per-room fan-out of playback events to listener sockets.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Per-listener outbox. A full or closed outbox counts as a failed send.
const CONNECTION_BUFFER_SIZE: usize = 64;

pub type ConnId = Uuid;

#[derive(Debug)]
pub struct ListenerConnection {
    pub room_id:   String,
    pub joined_at: DateTime<Utc>,
    tx:            mpsc::Sender<String>,
}

#[derive(Default)]
struct HubInner {
    rooms: HashMap<String, HashSet<ConnId>>,
    conns: HashMap<ConnId, ListenerConnection>,
}

impl HubInner {
    fn detach(&mut self, id: ConnId, room_id: &str) {
        if let Some(members) = self.rooms.get_mut(room_id) {
            members.remove(&id);
            if members.is_empty() { self.rooms.remove(room_id); }
        }
    }

    fn prune(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(&id) {
            self.detach(id, &conn.room_id);
        }
    }
}

#[derive(Default)]
pub struct BroadcastHub {
    inner: RwLock<HubInner>,
}

/// Seconds since the epoch, millisecond resolution; clients derive clock offset from it.
pub fn server_time() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// `music_state` wraps its payload in `data`; control events are flattened.
pub fn envelope(room_id: &str, event_type: &str, payload: Value) -> Value {
    if event_type == "music_state" {
        return json!({ "type": event_type, "data": payload, "server_time": server_time() });
    }
    let mut msg = match payload {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("data".into(), other);
            m
        }
    };
    msg.insert("type".into(), json!(event_type));
    msg.insert("room_name".into(), json!(room_id));
    msg.insert("server_time".into(), json!(server_time()));
    Value::Object(msg)
}

impl BroadcastHub {
    pub fn new() -> Self { Self::default() }

    pub async fn join(&self, room_id: &str) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let id = Uuid::new_v4();
        let conn = ListenerConnection { room_id: room_id.into(), joined_at: Utc::now(), tx };

        let mut inner = self.inner.write().await;
        inner.rooms.entry(room_id.to_string()).or_default().insert(id);
        inner.conns.insert(id, conn);
        tracing::info!(room = %room_id, conn = %id, "listener joined");
        (id, rx)
    }

    pub async fn leave(&self, id: ConnId) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.conns.remove(&id) {
            inner.detach(id, &conn.room_id);
            let secs = (Utc::now() - conn.joined_at).num_seconds();
            tracing::info!(room = %conn.room_id, conn = %id, secs, "listener left");
        }
    }

    /// Moves the listener under one write lock, so no broadcast sees it in both rooms.
    pub async fn switch_room(&self, id: ConnId, new_room: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(old_room) = inner.conns.get(&id).map(|c| c.room_id.clone()) else { return false };
        if old_room == new_room { return true; }

        inner.detach(id, &old_room);
        inner.rooms.entry(new_room.to_string()).or_default().insert(id);
        if let Some(conn) = inner.conns.get_mut(&id) {
            conn.room_id = new_room.into();
            conn.joined_at = Utc::now();
        }
        tracing::info!(from = %old_room, to = %new_room, conn = %id, "listener switched room");
        true
    }

    /// Best-effort: never waits on a listener; failed ones are dropped.
    pub async fn broadcast(&self, room_id: &str, event_type: &str, payload: Value) -> usize {
        let text = envelope(room_id, event_type, payload).to_string();
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(room_id) else { return 0 };
            for id in members {
                let Some(conn) = inner.conns.get(id) else { continue };
                match conn.tx.try_send(text.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.write().await;
            for id in &dead { inner.prune(*id); }
            tracing::warn!(room = %room_id, pruned = dead.len(), "dropped unresponsive listeners");
        }
        delivered
    }

    /// Direct message to one listener (handshake replies, initial state).
    pub async fn send_to(&self, id: ConnId, msg: Value) -> bool {
        let inner = self.inner.read().await;
        match inner.conns.get(&id) {
            Some(conn) => conn.tx.try_send(msg.to_string()).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub async fn room_of(&self, id: ConnId) -> Option<String> {
        self.inner.read().await.conns.get(&id).map(|c| c.room_id.clone())
    }

    #[cfg(test)]
    pub async fn members(&self, room_id: &str) -> usize {
        self.inner.read().await.rooms.get(room_id).map_or(0, HashSet::len)
    }

    pub async fn active_rooms(&self) -> HashSet<String> {
        self.inner.read().await.rooms.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Value { serde_json::from_str(raw).unwrap() }

    #[tokio::test]
    async fn broadcast_reaches_only_room_members() {
        let hub = BroadcastHub::new();
        let (_a, mut rx_a) = hub.join("lobby").await;
        let (_b, mut rx_b) = hub.join("lobby").await;
        let (_c, mut rx_c) = hub.join("other").await;

        assert_eq!(hub.broadcast("lobby", "pause", json!({ "position_ms": 1200 })).await, 2);
        for rx in [&mut rx_a, &mut rx_b] {
            let msg = parse(&rx.recv().await.unwrap());
            assert_eq!(msg["type"], "pause");
            assert_eq!(msg["room_name"], "lobby");
            assert_eq!(msg["position_ms"], 1200);
            assert!(msg["server_time"].as_f64().unwrap() > 1.6e9);
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn music_state_is_wrapped_in_data() {
        let hub = BroadcastHub::new();
        let (_a, mut rx) = hub.join("lobby").await;
        hub.broadcast("lobby", "music_state", json!({ "state": "idle" })).await;
        let msg = parse(&rx.recv().await.unwrap());
        assert_eq!(msg["type"], "music_state");
        assert_eq!(msg["data"]["state"], "idle");
        assert!(msg["server_time"].is_f64());
    }

    #[tokio::test]
    async fn dead_listener_is_pruned_without_hurting_others() {
        let hub = BroadcastHub::new();
        let (dead, rx_dead) = hub.join("lobby").await;
        let (_live, mut rx_live) = hub.join("lobby").await;
        drop(rx_dead);

        assert_eq!(hub.broadcast("lobby", "seek", json!({ "position_ms": 5 })).await, 1);
        assert_eq!(hub.members("lobby").await, 1);
        assert!(hub.room_of(dead).await.is_none());
        assert_eq!(parse(&rx_live.recv().await.unwrap())["type"], "seek");
    }

    #[tokio::test]
    async fn slow_listener_is_pruned_once_its_outbox_fills() {
        let hub = BroadcastHub::new();
        let (_slow, _rx_slow) = hub.join("lobby").await;
        let (_fast, mut rx_fast) = hub.join("lobby").await;

        for i in 0..=CONNECTION_BUFFER_SIZE {
            hub.broadcast("lobby", "seek", json!({ "position_ms": i })).await;
            rx_fast.recv().await.unwrap();
        }
        assert_eq!(hub.members("lobby").await, 1);
    }

    #[tokio::test]
    async fn switch_room_moves_atomically() {
        let hub = BroadcastHub::new();
        let (id, mut rx) = hub.join("a").await;
        assert!(hub.switch_room(id, "b").await);
        assert_eq!(hub.members("a").await, 0);
        assert_eq!(hub.members("b").await, 1);
        assert!(!hub.active_rooms().await.contains("a"));

        hub.broadcast("a", "play", Value::Null).await;
        hub.broadcast("b", "play", Value::Null).await;
        assert_eq!(parse(&rx.recv().await.unwrap())["room_name"], "b");
        assert!(rx.try_recv().is_err());

        hub.leave(id).await;
        hub.leave(id).await;
        assert!(!hub.switch_room(id, "c").await);
        assert_eq!(hub.members("b").await, 0);
    }
}
