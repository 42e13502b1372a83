use std::sync::Arc;

use axum::{
    Router, routing::get, response::IntoResponse,
    extract::{ws::{WebSocketUpgrade, WebSocket, Message}, Query, Extension},
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    config::Settings, error::{AppErr, AppResult},
    hub::{envelope, server_time, BroadcastHub, ConnId},
    player::QueueController, utils::jwt,
};

#[derive(Deserialize)] struct WsQuery { room:Option<String>, token:String }

pub fn router() -> Router {
    Router::new().route("/music", get(ws_handler))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    Extension(cfg): Extension<Settings>,
    Extension(hub): Extension<Arc<BroadcastHub>>,
    Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<impl IntoResponse> {
    let who = jwt::verify(&q.token, &cfg.jwt_secret).ok_or(AppErr::Unauthorized)?;
    let room = q.room.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| "lobby".into());
    tracing::debug!(user = %who.sub, room = %room, "listener upgrading");
    Ok(ws.on_upgrade(move |s| listener_ws(s, room, hub, ctl)))
}

/* ---------------- per listener ---------------- */
async fn listener_ws(sock: WebSocket, room: String, hub: Arc<BroadcastHub>, ctl: Arc<QueueController>) {
    let (id, mut outbox) = hub.join(&room).await;
    let (mut sink, mut stream) = sock.split();

    /* 寫端：hub 的 outbox → socket */
    let writer = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if sink.send(Message::Text(text)).await.is_err() { break; }
        }
    });

    greet(&hub, &ctl, id, &room).await;

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(raw) => on_client_msg(&hub, &ctl, id, &raw).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    /* 離房 */
    hub.leave(id).await;
    writer.abort();
}

/* 進房：connected + 當下狀態快照，晚加入的人不用等下一次 tick */
async fn greet(hub: &BroadcastHub, ctl: &QueueController, id: ConnId, room: &str) {
    hub.send_to(id, json!({ "type": "connected", "room_name": room, "server_time": server_time() })).await;
    let snapshot = ctl.progress(room).await;
    hub.send_to(id, envelope(room, "music_state", json!(snapshot))).await;
}

async fn on_client_msg(hub: &BroadcastHub, ctl: &QueueController, id: ConnId, raw: &str) {
    let Ok(v) = serde_json::from_str::<Value>(raw) else {
        tracing::debug!(conn = %id, "ignoring non-json frame");
        return;
    };
    match v["type"].as_str() {
        Some("ping") => {
            hub.send_to(id, json!({ "type": "pong", "server_time": server_time() })).await;
        }
        Some("join_room") => {
            let Some(room) = v["room_name"].as_str().filter(|r| !r.trim().is_empty()) else { return };
            if hub.switch_room(id, room).await {
                greet(hub, ctl, id, room).await;
            }
        }
        other => tracing::debug!(conn = %id, kind = ?other, "unknown client message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::{
        audio::{testing::{wav, MemorySource}, AudioDecoder},
        player::SessionRegistry,
        state::Track,
        transport::testing::RecorderFactory,
    };

    fn controller(hub: Arc<BroadcastHub>) -> Arc<QueueController> {
        let (registry, _events) = SessionRegistry::new(
            Arc::new(RecorderFactory::default()), AudioDecoder::new(1), Arc::new(MemorySource::default()),
            Duration::from_secs(5), 0.5,
        );
        QueueController::new(Arc::new(registry), hub, Duration::from_secs(30))
    }

    fn next(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn join_greets_with_snapshot_and_ping_pongs() {
        let hub = Arc::new(BroadcastHub::new());
        let ctl = controller(hub.clone());
        let (id, mut rx) = hub.join("lobby").await;

        greet(&hub, &ctl, id, "lobby").await;
        let hello = next(&mut rx);
        assert_eq!(hello["type"], "connected");
        assert_eq!(hello["room_name"], "lobby");
        let state = next(&mut rx);
        assert_eq!(state["type"], "music_state");
        assert_eq!(state["data"]["state"], "idle");

        on_client_msg(&hub, &ctl, id, r#"{"type":"ping"}"#).await;
        let pong = next(&mut rx);
        assert_eq!(pong["type"], "pong");
        assert!(pong["server_time"].is_f64());

        on_client_msg(&hub, &ctl, id, "garbage").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_room_switches_without_reconnect() {
        let hub = Arc::new(BroadcastHub::new());
        let ctl = controller(hub.clone());
        let (id, mut rx) = hub.join("lobby").await;

        on_client_msg(&hub, &ctl, id, r#"{"type":"join_room","room_name":"party"}"#).await;
        assert_eq!(hub.room_of(id).await.as_deref(), Some("party"));
        assert_eq!(next(&mut rx)["room_name"], "party");
        assert_eq!(next(&mut rx)["type"], "music_state");

        on_client_msg(&hub, &ctl, id, r#"{"type":"join_room"}"#).await;
        assert_eq!(hub.room_of(id).await.as_deref(), Some("party"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_sees_live_position_then_ticks() {
        let hub = Arc::new(BroadcastHub::new());
        let source = MemorySource::default().with("mem://a.wav", wav(48_000, 2, 2000));
        let (registry, events) = SessionRegistry::new(
            Arc::new(RecorderFactory::default()), AudioDecoder::new(1), Arc::new(source),
            Duration::from_secs(5), 1.0,
        );
        let ctl = QueueController::new(Arc::new(registry), hub.clone(), Duration::from_secs(30));
        ctl.spawn_event_loop(events);

        let a = Track { id: "a".into(), title: "A".into(), artist: String::new(), duration_ms: 2000, source: "mem://a.wav".into() };
        ctl.enqueue("lobby", a, "dj").await;
        ctl.start("lobby").await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let (id, mut rx) = hub.join("lobby").await;
        greet(&hub, &ctl, id, "lobby").await;
        assert_eq!(next(&mut rx)["type"], "connected");
        let state = next(&mut rx);
        assert_eq!(state["type"], "music_state");
        assert_eq!(state["data"]["state"], "playing");
        assert_eq!(state["data"]["current_song"]["id"], "a");
        let pos = state["data"]["position_ms"].as_u64().unwrap();
        assert!((680..=740).contains(&pos), "pos {pos}");

        /* 下一次 ~1 s tick 也送到晚加入的人 */
        tokio::time::sleep(Duration::from_millis(400)).await;
        let mut ticks = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            let v: Value = serde_json::from_str(&raw).unwrap();
            if v["type"] == "music_state" { ticks.push(v["data"]["position_ms"].as_u64().unwrap()); }
        }
        assert!(ticks.iter().any(|&p| p >= 980), "ticks {ticks:?}");
    }
}
