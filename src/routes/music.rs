//! routes/music.rs：每個房間的播放控制，全部轉給 QueueController
use std::sync::Arc;

use axum::{
    routing::{get, post, delete},
    extract::{Extension, Json, Path},
    http::{header::AUTHORIZATION, HeaderMap},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    config::Settings,
    error::{AppErr, AppResult},
    player::QueueController,
    state::{Progress, QueueView, Track},
    utils::jwt::{self, Claims},
};

#[derive(Deserialize)] struct SeekInput   { position_ms: u64 }
#[derive(Deserialize)] struct VolumeInput { volume: f32 }

pub fn router() -> Router {
    Router::new()
        .route("/music/:room/queue",        get(list).post(enqueue))
        .route("/music/:room/queue/clear",  post(clear))
        .route("/music/:room/queue/:index", delete(dequeue))
        .route("/music/:room/play",     post(start))
        .route("/music/:room/pause",    post(pause))
        .route("/music/:room/resume",   post(resume))
        .route("/music/:room/skip",     post(skip))
        .route("/music/:room/previous", post(previous))
        .route("/music/:room/seek",     post(seek))
        .route("/music/:room/stop",     post(stop))
        .route("/music/:room/session",  delete(end_session))
        .route("/music/:room/volume",   post(volume))
        .route("/music/:room/progress", get(progress))
}

/* ── Authorization: Bearer <jwt> ── */
fn authed(headers: &HeaderMap, cfg: &Settings) -> AppResult<Claims> {
    headers.get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|t| jwt::verify(t.trim(), &cfg.jwt_secret))
        .ok_or(AppErr::Unauthorized)
}

/* ---------------- 佇列 ---------------- */
async fn list(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<QueueView>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.queue(&room).await))
}

async fn enqueue(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
    Json(track): Json<Track>,
) -> AppResult<Json<Value>> {
    let who = authed(&headers, &cfg)?;
    if track.source.trim().is_empty() { return Err(AppErr::Bad("track source is empty".into())); }
    let position = ctl.enqueue(&room, track, who.display_name()).await;
    Ok(Json(json!({ "position": position })))
}

async fn dequeue(
    Path((room, index)): Path<(String, usize)>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    ctl.dequeue(&room, index).await?;
    Ok(Json(json!({ "success": true })))
}

async fn clear(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    ctl.clear(&room).await;
    Ok(Json(json!({ "success": true })))
}

/* ---------------- 播放控制 ---------------- */
async fn start(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.start(&room).await?))
}

async fn pause(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.pause(&room).await?))
}

async fn resume(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.resume(&room).await?))
}

async fn skip(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    let playing = ctl.advance(&room).await?;
    Ok(Json(json!({ "success": true, "playing": playing })))
}

async fn previous(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    let moved = ctl.previous(&room).await?;
    Ok(Json(json!({ "success": moved })))
}

async fn seek(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
    Json(p): Json<SeekInput>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.seek(&room, p.position_ms).await?))
}

async fn stop(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.stop(&room).await?))
}

/* bot 離開房間，佇列保留 */
async fn end_session(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    ctl.stop_session(&room).await;
    Ok(Json(json!({ "success": true })))
}

async fn volume(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
    Json(p): Json<VolumeInput>,
) -> AppResult<Json<Value>> {
    authed(&headers, &cfg)?;
    if !p.volume.is_finite() { return Err(AppErr::Bad("volume must be a number".into())); }
    let volume = ctl.set_volume(&room, p.volume).await?;
    Ok(Json(json!({ "volume": volume })))
}

async fn progress(
    Path(room): Path<String>, headers: HeaderMap,
    Extension(cfg): Extension<Settings>, Extension(ctl): Extension<Arc<QueueController>>,
) -> AppResult<Json<Progress>> {
    authed(&headers, &cfg)?;
    Ok(Json(ctl.progress(&room).await))
}
