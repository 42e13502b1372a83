use axum::Router;

pub mod music;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .nest("/api",  music::router())
        .nest("/ws",   ws::router())
}
