use axum::{http::StatusCode, response::IntoResponse};

use crate::{audio::{DecodeError, FetchError}, transport::ConnectionError};

pub type AppResult<T> = Result<T, AppErr>;

#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Config: {0}")]
    Config(String),

    #[error("Decode: {0}")]
    Decode(#[from] DecodeError),

    #[error("Fetch: {0}")]
    Fetch(#[from] FetchError),

    #[error("Transport: {0}")]
    Connection(#[from] ConnectionError),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let code = match &self {
            AppErr::Bad(_)          => StatusCode::BAD_REQUEST,
            AppErr::NotFound(_)     => StatusCode::NOT_FOUND,
            AppErr::Unauthorized    => StatusCode::UNAUTHORIZED,
            AppErr::Decode(_)       => StatusCode::UNPROCESSABLE_ENTITY,
            AppErr::Fetch(_)
            | AppErr::Connection(_) => StatusCode::BAD_GATEWAY,
            _                       => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, self.to_string()).into_response()
    }
}
