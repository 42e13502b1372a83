use std::{path::Path, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use symphonia::core::probe::Hint;

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned {0}")]
    Status(u16),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported locator `{0}`")]
    Unsupported(String),
}

/// Resolves a track's source locator to its compressed bytes.
#[async_trait]
pub trait TrackSource: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Bytes, FetchError>;
}

/* ------------ http(s):// 走 reqwest，file:// 或路徑讀本機 ------------ */
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TrackSource for HttpSource {
    async fn fetch(&self, locator: &str) -> Result<Bytes, FetchError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            let resp = self.client.get(locator).send().await?;
            if !resp.status().is_success() {
                return Err(FetchError::Status(resp.status().as_u16()));
            }
            return Ok(resp.bytes().await?);
        }

        let path = locator.strip_prefix("file://").unwrap_or(locator);
        if path.contains("://") {
            return Err(FetchError::Unsupported(locator.into()));
        }
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}

/// Container hint from the locator's extension (query string ignored).
pub fn locator_hint(locator: &str) -> Hint {
    let mut hint = Hint::new();
    let path = locator.split(['?', '#']).next().unwrap_or(locator);
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    if let Some(mime) = mime_guess::from_path(path).first() {
        hint.mime_type(mime.essence_str());
    }
    hint
}

/* ---------------- 測試用：記憶體曲庫 ---------------- */
