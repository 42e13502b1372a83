use std::{env, str::FromStr, time::Duration};

use crate::error::{AppErr, AppResult};

/* ------------ 傳輸策略：只在建 factory 時判斷一次 ------------ */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Direct,
    Ingress,
}

impl FromStr for TransportMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "push" => Ok(Self::Direct),
            "ingress" | "url" => Ok(Self::Ingress),
            other => Err(format!("unknown transport mode `{other}`")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub bind_addr:       String,
    pub jwt_secret:      String,
    pub relay_url:       String,
    pub relay_api_url:   String,
    pub relay_key:       String,
    pub relay_secret:    String,
    pub transport:       TransportMode,
    pub bot_identity:    String,
    pub bot_name:        String,
    pub decode_workers:  usize,
    pub connect_timeout: Duration,
    pub pause_timeout:   Duration,
    pub default_volume:  f32,
    pub fetch_timeout:   Duration,
}

impl Settings {
    /// Reads the process environment (after `.env` has been loaded).
    pub fn from_env() -> AppResult<Self> {
        let jwt_secret = env::var("JWT_SECRET").map_err(|_| AppErr::Config("JWT_SECRET is required".into()))?;
        let default_volume: f32 = var_or("DEFAULT_VOLUME", 0.5)?;
        let decode_workers: usize = var_or("DECODE_WORKERS", 2)?;

        Ok(Self {
            bind_addr:       var_or("BIND_ADDR", "0.0.0.0:3000".to_string())?,
            jwt_secret,
            relay_url:       var_or("RELAY_URL", "ws://127.0.0.1:7880".to_string())?,
            relay_api_url:   var_or("RELAY_API_URL", "http://127.0.0.1:7880".to_string())?,
            relay_key:       var_or("RELAY_API_KEY", "devkey".to_string())?,
            relay_secret:    var_or("RELAY_API_SECRET", "secret".to_string())?,
            transport:       var_or("TRANSPORT_MODE", TransportMode::Direct)?,
            bot_identity:    var_or("BOT_IDENTITY", "MusicBot".to_string())?,
            bot_name:        var_or("BOT_NAME", "Music Bot".to_string())?,
            decode_workers:  decode_workers.max(1),
            connect_timeout: Duration::from_secs(var_or("CONNECT_TIMEOUT_SECS", 30)?),
            pause_timeout:   Duration::from_secs(var_or("PAUSE_TIMEOUT_SECS", 30)?),
            default_volume:  default_volume.clamp(0.0, 1.0),
            fetch_timeout:   Duration::from_secs(var_or("FETCH_TIMEOUT_SECS", 60)?),
        })
    }
}

/* 沒設就用預設值；設了但解析失敗 ⇒ 啟動失敗並指名變數 */
fn var_or<T: FromStr>(key: &str, default: T) -> AppResult<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| AppErr::Config(format!("{key}: {e}"))),
        _ => Ok(default),
    }
}
