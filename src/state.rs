use serde::{Deserialize, Serialize};

/* ------------ 曲目 ------------ */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id:          String,
    pub title:       String,
    #[serde(default)]
    pub artist:      String,
    #[serde(default)]
    pub duration_ms: u64,
    pub source:      String,   // 已解析好的 source locator
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueEntry {
    pub track:        Track,
    pub requested_by: String,
}

/* ------------ 播放狀態 ------------ */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
}

impl PlayState {
    pub fn as_u8(self) -> u8 { self as u8 }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Loading,
            2 => Self::Playing,
            3 => Self::Paused,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }
}

/// Per-tick position report; the `data` of every `music_state` event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Progress {
    pub position_ms:   u64,
    pub duration_ms:   u64,
    pub state:         PlayState,
    pub current_song:  Option<Track>,
    pub current_index: usize,
    pub queue_length:  usize,
}

impl Progress {
    pub fn idle(current_index: usize, queue_length: usize, current_song: Option<Track>) -> Self {
        Self { position_ms: 0, duration_ms: 0, state: PlayState::Idle, current_song, current_index, queue_length }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct QueueView {
    pub is_playing:    bool,
    pub current_song:  Option<Track>,
    pub current_index: usize,
    pub queue:         Vec<QueueEntry>,
}
