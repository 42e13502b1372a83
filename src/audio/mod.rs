//! PCM format shared by the decoder, the sessions and the transports.

use std::sync::Arc;

mod decoder;
mod source;

pub use decoder::{AudioDecoder, DecodeError};
pub use source::{locator_hint, FetchError, HttpSource, TrackSource};

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;
/// 20 ms @ 48 kHz, per channel.
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_MS: u64 = 20;

/// Interleaved s16 stereo at [`SAMPLE_RATE`].
#[derive(Clone, Debug, Default)]
pub struct Pcm {
    samples: Arc<[i16]>,
}

impl Pcm {
    pub fn from_interleaved(samples: Vec<i16>) -> Self {
        Self { samples: samples.into() }
    }

    #[cfg(test)]
    pub fn samples(&self) -> &[i16] { &self.samples }

    /// Sample count per channel.
    pub fn total_samples(&self) -> usize { self.samples.len() / CHANNELS }

    pub fn duration_ms(&self) -> u64 { samples_to_ms(self.total_samples()) }

    /// Fills `out` (one frame, interleaved) starting at per-channel sample `pos`.
    /// A short tail is padded with silence. Returns how many real samples were copied.
    pub fn fill_frame(&self, pos: usize, volume: f32, out: &mut [i16]) -> usize {
        let start = (pos * CHANNELS).min(self.samples.len());
        let end = (start + out.len()).min(self.samples.len());
        let src = &self.samples[start..end];
        for (o, s) in out.iter_mut().zip(src) {
            *o = scale(*s, volume);
        }
        out[src.len()..].fill(0);
        src.len() / CHANNELS
    }
}

fn scale(s: i16, volume: f32) -> i16 {
    if volume >= 1.0 { return s; }
    (s as f32 * volume).round() as i16
}

pub fn samples_to_ms(samples: usize) -> u64 {
    samples as u64 * 1000 / SAMPLE_RATE as u64
}

pub fn ms_to_samples(ms: u64) -> usize {
    (ms * SAMPLE_RATE as u64 / 1000) as usize
}

/* ---------------- 測試用：合成 WAV ---------------- */
#[cfg(test)]
pub mod testing {
    pub use super::source::testing::MemorySource;

    /// 16-bit PCM WAV with a constant non-zero level so gain/padding is observable.
    pub fn wav(rate: u32, channels: u16, ms: u64) -> Vec<u8> {
        let frames = (rate as u64 * ms / 1000) as u32;
        let data_len = frames * channels as u32 * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * channels as u32 * 2).to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for i in 0..frames * channels as u32 {
            let v: i16 = if i % 2 == 0 { 8000 } else { -8000 };
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tail_is_padded_with_silence() {
        let pcm = Pcm::from_interleaved(vec![100; 10 * CHANNELS]);
        let mut frame = [7i16; FRAME_SAMPLES * CHANNELS];
        let copied = pcm.fill_frame(4, 1.0, &mut frame);
        assert_eq!(copied, 6);
        assert!(frame[..12].iter().all(|s| *s == 100));
        assert!(frame[12..].iter().all(|s| *s == 0));
    }

    #[test]
    fn volume_scales_samples() {
        let pcm = Pcm::from_interleaved(vec![1000; FRAME_SAMPLES * CHANNELS]);
        let mut frame = [0i16; FRAME_SAMPLES * CHANNELS];
        pcm.fill_frame(0, 0.5, &mut frame);
        assert_eq!(frame[0], 500);
    }

    #[test]
    fn ms_and_samples_agree() {
        assert_eq!(ms_to_samples(1500), 72_000);
        assert_eq!(samples_to_ms(72_000), 1500);
        assert_eq!(samples_to_ms(FRAME_SAMPLES), FRAME_MS);
    }
}
