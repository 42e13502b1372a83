use std::{io, sync::Arc};

use bytes::Bytes;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tokio::sync::Semaphore;

use super::{Pcm, SAMPLE_RATE};

const RESAMPLE_CHUNK: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("unsupported container: {0}")]
    Unsupported(String),
    #[error("no decodable audio track")]
    NoAudioTrack,
    #[error("corrupt stream: {0}")]
    Corrupt(String),
    #[error("resample failed: {0}")]
    Resample(String),
    #[error("stream decoded to zero samples")]
    Empty,
    #[error("load timed out after {0}s")]
    Timeout(u64),
    #[error("decode worker died: {0}")]
    Worker(String),
}

/// Bounded pool: at most `workers` decodes occupy blocking threads at once.
#[derive(Clone)]
pub struct AudioDecoder {
    permits: Arc<Semaphore>,
}

impl AudioDecoder {
    pub fn new(workers: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(workers.max(1))) }
    }

    pub async fn decode(&self, bytes: Bytes, hint: Hint) -> Result<Pcm, DecodeError> {
        let permit = self.permits.clone().acquire_owned().await
            .map_err(|e| DecodeError::Worker(e.to_string()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            decode_blocking(bytes, hint)
        })
        .await
        .map_err(|e| DecodeError::Worker(e.to_string()))?
    }
}

fn decode_blocking(bytes: Bytes, hint: Hint) -> Result<Pcm, DecodeError> {
    let input_len = bytes.len();
    let mss = MediaSourceStream::new(Box::new(io::Cursor::new(bytes)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoAudioTrack)?;
    let track_id = track.id;
    let mut source_rate = track.codec_params.sample_rate.unwrap_or(SAMPLE_RATE);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Unsupported(e.to_string()))?;

    // 先解成 planar f32 (L/R)，最後統一重取樣 + 轉 s16
    let mut left: Vec<f32> = Vec::new();
    let mut right: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Corrupt(e.to_string())),
        };
        if packet.track_id() != track_id { continue; }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let channels = spec.channels.count();
                if channels == 0 { continue; }
                source_rate = spec.rate;

                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                for frame in buf.samples().chunks(channels) {
                    left.push(frame[0]);
                    right.push(frame.get(1).copied().unwrap_or(frame[0]));   // mono ⇒ 複製
                }
            }
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::debug!(error = %e, "skipping undecodable packet");
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(DecodeError::Corrupt(e.to_string())),
        }
    }

    if left.is_empty() { return Err(DecodeError::Empty); }

    if source_rate != SAMPLE_RATE {
        (left, right) = resample(left, right, source_rate)?;
    }

    let mut interleaved = Vec::with_capacity(left.len() * 2);
    for (l, r) in left.iter().zip(&right) {
        interleaved.push(to_i16(*l));
        interleaved.push(to_i16(*r));
    }

    tracing::info!(input_len, source_rate, frames = left.len(), "decoded track");
    Ok(Pcm::from_interleaved(interleaved))
}

fn resample(left: Vec<f32>, right: Vec<f32>, from: u32) -> Result<(Vec<f32>, Vec<f32>), DecodeError> {
    let ratio = SAMPLE_RATE as f64 / from as f64;
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 2)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let expected = (left.len() as f64 * ratio).round() as usize;
    let mut out_l = Vec::with_capacity(expected + RESAMPLE_CHUNK);
    let mut out_r = Vec::with_capacity(expected + RESAMPLE_CHUNK);

    for start in (0..left.len()).step_by(RESAMPLE_CHUNK) {
        let end = (start + RESAMPLE_CHUNK).min(left.len());
        let mut chunk = [left[start..end].to_vec(), right[start..end].to_vec()];
        for ch in chunk.iter_mut() { ch.resize(RESAMPLE_CHUNK, 0.0); }   // 尾巴補零

        let waves = resampler.process(&chunk[..], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        out_l.extend_from_slice(&waves[0]);
        out_r.extend_from_slice(&waves[1]);
    }

    out_l.truncate(expected);
    out_r.truncate(expected);
    Ok((out_l, out_r))
}

fn to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
