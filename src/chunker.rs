//! Silence-aware splitting of long audio into upload-sized chunks.
//!
//! Planning is separate from encoding: [`ChunkPlan`] holds only the spans, and
//! [`ChunkPlan::chunks`] encodes each one on demand. A worker pool that pulls
//! from that iterator therefore never holds more than its own chunks in memory,
//! and a failed run can simply iterate the plan again.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::{detect_silence, encode_wav, AudioBuffer, SilenceInterval, SilenceParams};
use crate::config::ChunkerConfig;
use crate::error::{DubError, Result};

/// 16-bit mono PCM bytes per second per Hz
const BYTES_PER_FRAME: u64 = 2;
const WAV_HEADER_BYTES: u64 = 44;

/// How a chunk's end was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKind {
    /// Inside a detected silence interval
    Silence,
    /// At the duration limit, no silence nearby
    HardCut,
    /// End of input
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub index: usize,
    pub offset: Duration,
    pub duration: Duration,
    pub split: SplitKind,
}

impl ChunkSpan {
    pub fn end(&self) -> Duration {
        self.offset + self.duration
    }
}

/// One encoded chunk, valid only while its stage runs
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub span: ChunkSpan,
    pub wav: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChunkerSettings {
    pub max_chunk: Duration,
    pub lookback: Duration,
    pub silence: SilenceParams,
}

impl ChunkerSettings {
    pub fn from_config(config: &ChunkerConfig, sample_rate: u32) -> Self {
        Self {
            max_chunk: effective_max_chunk(config, sample_rate),
            lookback: Duration::from_secs_f64(config.lookback_secs.max(0.0)),
            silence: SilenceParams {
                threshold_db: config.silence_threshold_db,
                min_silence: Duration::from_secs_f64(config.min_silence_secs.max(0.0)),
                frame: Duration::from_millis(config.frame_ms as u64),
            },
        }
    }
}

/// The longer of the two limits never applies: a chunk must fit both the
/// configured duration and the service's upload size at this sample rate.
pub fn effective_max_chunk(config: &ChunkerConfig, sample_rate: u32) -> Duration {
    let upload_bytes = (config.max_upload_mb * 1024 * 1024).saturating_sub(WAV_HEADER_BYTES);
    let bytes_per_sec = (sample_rate as u64 * BYTES_PER_FRAME).max(1);
    let upload_limit = Duration::from_secs_f64(upload_bytes as f64 / bytes_per_sec as f64);
    Duration::from_secs_f64(config.max_chunk_secs).min(upload_limit)
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    spans: Vec<ChunkSpan>,
    total: Duration,
}

impl ChunkPlan {
    /// Split `[0, total)` into consecutive spans no longer than `max_chunk`.
    ///
    /// Each boundary moves back to the midpoint of the silence interval nearest
    /// to it within `lookback`; without one the span is cut at the limit.
    pub fn plan(total: Duration, silences: &[SilenceInterval], max_chunk: Duration, lookback: Duration) -> Result<Self> {
        if total.is_zero() {
            return Err(DubError::InvalidMedia("audio track is empty".to_string()));
        }
        if max_chunk.is_zero() {
            return Err(DubError::Config("maximum chunk duration must be positive".to_string()));
        }
        let lookback = lookback.min(max_chunk);

        let mut spans = Vec::new();
        let mut start = Duration::ZERO;
        while start < total {
            let boundary = start + max_chunk;
            if boundary >= total {
                spans.push(ChunkSpan {
                    index: spans.len(),
                    offset: start,
                    duration: total - start,
                    split: SplitKind::End,
                });
                break;
            }

            let window_start = boundary.saturating_sub(lookback).max(start);
            let (end, split) = match split_point(silences, start, window_start, boundary) {
                Some(point) => (point, SplitKind::Silence),
                None => (boundary, SplitKind::HardCut),
            };
            spans.push(ChunkSpan {
                index: spans.len(),
                offset: start,
                duration: end - start,
                split,
            });
            start = end;
        }

        Ok(Self { spans, total })
    }

    /// Detect silence in `audio` and plan its chunks
    pub fn analyze(audio: &AudioBuffer, settings: &ChunkerSettings) -> Result<Self> {
        if audio.is_empty() {
            return Err(DubError::InvalidMedia("audio track is empty".to_string()));
        }
        let silences = detect_silence(audio, &settings.silence);
        debug!("Found {} silence intervals", silences.len());

        let plan = Self::plan(audio.duration(), &silences, settings.max_chunk, settings.lookback)?;
        info!(
            "Planned {} chunks for {:.1}s of audio (max {:.1}s each)",
            plan.len(),
            plan.total.as_secs_f64(),
            settings.max_chunk.as_secs_f64()
        );
        Ok(plan)
    }

    pub fn spans(&self) -> &[ChunkSpan] {
        &self.spans
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    /// Encode chunks lazily, in order. Calling again restarts from the first.
    pub fn chunks<'a>(&'a self, audio: &'a AudioBuffer) -> impl Iterator<Item = Result<AudioChunk>> + Send + 'a {
        self.spans.iter().map(move |span| {
            let slice = audio.slice(span.offset, span.end());
            if slice.is_empty() {
                return Err(DubError::InvalidMedia(format!(
                    "chunk {} at {:.3}s has no audio",
                    span.index + 1,
                    span.offset.as_secs_f64()
                )));
            }
            Ok(AudioChunk {
                span: span.clone(),
                wav: encode_wav(&slice)?,
            })
        })
    }
}

/// Midpoint of the silence nearest to `boundary` that overlaps the lookback
/// window, clamped into the window and strictly after `start`.
fn split_point(
    silences: &[SilenceInterval],
    start: Duration,
    window_start: Duration,
    boundary: Duration,
) -> Option<Duration> {
    silences
        .iter()
        .filter(|s| s.end > window_start && s.start < boundary)
        .map(|s| {
            let low = s.start.max(window_start);
            let high = s.end.min(boundary);
            s.midpoint().clamp(low, high)
        })
        .filter(|point| *point > start)
        .min_by_key(|point| boundary - *point)
}
