//! Caption-window fitting.
//!
//! Every caption gets a segment of exactly its window's length:
//!
//! 1. Speech longer than the window (plus tolerance) is compressed, at most by
//!    `max_compression_ratio`.
//! 2. Speech that is still too long is cut to the window and faded out, and
//!    the caption is flagged as [`CaptionOutcome::CompressedLossy`].
//! 3. Shorter speech is padded with trailing silence. It is never stretched.
//!
//! Captions with nothing to say become silence, and so do captions whose
//! synthesis fails after retries; the latter are reported as degraded.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{clean_caption_text, ClipProcessor, SynthesisOptions, VoiceBackend};
use crate::audio::{decode_wav, frames_for, AudioBuffer};
use crate::config::NarrationConfig;
use crate::error::{DubError, Result};
use crate::events::{EventSink, FailureKind};
use crate::job::CaptionOutcome;
use crate::retry::RetryPolicy;
use crate::subtitle::Caption;

#[derive(Debug, Clone)]
pub struct FittingSettings {
    pub sample_rate: u32,
    pub tolerance: Duration,
    pub max_compression_ratio: f64,
    pub fade_out: Duration,
}

impl FittingSettings {
    pub fn from_config(config: &NarrationConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            tolerance: config.tolerance(),
            max_compression_ratio: config.max_compression_ratio,
            fade_out: config.fade_out(),
        }
    }
}

/// Narration for one caption, already fitted to its window
#[derive(Debug, Clone, Serialize)]
pub struct NarrationSegment {
    pub caption_index: usize,
    pub start: Duration,
    /// Window length
    pub target_duration: Duration,
    /// Length of the speech as synthesized, before fitting
    pub raw_duration: Duration,
    pub outcome: CaptionOutcome,
    /// Why synthesis fell back to silence
    pub failure: Option<String>,
    #[serde(skip)]
    pub audio: AudioBuffer,
}

impl NarrationSegment {
    fn silent(caption: &Caption, sample_rate: u32, outcome: CaptionOutcome, failure: Option<String>) -> Self {
        Self {
            caption_index: caption.index,
            start: caption.start,
            target_duration: caption.duration(),
            raw_duration: Duration::ZERO,
            outcome,
            failure,
            audio: AudioBuffer::new(vec![0.0; window_frames(caption, sample_rate)], sample_rate),
        }
    }

    pub fn end(&self) -> Duration {
        self.start + self.target_duration
    }
}

/// Frames between the caption's start and end positions on the output
/// timeline, so consecutive windows tile without rounding gaps
fn window_frames(caption: &Caption, sample_rate: u32) -> usize {
    frames_for(caption.end, sample_rate).saturating_sub(frames_for(caption.start, sample_rate))
}

pub struct NarrationSynthesizer {
    backend: Arc<dyn VoiceBackend>,
    clips: Arc<dyn ClipProcessor>,
    retry: RetryPolicy,
    voice_id: String,
    options: SynthesisOptions,
    settings: FittingSettings,
}

impl NarrationSynthesizer {
    pub fn new(
        backend: Arc<dyn VoiceBackend>,
        clips: Arc<dyn ClipProcessor>,
        retry: RetryPolicy,
        voice_id: &str,
        settings: FittingSettings,
    ) -> Self {
        Self {
            backend,
            clips,
            retry,
            voice_id: voice_id.to_string(),
            options: SynthesisOptions::default(),
            settings,
        }
    }

    pub fn with_options(mut self, options: SynthesisOptions) -> Self {
        self.options = options;
        self
    }

    pub fn settings(&self) -> &FittingSettings {
        &self.settings
    }

    /// Synthesize `text` as-is, at the configured sample rate
    pub async fn speak(&self, text: &str) -> Result<AudioBuffer> {
        let label = format!("Speech for {} chars", text.chars().count());
        let bytes = self
            .retry
            .run(&label, |_| self.backend.synthesize(text, &self.voice_id, &self.options))
            .await?;
        self.decode_clip(&bytes).await
    }

    /// Synthesize one caption and fit it to its window
    pub async fn synthesize_caption(&self, caption: &Caption) -> Result<NarrationSegment> {
        let text = clean_caption_text(&caption.text);
        if text.is_empty() {
            debug!("Caption {} has no speakable text", caption.index);
            return Ok(NarrationSegment::silent(caption, self.settings.sample_rate, CaptionOutcome::Silent, None));
        }

        let raw = self.speak(&text).await?;
        if raw.is_empty() {
            return Err(DubError::synthesis(
                format!("Caption {}: engine returned no samples", caption.index),
                false,
            ));
        }
        let raw_duration = raw.duration();
        let (audio, outcome) = self.fit(raw, window_frames(caption, self.settings.sample_rate)).await?;

        Ok(NarrationSegment {
            caption_index: caption.index,
            start: caption.start,
            target_duration: caption.duration(),
            raw_duration,
            outcome,
            failure: None,
            audio,
        })
    }

    /// Fit `audio` to exactly `target_frames`
    pub async fn fit(&self, audio: AudioBuffer, target_frames: usize) -> Result<(AudioBuffer, CaptionOutcome)> {
        let rate = self.settings.sample_rate;
        let limit = target_frames + frames_for(self.settings.tolerance, rate);
        let mut audio = audio;
        let mut outcome = CaptionOutcome::Fitted;

        if audio.len() > limit && target_frames > 0 {
            let needed = audio.len() as f64 / target_frames as f64;
            let ratio = needed.min(self.settings.max_compression_ratio);
            if ratio > 1.0 {
                audio = self.clips.compress(&audio, ratio).await?.resample_to(rate)?;
                outcome = CaptionOutcome::Compressed;
            }
            if audio.len() > limit {
                debug!(
                    "Speech needs {:.2}x but the limit is {:.2}x, truncating",
                    needed, self.settings.max_compression_ratio
                );
                audio.truncate_frames(target_frames);
                audio.fade_out(self.settings.fade_out);
                outcome = CaptionOutcome::CompressedLossy;
            }
        }

        // Within tolerance now: trim any remainder, pad the rest
        if audio.len() > target_frames {
            audio.truncate_frames(target_frames);
            audio.fade_out(self.settings.tolerance.min(self.settings.fade_out));
        }
        audio.append_silence_frames(target_frames - audio.len());
        Ok((audio, outcome))
    }

    /// Synthesize all captions with up to `workers` requests in flight.
    ///
    /// Captions that fail after retries become silence. Segments are returned
    /// sorted by caption index.
    pub async fn synthesize_all(
        &self,
        captions: &[Caption],
        workers: usize,
        cancel: &CancellationToken,
        events: &EventSink,
    ) -> Result<Vec<NarrationSegment>> {
        let caption_count = captions.len();
        info!(
            "Synthesizing {} captions with voice {} ({} in parallel)",
            caption_count,
            self.voice_id,
            workers
        );

        let mut pending = stream::iter(captions)
            .map(|caption| async move {
                if cancel.is_cancelled() {
                    return Err(DubError::Cancelled);
                }
                match self.synthesize_caption(caption).await {
                    Ok(segment) => Ok(segment),
                    Err(DubError::Cancelled) => Err(DubError::Cancelled),
                    Err(e) => {
                        warn!("Caption {} falls back to silence: {}", caption.index, e);
                        events.stage_failed(
                            FailureKind::Synthesis,
                            format!("caption {} fell back to silence: {}", caption.index, e),
                        );
                        Ok(NarrationSegment::silent(
                            caption,
                            self.settings.sample_rate,
                            CaptionOutcome::SilenceFallback,
                            Some(e.to_string()),
                        ))
                    }
                }
            })
            .buffer_unordered(workers.max(1));

        let mut segments = Vec::with_capacity(caption_count);
        while let Some(segment) = pending.next().await {
            if cancel.is_cancelled() {
                continue;
            }
            let segment = segment?;
            events.caption_synthesized(segment.caption_index, caption_count, segment.outcome);
            segments.push(segment);
        }
        if cancel.is_cancelled() {
            info!("Synthesis cancelled");
            return Err(DubError::Cancelled);
        }

        segments.sort_by_key(|s| s.caption_index);
        let degraded = segments.iter().filter(|s| s.outcome.is_degraded()).count();
        info!("Synthesis finished: {} segments, {} degraded", segments.len(), degraded);
        Ok(segments)
    }

    async fn decode_clip(&self, bytes: &[u8]) -> Result<AudioBuffer> {
        let audio = if bytes.starts_with(b"RIFF") {
            decode_wav(bytes).map_err(|e| DubError::synthesis(format!("Unreadable WAV from engine: {}", e), false))?
        } else {
            self.clips.decode(bytes, self.settings.sample_rate).await?
        };
        audio.resample_to(self.settings.sample_rate)
    }
}
