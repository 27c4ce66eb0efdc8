// Chunk transcription
//
// - Remote: OpenAI-compatible speech-to-text endpoint (multipart upload, segment timestamps)
// - Combiner: folds per-chunk results into one monotonic caption list
//
// transcribe_chunks drives a Transcriber over a ChunkPlan with a bounded number of
// requests in flight. Results come back in chunk order regardless of completion
// order. A chunk that exhausts its retries or misses its deadline is recorded as
// degraded instead of failing the job.

pub mod combiner;
pub mod remote;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use combiner::*;
pub use remote::*;

use crate::audio::AudioBuffer;
use crate::chunker::{ChunkPlan, ChunkSpan};
use crate::config::TranscriberConfig;
use crate::error::{DubError, Result};
use crate::events::{EventSink, FailureKind};
use crate::retry::RetryPolicy;

/// One timed segment, relative to the start of its chunk
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

/// What the speech-to-text service returned for one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTranscript {
    pub segments: Vec<TranscriptSegment>,
    pub language: Option<String>,
}

/// Main trait for speech-to-text services
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one WAV-encoded chunk
    async fn transcribe(&self, audio_wav: &[u8]) -> Result<RawTranscript>;

    /// Service name for logs
    fn name(&self) -> &str;
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    /// Create the configured remote transcriber, reading its key from the environment
    pub fn create_transcriber(config: &TranscriberConfig) -> Result<Arc<dyn Transcriber>> {
        Ok(Arc::new(RemoteTranscriber::from_config(config)?))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Transcribed(RawTranscript),
    /// No usable result; the reason is kept for the degradation report
    Degraded(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub span: ChunkSpan,
    pub outcome: ChunkOutcome,
}

impl ChunkResult {
    pub fn is_degraded(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Degraded(_))
    }
}

/// Knobs for the transcription stage
#[derive(Debug, Clone)]
pub struct ChunkStageSettings {
    pub workers: usize,
    /// Hard limit for one chunk, retries included
    pub chunk_deadline: Duration,
    pub retry: RetryPolicy,
}

/// Transcribe every chunk of `plan`, returning results in chunk order.
///
/// Cancellation is checked before each chunk starts and as each result is
/// collected. Calls already in flight run to completion but their results are
/// discarded.
pub async fn transcribe_chunks(
    transcriber: Arc<dyn Transcriber>,
    plan: &ChunkPlan,
    audio: &AudioBuffer,
    settings: &ChunkStageSettings,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<Vec<ChunkResult>> {
    let chunk_count = plan.len();
    info!(
        "Transcribing {} chunks with {} ({} in parallel)",
        chunk_count,
        transcriber.name(),
        settings.workers
    );

    let mut ordered = stream::iter(plan.chunks(audio))
        .map(|chunk| {
            let transcriber = transcriber.clone();
            async move {
                if cancel.is_cancelled() {
                    return Err(DubError::Cancelled);
                }
                let chunk = chunk?;
                let label = format!("Chunk {}/{}", chunk.span.index + 1, chunk_count);
                let attempts = settings.retry.run(&label, |_| transcriber.transcribe(&chunk.wav));

                let outcome = match tokio::time::timeout(settings.chunk_deadline, attempts).await {
                    Ok(Ok(raw)) => ChunkOutcome::Transcribed(raw),
                    Ok(Err(e)) => {
                        warn!("{} degraded: {}", label, e);
                        ChunkOutcome::Degraded(e.to_string())
                    }
                    Err(_) => {
                        warn!("{} degraded: no result within {:?}", label, settings.chunk_deadline);
                        ChunkOutcome::Degraded(format!("no result within {:?}", settings.chunk_deadline))
                    }
                };
                Ok(ChunkResult {
                    span: chunk.span,
                    outcome,
                })
            }
        })
        .buffered(settings.workers.max(1));

    let mut results = Vec::with_capacity(chunk_count);
    while let Some(result) = ordered.next().await {
        if cancel.is_cancelled() {
            // Let calls already in flight finish, keep none of their results
            continue;
        }
        let result = result?;

        let offset_ms = result.span.offset.as_millis() as u64;
        events.chunk_completed(result.span.index, chunk_count, offset_ms, result.is_degraded());
        if let ChunkOutcome::Degraded(reason) = &result.outcome {
            events.stage_failed(
                FailureKind::Transcription,
                format!("chunk {} degraded: {}", result.span.index + 1, reason),
            );
        }
        results.push(result);
    }
    if cancel.is_cancelled() {
        info!("Transcription cancelled");
        return Err(DubError::Cancelled);
    }

    let degraded = results.iter().filter(|r| r.is_degraded()).count();
    info!("Transcription finished: {} chunks, {} degraded", results.len(), degraded);
    Ok(results)
}
