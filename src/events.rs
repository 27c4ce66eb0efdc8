use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

use crate::job::CaptionOutcome;

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Probe,
    Transcription,
    Subtitle,
    Synthesis,
    Assembly,
    Merge,
    Storage,
    Cancelled,
}

/// Progress notifications emitted while a job runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    ChunkCompleted {
        job_id: Uuid,
        chunk_index: usize,
        chunk_count: usize,
        offset_ms: u64,
        degraded: bool,
    },
    #[serde(rename_all = "camelCase")]
    CaptionSynthesized {
        job_id: Uuid,
        caption_index: usize,
        caption_count: usize,
        outcome: CaptionOutcome,
    },
    #[serde(rename_all = "camelCase")]
    StageFailed {
        job_id: Uuid,
        kind: FailureKind,
        detail: String,
    },
}

/// Sending half handed to the pipeline stages.
///
/// Events are best effort: a dropped receiver never fails the job.
#[derive(Debug, Clone)]
pub struct EventSink {
    job_id: Uuid,
    sender: Option<UnboundedSender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(job_id: Uuid, sender: UnboundedSender<PipelineEvent>) -> Self {
        Self {
            job_id,
            sender: Some(sender),
        }
    }

    /// Sink and the receiver that observes it
    pub fn channel(job_id: Uuid) -> (Self, UnboundedReceiver<PipelineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(job_id, sender), receiver)
    }

    /// Sink that discards everything
    pub fn disabled(job_id: Uuid) -> Self {
        Self { job_id, sender: None }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn chunk_completed(&self, chunk_index: usize, chunk_count: usize, offset_ms: u64, degraded: bool) {
        self.emit(PipelineEvent::ChunkCompleted {
            job_id: self.job_id,
            chunk_index,
            chunk_count,
            offset_ms,
            degraded,
        });
    }

    pub fn caption_synthesized(&self, caption_index: usize, caption_count: usize, outcome: CaptionOutcome) {
        self.emit(PipelineEvent::CaptionSynthesized {
            job_id: self.job_id,
            caption_index,
            caption_count,
            outcome,
        });
    }

    pub fn stage_failed<S: Into<String>>(&self, kind: FailureKind, detail: S) {
        self.emit(PipelineEvent::StageFailed {
            job_id: self.job_id,
            kind,
            detail: detail.into(),
        });
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                debug!("Event receiver for job {} is gone", self.job_id);
            }
        }
    }
}
