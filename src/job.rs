use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::storage::ArtifactHandle;
use crate::timeline::TimingConflict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// How a caption's narration segment was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionOutcome {
    /// Speech fit the window as synthesized (padded if short)
    Fitted,
    /// Sped up within the compression limit
    Compressed,
    /// Compression was not enough; the tail was cut and faded
    CompressedLossy,
    /// Caption had no speakable text
    Silent,
    /// Synthesis failed; the window is silence
    SilenceFallback,
}

impl CaptionOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, CaptionOutcome::CompressedLossy | CaptionOutcome::SilenceFallback)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedChunk {
    pub index: usize,
    pub start: Duration,
    pub end: Duration,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedCaption {
    pub index: usize,
    pub outcome: CaptionOutcome,
    pub reason: Option<String>,
}

/// Which chunks and captions fell back to placeholders, silence or lossy fitting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradationReport {
    pub chunks: Vec<DegradedChunk>,
    pub captions: Vec<DegradedCaption>,
}

impl DegradationReport {
    pub fn is_degraded(&self) -> bool {
        !self.chunks.is_empty() || !self.captions.is_empty()
    }

    pub fn extend(&mut self, other: DegradationReport) {
        self.chunks.extend(other.chunks);
        self.captions.extend(other.captions);
    }
}

/// Artifacts produced by a job, by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArtifacts {
    pub subtitle: Option<ArtifactHandle>,
    pub narration: Option<ArtifactHandle>,
    pub video: Option<ArtifactHandle>,
}

/// Final record of a dubbing job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub artifacts: JobArtifacts,
    pub degradation: DegradationReport,
    pub timing_conflicts: Vec<TimingConflict>,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degradation.is_degraded()
    }
}
