// Media processing on top of ffmpeg/ffprobe
//
// - Commands: argument builders for every invocation the pipeline makes
// - Processor: the trait implementation that runs them and interprets failures
//   (probe/extract failures are InvalidMedia, merge failures are Merge)

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

/// What the prober learned about a source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: Duration,
    pub has_video: bool,
    pub has_audio: bool,
    /// Sample rate of the first audio stream
    pub sample_rate: Option<u32>,
    pub format_name: Option<String>,
}

/// Main trait for media processing operations
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// Report duration and streams of a media file
    async fn probe(&self, input_path: &Path) -> Result<MediaInfo>;

    /// Extract mono PCM WAV audio at `sample_rate` from any media file
    async fn extract_audio(&self, input_path: &Path, audio_path: &Path, sample_rate: u32) -> Result<()>;

    /// Speed up (ratio > 1) or slow down WAV audio without changing pitch
    async fn change_tempo(&self, input_path: &Path, output_path: &Path, ratio: f64) -> Result<()>;

    /// Encode a WAV file to MP3
    async fn encode_mp3(&self, input_path: &Path, output_path: &Path) -> Result<()>;

    /// Replace the audio of a video with the narration track, copying the video stream
    async fn merge_narration(&self, video_path: &Path, narration_path: &Path, output_path: &Path) -> Result<()>;

    /// Check if media processor is available
    async fn check_availability(&self) -> Result<()>;

    /// Get media processor version information
    async fn get_version_info(&self) -> Result<String>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Box<dyn MediaProcessorTrait> {
        Box::new(processor::MediaProcessorImpl::new(config))
    }
}
