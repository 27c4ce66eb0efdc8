use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

use crate::audio::{read_wav_file, write_wav_file, AudioBuffer};
use crate::error::{DubError, Result};
use crate::media::MediaProcessorTrait;

/// Audio transformations the synthesizer delegates to an external tool
#[async_trait]
pub trait ClipProcessor: Send + Sync {
    /// Speed `audio` up by `ratio` (> 1.0) keeping its pitch
    async fn compress(&self, audio: &AudioBuffer, ratio: f64) -> Result<AudioBuffer>;

    /// Decode a clip in a container the WAV reader does not handle
    async fn decode(&self, bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer>;
}

/// [`ClipProcessor`] backed by ffmpeg's `atempo` filter.
///
/// Every call works in its own temporary directory under `scratch_dir`.
pub struct FfmpegClipProcessor {
    media: Arc<dyn MediaProcessorTrait>,
    scratch_dir: PathBuf,
}

impl FfmpegClipProcessor {
    pub fn new<P: Into<PathBuf>>(media: Arc<dyn MediaProcessorTrait>, scratch_dir: P) -> Self {
        Self {
            media,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn call_dir(&self) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        tempfile::Builder::new()
            .prefix("clip-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| DubError::Storage(format!("Cannot create clip scratch dir: {}", e)))
    }
}

#[async_trait]
impl ClipProcessor for FfmpegClipProcessor {
    async fn compress(&self, audio: &AudioBuffer, ratio: f64) -> Result<AudioBuffer> {
        let dir = self.call_dir()?;
        let input = dir.path().join("in.wav");
        let output = dir.path().join("out.wav");

        write_wav_file(&input, audio).await?;
        self.media.change_tempo(&input, &output, ratio).await?;
        let compressed = read_wav_file(&output).await?;

        debug!(
            "Compressed {:.3}s by {:.3}x to {:.3}s",
            audio.duration().as_secs_f64(),
            ratio,
            compressed.duration().as_secs_f64()
        );
        compressed.resample_to(audio.sample_rate())
    }

    async fn decode(&self, bytes: &[u8], sample_rate: u32) -> Result<AudioBuffer> {
        let dir = self.call_dir()?;
        let input = dir.path().join("clip.bin");
        let output = dir.path().join("clip.wav");

        fs::write(&input, bytes).await?;
        self.media
            .extract_audio(&input, &output, sample_rate)
            .await
            .map_err(|e| DubError::synthesis(format!("Unreadable synthesized audio: {}", e), false))?;
        read_wav_file(&output).await
    }
}
