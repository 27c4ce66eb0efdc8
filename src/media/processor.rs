use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{MediaCommandBuilder, MediaInfo, MediaProcessorTrait};
use crate::config::MediaConfig;
use crate::error::{DubError, Result};

/// ffprobe `-of json` output, only the fields we ask for
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    sample_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

/// Interpret ffprobe JSON. Missing or zero duration means the file is unusable.
pub fn parse_probe_output(json: &str) -> Result<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| DubError::InvalidMedia(format!("Unreadable probe output: {}", e)))?;

    let format = probe
        .format
        .ok_or_else(|| DubError::InvalidMedia("Probe reported no container format".to_string()))?;

    let seconds: f64 = format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse().ok())
        .ok_or_else(|| DubError::InvalidMedia("Media has no duration".to_string()))?;

    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(DubError::InvalidMedia(format!("Media duration is {}s", seconds)));
    }

    let is_kind = |kind: &str| {
        probe
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some(kind))
    };

    let sample_rate = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .find_map(|s| s.sample_rate.as_deref().and_then(|r| r.parse().ok()));

    Ok(MediaInfo {
        duration: Duration::from_secs_f64(seconds),
        has_video: is_kind("video"),
        has_audio: is_kind("audio"),
        sample_rate,
        format_name: format.format_name,
    })
}

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
}

impl MediaProcessorImpl {
    /// Create a new media processor implementation
    pub fn new(config: MediaConfig) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.ffmpeg_path, &config.ffprobe_path);

        Self {
            config,
            command_builder,
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn probe(&self, input_path: &Path) -> Result<MediaInfo> {
        if !input_path.exists() {
            return Err(DubError::InvalidMedia(format!("{} does not exist", input_path.display())));
        }

        let stdout = self
            .command_builder
            .probe(input_path)
            .execute_capture()
            .await
            .map_err(|e| DubError::InvalidMedia(format!("Cannot probe {}: {}", input_path.display(), e)))?;

        let info = parse_probe_output(&stdout)?;
        debug!(
            "Probed {}: {:.3}s, video={}, audio={}",
            input_path.display(),
            info.duration.as_secs_f64(),
            info.has_video,
            info.has_audio
        );
        Ok(info)
    }

    async fn extract_audio(&self, input_path: &Path, audio_path: &Path, sample_rate: u32) -> Result<()> {
        info!("Extracting audio from {} to {}", input_path.display(), audio_path.display());

        self.command_builder
            .extract_audio(input_path, audio_path, sample_rate)
            .execute()
            .await
            .map_err(|e| DubError::InvalidMedia(e.to_string()))?;

        info!("Audio extraction completed");
        Ok(())
    }

    async fn change_tempo(&self, input_path: &Path, output_path: &Path, ratio: f64) -> Result<()> {
        debug!("Changing tempo of {} by {:.3}x", input_path.display(), ratio);

        self.command_builder
            .change_tempo(input_path, output_path, ratio)
            .execute()
            .await
    }

    async fn encode_mp3(&self, input_path: &Path, output_path: &Path) -> Result<()> {
        info!("Encoding narration {} -> {}", input_path.display(), output_path.display());

        self.command_builder
            .encode_mp3(input_path, output_path, &self.config.narration_bitrate)
            .execute()
            .await
    }

    async fn merge_narration(&self, video_path: &Path, narration_path: &Path, output_path: &Path) -> Result<()> {
        info!(
            "Merging narration {} onto {} -> {}",
            narration_path.display(),
            video_path.display(),
            output_path.display()
        );

        let info = self
            .probe(video_path)
            .await
            .map_err(|e| DubError::Merge(format!("Cannot read source video: {}", e)))?;
        if !info.has_video {
            return Err(DubError::Merge(format!(
                "{} has no video stream to carry the narration",
                video_path.display()
            )));
        }

        self.command_builder
            .merge_narration(
                video_path,
                narration_path,
                output_path,
                &self.config.merge_audio_codec,
                &self.config.merge_extra_options,
            )
            .execute()
            .await
            .map_err(|e| DubError::Merge(e.to_string()))?;

        info!("Merge completed successfully");
        Ok(())
    }

    async fn check_availability(&self) -> Result<()> {
        self.command_builder
            .version_check()
            .execute()
            .await
            .map_err(|e| DubError::Media(format!("Media processor not found: {}", e)))?;

        info!("Media processor is available");
        Ok(())
    }

    async fn get_version_info(&self) -> Result<String> {
        debug!("Getting media processor version information");

        let stdout = self.command_builder.version_check().execute_capture().await?;
        // The first line typically contains the version
        Ok(stdout.lines().next().unwrap_or("Unknown version").to_string())
    }
}
