use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DubError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub media: MediaConfig,
    pub chunker: ChunkerConfig,
    pub transcriber: TranscriberConfig,
    pub narration: NarrationConfig,
    pub voices: VoicesConfig,
    pub retry: RetryConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to ffprobe binary
    pub ffprobe_path: String,
    /// Sample rate of the mono track sent to transcription
    pub extract_sample_rate: u32,
    /// Codec used for the narration track inside the dubbed container
    pub merge_audio_codec: String,
    /// Additional options appended to the merge command
    /// Common options: ["-movflags", "+faststart"]
    pub merge_extra_options: Vec<String>,
    /// Bitrate for the exported narration file (mp3 output only)
    pub narration_bitrate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum duration of one chunk in seconds
    pub max_chunk_secs: f64,
    /// Upload limit of the transcription service in megabytes
    pub max_upload_mb: u64,
    /// A frame is silent when its energy is this many dB below the loudest frame
    pub silence_threshold_db: f64,
    /// Minimum length of a silence run that may host a split point
    pub min_silence_secs: f64,
    /// How far before the chunk boundary to look for silence
    pub lookback_secs: f64,
    /// Analysis frame length in milliseconds
    pub frame_ms: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriberConfig {
    /// OpenAI-compatible transcription endpoint
    pub endpoint: String,
    /// Model name sent with each request
    pub model: String,
    /// Source language hint, None for auto-detection
    pub language: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// HTTP timeout for one request in seconds
    pub request_timeout_secs: u64,
    /// Wall-clock budget for one chunk including retries
    pub chunk_deadline_secs: u64,
    /// Maximum gap between captions across a hard cut that still merges them
    pub boundary_epsilon_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrationConfig {
    /// Voice used when the job does not name one
    pub default_voice: String,
    /// Sample rate of the assembled narration track
    pub sample_rate: u32,
    /// Accepted difference between narration and caption window
    pub tolerance_ms: u64,
    /// Highest speed-up applied before truncating
    pub max_compression_ratio: f64,
    /// Fade applied when speech has to be cut
    pub fade_out_ms: u64,
    /// Minimum silence kept before the next caption starts
    pub guard_gap_ms: u64,
    /// Output container for the narration artifact
    pub output_format: NarrationFormat,
    /// Upper bound for direct text-to-speech requests
    pub max_text_chars: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NarrationFormat {
    Mp3,
    Wav,
}

impl NarrationFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            NarrationFormat::Mp3 => "mp3",
            NarrationFormat::Wav => "wav",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicesConfig {
    /// Path to the piper binary
    pub piper_binary: String,
    /// Directory that relative piper model paths are resolved against
    pub piper_models_dir: PathBuf,
    /// Local voices: voice id -> piper model file
    pub piper: BTreeMap<String, PathBuf>,
    /// OpenAI-compatible speech endpoint for cloud voices
    pub cloud_endpoint: String,
    /// Model name for cloud synthesis
    pub cloud_model: String,
    /// Environment variable holding the cloud API key
    pub cloud_api_key_env: String,
    /// Cloud voices: voice id -> engine voice name
    pub cloud: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff growth per retry
    pub backoff_multiplier: f64,
    /// Timeout for a single attempt in seconds
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parallel transcription/synthesis units
    pub workers: usize,
    /// Scratch space and logs
    pub work_dir: PathBuf,
    /// Root of the local artifact store
    pub storage_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let piper = [
            ("cadu", "pt_BR-cadu-synthesis-medium/model.onnx"),
            ("edresson", "pt_BR-edresson-low/model.onnx"),
            ("faber", "pt_BR-faber-medium/model.onnx"),
            ("jeff", "pt_BR-jeff-medium/model.onnx"),
        ]
        .into_iter()
        .map(|(id, model)| (id.to_string(), PathBuf::from(model)))
        .collect();

        let cloud = [
            "Antonio", "Brenda", "Donato", "Elza", "Fabio", "Francisca", "Giovanna", "Humberto",
            "Julio", "Leila", "Leticia", "Manuela", "Nicolau", "Thalita", "Valerio", "Yara",
        ]
        .into_iter()
        .map(|name| {
            (
                format!("br-{}", name.to_lowercase()),
                format!("pt-BR-{}Neural", name),
            )
        })
        .collect();

        Self {
            media: MediaConfig {
                ffmpeg_path: "ffmpeg".to_string(),
                ffprobe_path: "ffprobe".to_string(),
                extract_sample_rate: 16000,
                merge_audio_codec: "aac".to_string(),
                merge_extra_options: vec![
                    // "-movflags".to_string(), "+faststart".to_string(),
                ],
                narration_bitrate: "128k".to_string(),
            },
            chunker: ChunkerConfig {
                max_chunk_secs: 120.0,
                max_upload_mb: 25,
                silence_threshold_db: 40.0,
                min_silence_secs: 0.3,
                lookback_secs: 10.0,
                frame_ms: 20,
            },
            transcriber: TranscriberConfig {
                endpoint: "https://api.groq.com/openai/v1/audio/transcriptions".to_string(),
                model: "whisper-large-v3".to_string(),
                language: Some("pt".to_string()),
                api_key_env: "GROQ_API_KEY".to_string(),
                request_timeout_secs: 120,
                chunk_deadline_secs: 600,
                boundary_epsilon_secs: 0.5,
            },
            narration: NarrationConfig {
                default_voice: "edresson".to_string(),
                sample_rate: 24000,
                tolerance_ms: 50,
                max_compression_ratio: 1.5,
                fade_out_ms: 80,
                guard_gap_ms: 40,
                output_format: NarrationFormat::Mp3,
                max_text_chars: 3000,
            },
            voices: VoicesConfig {
                piper_binary: "piper".to_string(),
                piper_models_dir: PathBuf::from("tts_models"),
                piper,
                cloud_endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
                cloud_model: "tts-1".to_string(),
                cloud_api_key_env: "TTS_API_KEY".to_string(),
                cloud,
            },
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 500,
                backoff_multiplier: 2.0,
                attempt_timeout_secs: 120,
            },
            pipeline: PipelineConfig {
                workers: 4,
                work_dir: PathBuf::from(".dubline"),
                storage_dir: PathBuf::from(".dubline/files"),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DubError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| DubError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DubError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(DubError::Config("pipeline.workers must be at least 1".to_string()));
        }
        if !(self.chunker.max_chunk_secs > 0.0) {
            return Err(DubError::Config("chunker.max_chunk_secs must be positive".to_string()));
        }
        if self.chunker.frame_ms == 0 {
            return Err(DubError::Config("chunker.frame_ms must be positive".to_string()));
        }
        if self.narration.max_compression_ratio < 1.0 {
            return Err(DubError::Config(
                "narration.max_compression_ratio must be at least 1.0".to_string(),
            ));
        }
        if self.narration.sample_rate == 0 || self.media.extract_sample_rate == 0 {
            return Err(DubError::Config("sample rates must be positive".to_string()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(DubError::Config("retry.backoff_multiplier must be at least 1.0".to_string()));
        }
        Ok(())
    }
}

impl RetryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl NarrationConfig {
    pub fn tolerance(&self) -> Duration {
        Duration::from_millis(self.tolerance_ms)
    }

    pub fn fade_out(&self) -> Duration {
        Duration::from_millis(self.fade_out_ms)
    }

    pub fn guard_gap(&self) -> Duration {
        Duration::from_millis(self.guard_gap_ms)
    }
}
