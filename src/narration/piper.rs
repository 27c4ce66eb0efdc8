use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{SynthesisOptions, VoiceBackend, VoiceEngine};
use crate::config::VoicesConfig;
use crate::error::{DubError, Result};

/// Local Piper engine, run as a child process per request.
///
/// Text goes in on stdin; the WAV is written to a temporary file that is
/// removed once its bytes have been read.
pub struct PiperBackend {
    binary: String,
    models_dir: PathBuf,
    models: BTreeMap<String, PathBuf>,
}

impl PiperBackend {
    pub fn new(config: &VoicesConfig) -> Self {
        Self {
            binary: config.piper_binary.clone(),
            models_dir: config.piper_models_dir.clone(),
            models: config.piper.clone(),
        }
    }

    pub fn model_path(&self, voice_id: &str) -> Result<PathBuf> {
        let model = self
            .models
            .get(voice_id)
            .ok_or_else(|| DubError::UnsupportedVoice(voice_id.to_string()))?;
        if model.is_absolute() {
            Ok(model.clone())
        } else {
            Ok(self.models_dir.join(model))
        }
    }
}

#[async_trait]
impl VoiceBackend for PiperBackend {
    fn engine(&self) -> VoiceEngine {
        VoiceEngine::Piper
    }

    async fn synthesize(&self, text: &str, voice_id: &str, options: &SynthesisOptions) -> Result<Vec<u8>> {
        let model = self.model_path(voice_id)?;
        if !model.exists() {
            return Err(DubError::synthesis(
                format!("Piper model for '{}' not found at {}", voice_id, model.display()),
                false,
            ));
        }

        let output = tempfile::Builder::new()
            .prefix("piper-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| DubError::synthesis(format!("Cannot create output file: {}", e), true))?;

        debug!("Running piper with {} ({} chars)", model.display(), text.chars().count());
        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&model)
            .arg("--output_file")
            .arg(output.path())
            .arg("--length_scale")
            .arg(format!("{:.3}", 1.0 / options.speed.max(0.1)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DubError::synthesis(format!("Failed to start {}: {}", self.binary, e), false))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| DubError::synthesis(format!("Failed to send text to piper: {}", e), true))?;
            // Closing stdin tells piper the input is complete
        }

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| DubError::synthesis(format!("Piper did not finish: {}", e), true))?;
        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(DubError::synthesis(format!("Piper failed: {}", stderr.trim()), true));
        }

        let bytes = tokio::fs::read(output.path()).await?;
        if bytes.is_empty() {
            return Err(DubError::synthesis("Piper produced no audio", true));
        }
        Ok(bytes)
    }

    async fn check_availability(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .arg("--help")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DubError::synthesis(format!("{} not found: {}", self.binary, e), false))?;

        if output.status.success() {
            info!("Piper is available");
            Ok(())
        } else {
            Err(DubError::synthesis(
                format!("{} --help exited with {}", self.binary, output.status),
                false,
            ))
        }
    }
}
