use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{SynthesisOptions, VoiceBackend, VoiceEngine};
use crate::config::VoicesConfig;
use crate::error::{is_retryable_status, DubError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    speed: f32,
}

/// OpenAI-compatible `/audio/speech` endpoint
pub struct CloudVoiceBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    voices: BTreeMap<String, String>,
}

impl CloudVoiceBackend {
    pub fn new(config: &VoicesConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DubError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.cloud_endpoint.trim().to_string(),
            model: config.cloud_model.clone(),
            api_key,
            voices: config.cloud.clone(),
        })
    }

    pub fn from_config(config: &VoicesConfig) -> Result<Self> {
        let api_key = std::env::var(&config.cloud_api_key_env).ok().filter(|k| !k.trim().is_empty());
        Self::new(config, api_key)
    }

    pub fn voice_name(&self, voice_id: &str) -> Result<&str> {
        self.voices
            .get(voice_id)
            .map(String::as_str)
            .ok_or_else(|| DubError::UnsupportedVoice(voice_id.to_string()))
    }
}

#[async_trait]
impl VoiceBackend for CloudVoiceBackend {
    fn engine(&self) -> VoiceEngine {
        VoiceEngine::Cloud
    }

    async fn synthesize(&self, text: &str, voice_id: &str, options: &SynthesisOptions) -> Result<Vec<u8>> {
        let voice = self.voice_name(voice_id)?;
        debug!("Requesting {} chars of speech as {}", text.chars().count(), voice);

        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: "wav",
            speed: options.speed,
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            DubError::synthesis(format!("Speech request failed: {}", e), e.is_timeout() || e.is_connect())
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(DubError::synthesis(
                format!("Speech service returned {}: {}", status, error_text.trim()),
                is_retryable_status(status),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DubError::synthesis(format!("Failed to read speech audio: {}", e), true))?;
        if bytes.is_empty() {
            return Err(DubError::synthesis("Speech service returned no audio", true));
        }
        Ok(bytes.to_vec())
    }

    async fn check_availability(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(DubError::Config("voices.cloud_endpoint is empty".to_string()));
        }
        info!("Cloud voices configured at {}", self.endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_request_body() {
        let body = SpeechRequest {
            model: "tts-1",
            input: "Olá",
            voice: "pt-BR-YaraNeural",
            response_format: "wav",
            speed: 1.0,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["voice"], "pt-BR-YaraNeural");
        assert_eq!(json["response_format"], "wav");
    }

    #[tokio::test]
    async fn test_unreachable_service_is_retryable() {
        let mut voices = Config::default().voices;
        voices.cloud_endpoint = "http://127.0.0.1:9/v1/audio/speech".to_string();
        let backend = CloudVoiceBackend::new(&voices, None).unwrap();
        assert_eq!(backend.voice_name("br-elza").unwrap(), "pt-BR-ElzaNeural");

        let err = backend
            .synthesize("olá", "br-elza", &SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }
}
