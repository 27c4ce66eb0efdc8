// OpenAI-compatible speech-to-text over HTTP
//
// The chunk is uploaded as multipart form data and the service is asked for
// `verbose_json` with segment-level timestamps. Status codes decide whether a
// failure is worth retrying: rate limits, request timeouts and server errors
// are; authentication and validation failures are not.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{RawTranscript, TranscriptSegment, Transcriber};
use crate::config::TranscriberConfig;
use crate::error::{is_retryable_status, DubError, Result};

/// `verbose_json` response, only the fields we use
#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}

/// Turn a `verbose_json` body into chunk-relative segments
pub fn parse_verbose_json(body: &str) -> Result<RawTranscript> {
    let response: VerboseTranscription = serde_json::from_str(body)
        .map_err(|e| DubError::transcription(format!("Unexpected transcription response: {}", e), false))?;

    let segments = response
        .segments
        .into_iter()
        .filter_map(|s| match (seconds(s.start), seconds(s.end)) {
            (Some(start), Some(end)) => Some(TranscriptSegment {
                start,
                end,
                text: s.text.trim().to_string(),
            }),
            _ => {
                warn!("Dropping segment with unusable timestamps {} --> {}", s.start, s.end);
                None
            }
        })
        .collect();

    Ok(RawTranscript {
        segments,
        language: response.language,
    })
}

/// Negative offsets clamp to zero; NaN and out-of-range values are rejected
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value.max(0.0)).ok()
}

pub struct RemoteTranscriber {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    language: Option<String>,
    api_key: Option<String>,
}

impl RemoteTranscriber {
    pub fn new(config: &TranscriberConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DubError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().to_string(),
            model: config.model.clone(),
            language: config.language.clone(),
            api_key,
        })
    }

    /// Build from configuration; the API key comes from `api_key_env`
    pub fn from_config(config: &TranscriberConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            debug!("{} is not set, sending transcription requests without a key", config.api_key_env);
        }
        Self::new(config, api_key)
    }

    fn form(&self, audio_wav: &[u8]) -> Result<Form> {
        let part = Part::bytes(audio_wav.to_vec())
            .file_name("chunk.wav")
            .mime_str("audio/wav")
            .map_err(|e| DubError::transcription(format!("Cannot build upload: {}", e), false))?;

        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(&self, audio_wav: &[u8]) -> Result<RawTranscript> {
        debug!("Uploading {} bytes to {}", audio_wav.len(), self.endpoint);

        let mut request = self.client.post(&self.endpoint).multipart(self.form(audio_wav)?);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            DubError::transcription(format!("Request failed: {}", e), e.is_timeout() || e.is_connect())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::transcription(
                format!("Transcription service returned {}: {}", status, body.trim()),
                is_retryable_status(status),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| DubError::transcription(format!("Failed to read response: {}", e), true))?;
        let transcript = parse_verbose_json(&body)?;
        debug!("Received {} segments", transcript.segments.len());
        Ok(transcript)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verbose_json() {
        let body = r#"{
            "task": "transcribe",
            "language": "portuguese",
            "duration": 12.5,
            "text": "Olá. Tudo bem?",
            "segments": [
                {"id": 0, "seek": 0, "start": 0.0, "end": 1.52, "text": " Olá.", "avg_logprob": -0.2},
                {"id": 1, "seek": 0, "start": 1.52, "end": 3.0, "text": " Tudo bem?"}
            ]
        }"#;
        let transcript = parse_verbose_json(body).unwrap();
        assert_eq!(transcript.language.as_deref(), Some("portuguese"));
        assert_eq!(transcript.segments.len(), 2);
        assert_eq!(transcript.segments[0].text, "Olá.");
        assert_eq!(transcript.segments[1].start, Duration::from_secs_f64(1.52));
    }

    #[test]
    fn test_out_of_range_timestamps_are_dropped() {
        let body = r#"{"segments": [
            {"start": 1e20, "end": 2e20, "text": "far away"},
            {"start": -0.2, "end": 1.0, "text": "kept"}
        ]}"#;
        let transcript = parse_verbose_json(body).unwrap();
        assert_eq!(transcript.segments.len(), 1);
        assert_eq!(transcript.segments[0].text, "kept");
        assert_eq!(transcript.segments[0].start, Duration::ZERO);
    }

    #[test]
    fn test_response_without_segments_is_empty() {
        let transcript = parse_verbose_json(r#"{"text": ""}"#).unwrap();
        assert!(transcript.segments.is_empty());
    }

    #[test]
    fn test_garbage_response_is_terminal() {
        let err = parse_verbose_json("<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, DubError::Transcription { retryable: false, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_retryable() {
        let config = TranscriberConfig {
            endpoint: "http://127.0.0.1:9/v1/audio/transcriptions".to_string(),
            request_timeout_secs: 5,
            ..crate::config::Config::default().transcriber
        };
        let transcriber = RemoteTranscriber::new(&config, None).unwrap();
        let err = transcriber.transcribe(b"RIFF").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {}", err);
    }
}
