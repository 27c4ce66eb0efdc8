// Narration synthesis
//
// - Piper: local engine, one process per caption
// - Cloud: OpenAI-compatible speech endpoint
// - Tempo: pitch-preserving compression and decoding of non-WAV clips
// - Synthesizer: fits each synthesized clip to its caption window
//
// Voices are addressed by catalog id ("edresson", "br-yara", ...). The catalog
// knows which engine serves each id; the engine maps the id to its own model
// or voice name.

pub mod cloud;
pub mod piper;
pub mod synthesizer;
pub mod tempo;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

pub use cloud::*;
pub use piper::*;
pub use synthesizer::*;
pub use tempo::*;

use crate::config::VoicesConfig;
use crate::error::{DubError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceEngine {
    Piper,
    Cloud,
}

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    /// Speaking rate multiplier, 1.0 is the engine default
    pub speed: f32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}

/// Main trait for text-to-speech engines
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    fn engine(&self) -> VoiceEngine;

    /// Synthesize `text` with catalog voice `voice_id`, returning encoded audio
    async fn synthesize(&self, text: &str, voice_id: &str, options: &SynthesisOptions) -> Result<Vec<u8>>;

    async fn check_availability(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceEntry {
    pub id: String,
    pub engine: VoiceEngine,
    /// Model path or engine-side voice name
    pub target: String,
}

/// Every voice id the configuration knows about
#[derive(Debug, Clone)]
pub struct VoiceCatalog {
    entries: BTreeMap<String, VoiceEntry>,
}

impl VoiceCatalog {
    pub fn from_config(config: &VoicesConfig) -> Self {
        let piper = config.piper.iter().map(|(id, model)| VoiceEntry {
            id: id.clone(),
            engine: VoiceEngine::Piper,
            target: model.display().to_string(),
        });
        let cloud = config.cloud.iter().map(|(id, name)| VoiceEntry {
            id: id.clone(),
            engine: VoiceEngine::Cloud,
            target: name.clone(),
        });
        let entries = piper.chain(cloud).map(|entry| (entry.id.clone(), entry)).collect();
        Self { entries }
    }

    pub fn resolve(&self, voice_id: &str) -> Result<&VoiceEntry> {
        self.entries
            .get(voice_id)
            .ok_or_else(|| DubError::UnsupportedVoice(voice_id.to_string()))
    }

    pub fn list(&self) -> impl Iterator<Item = &VoiceEntry> {
        self.entries.values()
    }
}

/// Factory for creating voice backends
pub struct VoiceBackendFactory;

impl VoiceBackendFactory {
    pub fn create_backend(engine: VoiceEngine, config: &VoicesConfig) -> Result<Arc<dyn VoiceBackend>> {
        match engine {
            VoiceEngine::Piper => Ok(Arc::new(PiperBackend::new(config))),
            VoiceEngine::Cloud => Ok(Arc::new(CloudVoiceBackend::from_config(config)?)),
        }
    }

    /// Backend serving `voice_id`, or UnsupportedVoice
    pub fn create_for_voice(voice_id: &str, config: &VoicesConfig) -> Result<Arc<dyn VoiceBackend>> {
        let catalog = VoiceCatalog::from_config(config);
        let entry = catalog.resolve(voice_id)?;
        Self::create_backend(entry.engine, config)
    }
}

static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("markup pattern is valid"));

/// Caption text as it should be spoken: markup tags removed, lines joined
pub fn clean_caption_text(text: &str) -> String {
    MARKUP.replace_all(text, "").split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_clean_caption_text() {
        assert_eq!(clean_caption_text("<i>Olá</i>,\nmundo"), "Olá, mundo");
        assert_eq!(clean_caption_text("<font color=\"red\"> </font>"), "");
        assert_eq!(clean_caption_text("  a  b "), "a b");
    }

    #[test]
    fn test_catalog_resolves_both_engines() {
        let catalog = VoiceCatalog::from_config(&Config::default().voices);
        assert_eq!(catalog.resolve("edresson").unwrap().engine, VoiceEngine::Piper);

        let yara = catalog.resolve("br-yara").unwrap();
        assert_eq!(yara.engine, VoiceEngine::Cloud);
        assert_eq!(yara.target, "pt-BR-YaraNeural");

        assert_eq!(catalog.list().count(), 20);
        assert!(matches!(catalog.resolve("klingon"), Err(DubError::UnsupportedVoice(_))));
    }

    #[test]
    fn test_factory_rejects_unknown_voice() {
        let result = VoiceBackendFactory::create_for_voice("nobody", &Config::default().voices);
        assert!(matches!(result, Err(DubError::UnsupportedVoice(_))));
    }
}
