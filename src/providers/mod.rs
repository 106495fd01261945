//! Capability providers
//!
//! Each pipeline stage is backed by an interchangeable provider behind a
//! trait: transcription, intent recognition, reply generation, and speech
//! synthesis. Providers are constructed once at startup through a static
//! registry and shared across sessions, so implementations must be safe for
//! concurrent invocation with no per-call mutable state.

mod openai;

pub use openai::{OpenAiGenerator, OpenAiIntent, OpenAiSynthesizer, OpenAiTranscriber};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::ProvidersConfig;
use crate::dialogue::{Message, ToolCall};
use crate::{Error, Result};

/// Intent name meaning "no special handling, continue to generation"
pub const CONTINUE_INTENT: &str = "continue";

/// Result of intent recognition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f32,
    #[serde(default)]
    pub entities: serde_json::Value,
}

impl Intent {
    /// The neutral intent: proceed to generation
    #[must_use]
    pub fn passthrough() -> Self {
        Self {
            name: CONTINUE_INTENT.to_string(),
            confidence: 1.0,
            entities: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn is_continue(&self) -> bool {
        self.name == CONTINUE_INTENT
    }
}

/// A tool the model may call, advertised to the generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: serde_json::Value,
}

/// Streamed generation output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// Incremental assistant text
    TextDelta(String),
    /// The model finished the round by requesting tool calls
    ToolCalls(Vec<ToolCall>),
    /// The model finished the round with plain text
    Done,
}

/// Boxed stream of generation events
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyEvent>> + Send>>;

/// Boxed stream of synthesized PCM chunks (i16 at the requested sample rate)
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Vec<i16>>> + Send>>;

/// Options for one transcription call
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub language: Option<String>,
}

/// Options for one generation call
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Options for one synthesis call
#[derive(Debug, Clone)]
pub struct SynthesizeOptions {
    /// Sample rate the caller expects PCM at
    pub sample_rate: u32,
    pub voice: Option<String>,
}

/// Speech-to-text capability
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV-framed utterance to text
    async fn transcribe(&self, audio_wav: &[u8], opts: &TranscribeOptions) -> Result<String>;
}

/// Intent recognition capability
#[async_trait]
pub trait IntentRecognizer: Send + Sync {
    async fn recognize(&self, text: &str) -> Result<Intent>;
}

/// Reply generation capability (streamed text deltas and tool calls)
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn generate(&self, messages: &[Message], opts: &GenerateOptions) -> Result<ReplyStream>;
}

/// Text-to-speech capability (streamed PCM chunks)
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, opts: &SynthesizeOptions) -> Result<AudioStream>;
}

/// Intent recognizer that never short-circuits
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIntent;

#[async_trait]
impl IntentRecognizer for NoopIntent {
    async fn recognize(&self, _text: &str) -> Result<Intent> {
        Ok(Intent::passthrough())
    }
}

type TranscriberCtor = fn(&ProvidersConfig) -> Result<Arc<dyn Transcriber>>;
type IntentCtor = fn(&ProvidersConfig) -> Result<Arc<dyn IntentRecognizer>>;
type GeneratorCtor = fn(&ProvidersConfig) -> Result<Arc<dyn ReplyGenerator>>;
type SynthesizerCtor = fn(&ProvidersConfig) -> Result<Arc<dyn SpeechSynthesizer>>;

/// Static registry mapping configuration keys to provider constructors
///
/// Resolution happens once at startup; a configured name with no entry is a
/// fatal configuration error, not a per-turn failure.
#[derive(Default)]
pub struct ProviderRegistry {
    transcribers: HashMap<&'static str, TranscriberCtor>,
    intents: HashMap<&'static str, IntentCtor>,
    generators: HashMap<&'static str, GeneratorCtor>,
    synthesizers: HashMap<&'static str, SynthesizerCtor>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("transcribers", &self.transcribers.keys())
            .field("intents", &self.intents.keys())
            .field("generators", &self.generators.keys())
            .field("synthesizers", &self.synthesizers.keys())
            .finish()
    }
}

impl ProviderRegistry {
    /// Registry with the built-in providers
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register_transcriber("openai", |cfg| {
            Ok(Arc::new(OpenAiTranscriber::new(&cfg.openai)?))
        });
        registry.register_intent("noop", |_cfg| Ok(Arc::new(NoopIntent)));
        registry.register_intent("openai", |cfg| Ok(Arc::new(OpenAiIntent::new(&cfg.openai)?)));
        registry.register_generator("openai", |cfg| {
            Ok(Arc::new(OpenAiGenerator::new(&cfg.openai)?))
        });
        registry.register_synthesizer("openai", |cfg| {
            Ok(Arc::new(OpenAiSynthesizer::new(&cfg.openai)?))
        });
        registry
    }

    pub fn register_transcriber(&mut self, key: &'static str, ctor: TranscriberCtor) {
        self.transcribers.insert(key, ctor);
    }

    pub fn register_intent(&mut self, key: &'static str, ctor: IntentCtor) {
        self.intents.insert(key, ctor);
    }

    pub fn register_generator(&mut self, key: &'static str, ctor: GeneratorCtor) {
        self.generators.insert(key, ctor);
    }

    pub fn register_synthesizer(&mut self, key: &'static str, ctor: SynthesizerCtor) {
        self.synthesizers.insert(key, ctor);
    }

    fn missing(kind: &str, key: &str) -> Error {
        Error::Config(format!("no {kind} provider registered for key \"{key}\""))
    }

    /// Build a transcriber for the configured key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown keys.
    pub fn build_transcriber(&self, config: &ProvidersConfig) -> Result<Arc<dyn Transcriber>> {
        let ctor = self
            .transcribers
            .get(config.transcriber.as_str())
            .ok_or_else(|| Self::missing("transcriber", &config.transcriber))?;
        ctor(config)
    }

    /// Build an intent recognizer for the configured key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown keys.
    pub fn build_intent(&self, config: &ProvidersConfig) -> Result<Arc<dyn IntentRecognizer>> {
        let ctor = self
            .intents
            .get(config.intent.as_str())
            .ok_or_else(|| Self::missing("intent", &config.intent))?;
        ctor(config)
    }

    /// Build a reply generator for the configured key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown keys.
    pub fn build_generator(&self, config: &ProvidersConfig) -> Result<Arc<dyn ReplyGenerator>> {
        let ctor = self
            .generators
            .get(config.generator.as_str())
            .ok_or_else(|| Self::missing("generator", &config.generator))?;
        ctor(config)
    }

    /// Build a speech synthesizer for the configured key
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unknown keys.
    pub fn build_synthesizer(
        &self,
        config: &ProvidersConfig,
    ) -> Result<Arc<dyn SpeechSynthesizer>> {
        let ctor = self
            .synthesizers
            .get(config.synthesizer.as_str())
            .ok_or_else(|| Self::missing("synthesizer", &config.synthesizer))?;
        ctor(config)
    }
}

/// One resolved provider per stage, shared across all sessions
#[derive(Clone)]
pub struct ProviderSet {
    pub transcriber: Arc<dyn Transcriber>,
    pub intent: Arc<dyn IntentRecognizer>,
    pub generator: Arc<dyn ReplyGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet").finish_non_exhaustive()
    }
}

impl ProviderSet {
    /// Resolve all four stages from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any configured key is unknown or a
    /// constructor rejects its settings.
    pub fn from_config(registry: &ProviderRegistry, config: &ProvidersConfig) -> Result<Self> {
        Ok(Self {
            transcriber: registry.build_transcriber(config)?,
            intent: registry.build_intent(config)?,
            generator: registry.build_generator(config)?,
            synthesizer: registry.build_synthesizer(config)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(intent: &str) -> ProvidersConfig {
        ProvidersConfig {
            intent: intent.to_string(),
            ..ProvidersConfig::default()
        }
    }

    #[test]
    fn builtin_registry_resolves_noop_intent() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.build_intent(&config_with("noop")).is_ok());
    }

    #[test]
    fn unknown_key_is_config_error() {
        let registry = ProviderRegistry::builtin();
        let err = registry
            .build_intent(&config_with("mystery"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("mystery"));
    }

    #[tokio::test]
    async fn noop_intent_always_continues() {
        let intent = NoopIntent.recognize("turn on the lights").await.unwrap();
        assert!(intent.is_continue());
        assert!(intent.confidence >= 1.0);
    }

    #[test]
    fn passthrough_intent_is_continue() {
        assert!(Intent::passthrough().is_continue());
    }
}
