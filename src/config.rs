//! Configuration for the Lark gateway
//!
//! Loaded from a TOML file with serde defaults for every field, so a minimal
//! config (or none at all) still boots a working gateway. Secrets come from
//! the environment, never from the file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::audio::{vad::GateConfig, AudioFormat, ListenMode};
use crate::{Error, Result};

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub dialogue: DialogueConfig,
    pub pipeline: PipelineConfig,
    pub providers: ProvidersConfig,
}

/// WebSocket server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8070,
        }
    }
}

/// Audio format and codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (8000/12000/16000/24000/48000)
    pub sample_rate: u32,
    /// Channel count (1 or 2)
    pub channels: u8,
    /// Frame duration in ms (10/20/40/60)
    pub frame_ms: u32,
    /// Discontinuous transmission. Disabled by default: DTX can emit packets
    /// below the minimum byte threshold, which breaks downstream decoders.
    pub dtx: bool,
    /// Minimum transmitted packet size when DTX is enabled
    pub min_packet_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let format = AudioFormat::default();
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            frame_ms: format.frame_ms,
            dtx: false,
            min_packet_bytes: 3,
        }
    }
}

impl AudioConfig {
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            frame_ms: self.frame_ms,
        }
    }
}

/// Voice-activity gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Voice probability at or above which a frame counts as speech
    pub threshold: f32,
    /// Sliding window length in frames
    pub window_frames: usize,
    /// Fraction of voiced frames in the window that opens a turn
    pub activation_ratio: f32,
    /// Trailing silence (ms) that closes a turn in auto mode
    pub silence_timeout_ms: u64,
    /// Default listen mode for new sessions
    pub mode: ListenMode,
    /// RMS level mapping to probability 1.0 in the energy classifier
    pub energy_reference: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self {
            threshold: gate.threshold,
            window_frames: gate.window_frames,
            activation_ratio: gate.activation_ratio,
            silence_timeout_ms: gate.silence_timeout_ms,
            mode: gate.mode,
            energy_reference: 0.06,
        }
    }
}

impl VadConfig {
    #[must_use]
    pub const fn gate_config(&self) -> GateConfig {
        GateConfig {
            threshold: self.threshold,
            window_frames: self.window_frames,
            activation_ratio: self.activation_ratio,
            silence_timeout_ms: self.silence_timeout_ms,
            mode: self.mode,
        }
    }
}

/// Dialogue store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Nominal maximum history length
    pub max_messages: usize,
    /// Never evict system messages
    pub keep_system: bool,
    /// System prompt seeded into every new session dialogue
    pub system_prompt: Option<String>,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            max_messages: 40,
            keep_system: true,
            system_prompt: None,
        }
    }
}

/// Provider pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Intents at or above this confidence may short-circuit generation
    pub intent_threshold: f32,
    /// Maximum tool-call rounds per turn; exceeding it fails the turn
    pub max_tool_depth: u32,
    pub transcribe_timeout_secs: u64,
    pub intent_timeout_secs: u64,
    pub generate_timeout_secs: u64,
    pub synthesize_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intent_threshold: 0.8,
            max_tool_depth: 5,
            transcribe_timeout_secs: 15,
            intent_timeout_secs: 10,
            generate_timeout_secs: 60,
            synthesize_timeout_secs: 30,
        }
    }
}

/// Capability provider selection and backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Registry key for the transcription provider
    pub transcriber: String,
    /// Registry key for the intent provider
    pub intent: String,
    /// Registry key for the reply generator
    pub generator: String,
    /// Registry key for the speech synthesizer
    pub synthesizer: String,
    pub openai: OpenAiConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            transcriber: "openai".to_string(),
            intent: "noop".to_string(),
            generator: "openai".to_string(),
            synthesizer: "openai".to_string(),
            openai: OpenAiConfig::default(),
        }
    }
}

/// OpenAI-compatible backend settings
///
/// The API key is read from `LARK_OPENAI_API_KEY` (falling back to
/// `OPENAI_API_KEY`), never from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub stt_model: String,
    pub llm_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub max_tokens: u32,
    #[serde(skip)]
    pub api_key: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            stt_model: "whisper-1".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            max_tokens: 1024,
            api_key: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file is unreadable and `Error::Toml`
    /// if it does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with env overrides applied
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(key) =
            std::env::var("LARK_OPENAI_API_KEY").or_else(|_| std::env::var("OPENAI_API_KEY"))
        {
            self.providers.openai.api_key = key;
        }
    }

    /// Validate cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for out-of-range values and `Error::Codec`
    /// for unsupported audio formats.
    pub fn validate(&self) -> Result<()> {
        self.audio.format().validate()?;

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(Error::Config(format!(
                "vad.threshold out of range: {}",
                self.vad.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.vad.activation_ratio) {
            return Err(Error::Config(format!(
                "vad.activation_ratio out of range: {}",
                self.vad.activation_ratio
            )));
        }
        if self.vad.window_frames == 0 {
            return Err(Error::Config("vad.window_frames must be > 0".to_string()));
        }
        if self.dialogue.max_messages == 0 {
            return Err(Error::Config(
                "dialogue.max_messages must be > 0".to_string(),
            ));
        }
        if self.pipeline.max_tool_depth == 0 {
            return Err(Error::Config(
                "pipeline.max_tool_depth must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.vad.silence_timeout_ms, 700);
        assert!(!config.audio.dtx);
    }

    #[test]
    fn partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [audio]
            sample_rate = 24000
            frame_ms = 20

            [vad]
            mode = "manual"

            [providers]
            intent = "openai"
            "#,
        )
        .unwrap();
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.audio.frame_ms, 20);
        assert_eq!(config.vad.mode, ListenMode::Manual);
        assert_eq!(config.providers.intent, "openai");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_sample_rate_rejected() {
        let config: Config = toml::from_str("[audio]\nsample_rate = 44100\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_threshold_rejected() {
        let config: Config = toml::from_str("[vad]\nthreshold = 1.5\n").unwrap();
        assert!(config.validate().is_err());
    }
}
