//! OpenAI-compatible capability providers
//!
//! Backs all four pipeline stages against any OpenAI-compatible API surface:
//! multipart `/audio/transcriptions`, SSE-streamed `/chat/completions` (with
//! incremental tool-call assembly), `/audio/speech` with raw PCM output, and
//! an LLM-backed intent classifier that demands strict JSON.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{
    AudioStream, GenerateOptions, Intent, IntentRecognizer, ReplyEvent, ReplyGenerator,
    ReplyStream, SpeechSynthesizer, SynthesizeOptions, ToolDefinition, TranscribeOptions,
    Transcriber,
};
use crate::config::OpenAiConfig;
use crate::dialogue::{Message, Role, ToolCall};
use crate::{Error, Result};

/// OpenAI PCM output is fixed at 24 kHz mono
const TTS_PCM_RATE: u32 = 24_000;

/// Shared constructor plumbing for the OpenAI-backed providers
#[derive(Clone)]
struct Backend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl Backend {
    fn new(config: &OpenAiConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required (set LARK_OPENAI_API_KEY)".to_string(),
            ));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }
}

/// Response from the transcription endpoint
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Whisper-style transcription provider
pub struct OpenAiTranscriber {
    backend: Backend,
    model: String,
}

impl OpenAiTranscriber {
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is missing.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::new(config)?,
            model: config.stt_model.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio_wav: &[u8], opts: &TranscribeOptions) -> Result<String> {
        tracing::debug!(audio_bytes = audio_wav.len(), "starting transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio_wav.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Capability(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(language) = &opts.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .backend
            .client
            .post(format!("{}/audio/transcriptions", self.backend.base_url))
            .header("Authorization", format!("Bearer {}", self.backend.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Capability(format!("transcription request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Capability(format!(
                "transcription API error {status}: {body}"
            )));
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Capability(format!("transcription response: {e}")))?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

/// Instruction for the JSON-only intent classifier
const INTENT_PROMPT: &str = "You classify a single user utterance for a voice assistant. \
Respond with exactly one JSON object, no prose: \
{\"intent\": \"<name>\", \"confidence\": <0.0-1.0>, \"entities\": {}}. \
Use intent \"continue\" when no special action applies.";

/// LLM-backed intent recognizer returning strict JSON
pub struct OpenAiIntent {
    backend: Backend,
    model: String,
}

impl OpenAiIntent {
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is missing.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::new(config)?,
            model: config.llm_model.clone(),
        })
    }
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(serde::Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl IntentRecognizer for OpenAiIntent {
    async fn recognize(&self, text: &str) -> Result<Intent> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": INTENT_PROMPT },
                { "role": "user", "content": text },
            ],
            "temperature": 0,
            "max_tokens": 128,
        });

        let response = self
            .backend
            .client
            .post(format!("{}/chat/completions", self.backend.base_url))
            .header("Authorization", format!("Bearer {}", self.backend.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Capability(format!("intent request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Capability(format!(
                "intent API error {status}: {body}"
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Capability(format!("intent response: {e}")))?;

        let content = result
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();

        // A model that fails to produce JSON must not kill the turn
        match serde_json::from_str::<IntentJson>(content) {
            Ok(parsed) => Ok(Intent {
                name: parsed.intent,
                confidence: parsed.confidence,
                entities: parsed.entities,
            }),
            Err(e) => {
                tracing::warn!(error = %e, content, "unparsable intent JSON, continuing");
                Ok(Intent::passthrough())
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct IntentJson {
    intent: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    entities: serde_json::Value,
}

/// Streaming chat-completions reply generator
pub struct OpenAiGenerator {
    backend: Backend,
    model: String,
    max_tokens: u32,
}

impl OpenAiGenerator {
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is missing.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::new(config)?,
            model: config.llm_model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

/// Wire shape of one SSE chunk from `/chat/completions`
#[derive(serde::Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(serde::Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(serde::Deserialize)]
struct StreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(serde::Deserialize, Default)]
#[serde(default)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// In-progress tool call being assembled from streaming deltas
#[derive(Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Serialize dialogue history into the chat-completions wire format
fn wire_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let mut value = serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content.clone().map_or(serde_json::Value::Null, serde_json::Value::String),
            });
            if let Some(tool_calls) = &m.tool_calls {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": { "name": tc.name, "arguments": tc.arguments },
                        })
                    })
                    .collect();
            }
            if let Some(tool_call_id) = &m.tool_call_id {
                value["tool_call_id"] = serde_json::Value::String(tool_call_id.clone());
            }
            // Speaker labels ride inline; role stays `user`
            if let (Role::User, Some(speaker), Some(content)) = (m.role, &m.speaker, &m.content) {
                value["content"] = serde_json::Value::String(format!("{speaker}: {content}"));
            }
            value
        })
        .collect()
}

fn wire_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                },
            })
        })
        .collect()
}

#[async_trait]
impl ReplyGenerator for OpenAiGenerator {
    async fn generate(&self, messages: &[Message], opts: &GenerateOptions) -> Result<ReplyStream> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": wire_messages(messages),
            "stream": true,
            "max_tokens": self.max_tokens,
        });
        if let Some(tools) = &opts.tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::Value::Array(wire_tools(tools));
            }
        }

        let response = self
            .backend
            .client
            .post(format!("{}/chat/completions", self.backend.base_url))
            .header("Authorization", format!("Bearer {}", self.backend.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Capability(format!("generate request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Capability(format!(
                "generate API error {status}: {body}"
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<ReplyEvent>>(32);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut line_buffer = String::new();
            let mut pending: Vec<PendingToolCall> = Vec::new();
            let mut finish_reason: Option<String> = None;

            'outer: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Capability(format!("generate stream: {e}"))))
                            .await;
                        return;
                    }
                };
                line_buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim().to_string();
                    line_buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                        tracing::trace!(line = %data, "skipping unparsable SSE chunk");
                        continue;
                    };
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };

                    if let Some(content) = choice.delta.content {
                        if !content.is_empty()
                            && tx.send(Ok(ReplyEvent::TextDelta(content))).await.is_err()
                        {
                            return;
                        }
                    }
                    if let Some(tool_calls) = choice.delta.tool_calls {
                        for tc in tool_calls {
                            if tc.index >= pending.len() {
                                pending.resize_with(tc.index + 1, PendingToolCall::default);
                            }
                            if let Some(id) = tc.id {
                                pending[tc.index].id = id;
                            }
                            if let Some(function) = tc.function {
                                if let Some(name) = function.name {
                                    pending[tc.index].name = name;
                                }
                                if let Some(arguments) = function.arguments {
                                    pending[tc.index].arguments.push_str(&arguments);
                                }
                            }
                        }
                    }
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = Some(reason);
                    }
                }
            }

            let event = if finish_reason.as_deref() == Some("tool_calls") && !pending.is_empty() {
                ReplyEvent::ToolCalls(
                    pending
                        .into_iter()
                        .map(|p| ToolCall {
                            id: p.id,
                            name: p.name,
                            arguments: p.arguments,
                        })
                        .collect(),
                )
            } else {
                ReplyEvent::Done
            };
            let _ = tx.send(Ok(event)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// PCM-streaming speech synthesizer
pub struct OpenAiSynthesizer {
    backend: Backend,
    model: String,
    voice: String,
}

impl OpenAiSynthesizer {
    /// # Errors
    ///
    /// Returns `Error::Config` if the API key is missing.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            backend: Backend::new(config)?,
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
        })
    }
}

/// Linear-interpolation resample between the provider's fixed PCM rate and
/// the session rate. Adequate for speech; callers wanting higher fidelity
/// should negotiate the provider's native rate.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position as usize;
            let fraction = position - index as f64;
            let a = f64::from(samples[index.min(samples.len() - 1)]);
            let b = f64::from(samples[(index + 1).min(samples.len() - 1)]);
            (a + (b - a) * fraction) as i16
        })
        .collect()
}

/// Interpret little-endian bytes as i16 PCM, carrying any odd trailing byte
fn bytes_to_pcm(bytes: &[u8], carry: &mut Vec<u8>) -> Vec<i16> {
    carry.extend_from_slice(bytes);
    let usable = carry.len() - (carry.len() % 2);
    let pcm: Vec<i16> = carry[..usable]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    carry.drain(..usable);
    pcm
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, opts: &SynthesizeOptions) -> Result<AudioStream> {
        let voice = opts.voice.clone().unwrap_or_else(|| self.voice.clone());
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        });

        let response = self
            .backend
            .client
            .post(format!("{}/audio/speech", self.backend.base_url))
            .header("Authorization", format!("Bearer {}", self.backend.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Capability(format!("synthesis request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Capability(format!(
                "synthesis API error {status}: {body}"
            )));
        }

        let target_rate = opts.sample_rate;
        let (tx, rx) = mpsc::channel::<Result<Vec<i16>>>(32);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut carry = Vec::new();
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        let pcm = bytes_to_pcm(&bytes, &mut carry);
                        if pcm.is_empty() {
                            continue;
                        }
                        let pcm = resample(&pcm, TTS_PCM_RATE, target_rate);
                        if tx.send(Ok(pcm)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Capability(format!("synthesis stream: {e}"))))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_carry_roles_and_tool_ids() {
        let messages = vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::tool("call_1", "42"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn wire_messages_inline_speaker_label() {
        let messages = vec![Message::user_with_speaker("hello", "Alice")];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["content"], "Alice: hello");
    }

    #[test]
    fn intent_json_parses_with_defaults() {
        let parsed: IntentJson = serde_json::from_str(r#"{"intent":"weather"}"#).unwrap();
        assert_eq!(parsed.intent, "weather");
        assert!(parsed.confidence.abs() < f32::EPSILON);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1i16, 2, 3];
        assert_eq!(resample(&samples, 24_000, 24_000), samples);
    }

    #[test]
    fn resample_halves_sample_count() {
        let samples: Vec<i16> = (0..100).collect();
        let out = resample(&samples, 24_000, 12_000);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn bytes_to_pcm_carries_odd_byte() {
        let mut carry = Vec::new();
        let pcm = bytes_to_pcm(&[0x01, 0x00, 0x02], &mut carry);
        assert_eq!(pcm, vec![1]);
        assert_eq!(carry, vec![0x02]);

        let pcm = bytes_to_pcm(&[0x00], &mut carry);
        assert_eq!(pcm, vec![2]);
        assert!(carry.is_empty());
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let config = OpenAiConfig::default();
        assert!(matches!(
            OpenAiTranscriber::new(&config),
            Err(Error::Config(_))
        ));
    }
}
