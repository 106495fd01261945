//! Shared test utilities
//!
//! Mock providers and signal generators so pipeline and gate tests run
//! without network access or audio hardware.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tokio::sync::{Mutex, Notify};

use lark_gateway::Error;

use lark_gateway::dialogue::{Message, ToolCall};
use lark_gateway::providers::{
    AudioStream, GenerateOptions, Intent, IntentRecognizer, NoopIntent, ProviderSet, ReplyEvent,
    ReplyGenerator, ReplyStream, SpeechSynthesizer, SynthesizeOptions, Transcriber,
    TranscribeOptions,
};
use lark_gateway::Result;

/// Generate i16 sine-wave samples
#[must_use]
pub fn sine_samples(frequency: f32, sample_rate: u32, count: usize, amplitude: f32) -> Vec<i16> {
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let value = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
            (value * f32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Transcriber that returns a fixed string
pub struct FixedTranscriber {
    pub text: String,
}

impl FixedTranscriber {
    #[must_use]
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
        }
    }
}

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _audio_wav: &[u8], _opts: &TranscribeOptions) -> Result<String> {
        Ok(self.text.clone())
    }
}

/// Intent recognizer that returns a fixed classification
pub struct FixedIntent {
    pub intent: Intent,
}

#[async_trait]
impl IntentRecognizer for FixedIntent {
    async fn recognize(&self, _text: &str) -> Result<Intent> {
        Ok(self.intent.clone())
    }
}

/// Generator that replays scripted rounds of [`ReplyEvent`]s
///
/// Each call to `generate` pops the next round. Records the message
/// histories it was called with, so tests can assert on wire ordering.
pub struct ScriptedGenerator {
    rounds: Mutex<Vec<Vec<ReplyEvent>>>,
    pub histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedGenerator {
    #[must_use]
    pub fn new(rounds: Vec<Vec<ReplyEvent>>) -> Self {
        Self {
            rounds: Mutex::new(rounds),
            histories: Mutex::new(Vec::new()),
        }
    }

    /// Single round streaming the given deltas then finishing
    #[must_use]
    pub fn text_reply(deltas: &[&str]) -> Self {
        let mut events: Vec<ReplyEvent> = deltas
            .iter()
            .map(|d| ReplyEvent::TextDelta((*d).to_string()))
            .collect();
        events.push(ReplyEvent::Done);
        Self::new(vec![events])
    }

    /// First round requests the given tool calls, second round streams text
    #[must_use]
    pub fn tool_then_text(calls: Vec<ToolCall>, reply: &str) -> Self {
        Self::new(vec![
            vec![ReplyEvent::ToolCalls(calls)],
            vec![
                ReplyEvent::TextDelta(reply.to_string()),
                ReplyEvent::Done,
            ],
        ])
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    async fn generate(&self, messages: &[Message], _opts: &GenerateOptions) -> Result<ReplyStream> {
        self.histories.lock().await.push(messages.to_vec());
        let mut rounds = self.rounds.lock().await;
        let events = if rounds.is_empty() {
            vec![ReplyEvent::Done]
        } else {
            rounds.remove(0)
        };
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
    }
}

/// Synthesizer that emits fixed-size chunks of silence
pub struct SilenceSynthesizer {
    pub chunks: usize,
    pub chunk_samples: usize,
}

#[async_trait]
impl SpeechSynthesizer for SilenceSynthesizer {
    async fn synthesize(&self, _text: &str, _opts: &SynthesizeOptions) -> Result<AudioStream> {
        let chunk = vec![0i16; self.chunk_samples];
        let chunks: Vec<Result<Vec<i16>>> = (0..self.chunks).map(|_| Ok(chunk.clone())).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Synthesizer whose stream yields one chunk, then fails
pub struct FailingSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FailingSynthesizer {
    async fn synthesize(&self, _text: &str, _opts: &SynthesizeOptions) -> Result<AudioStream> {
        let events: Vec<Result<Vec<i16>>> = vec![
            Ok(vec![0i16; 960]),
            Err(Error::Capability("speech backend dropped the stream".into())),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Synthesizer that yields one chunk, then blocks until the gate is notified
///
/// Lets a test hold a run inside the synthesize stage at a known point.
pub struct GatedSynthesizer {
    pub gate: Arc<Notify>,
    pub chunk_samples: usize,
}

#[async_trait]
impl SpeechSynthesizer for GatedSynthesizer {
    async fn synthesize(&self, _text: &str, _opts: &SynthesizeOptions) -> Result<AudioStream> {
        let gate = Arc::clone(&self.gate);
        let first = vec![0i16; self.chunk_samples];
        let second = first.clone();
        let tail = stream::once(async move {
            gate.notified().await;
            Ok::<_, Error>(second)
        });
        Ok(Box::pin(stream::iter(vec![Ok(first)]).chain(tail)))
    }
}

/// Synthesizer that records the sample rate each request asked for
pub struct RecordingSynthesizer {
    pub rates: Mutex<Vec<u32>>,
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, _text: &str, opts: &SynthesizeOptions) -> Result<AudioStream> {
        self.rates.lock().await.push(opts.sample_rate);
        Ok(Box::pin(stream::iter(vec![Ok(vec![0i16; 480])])))
    }
}

/// Provider set with quiet defaults, suitable for overriding per test
#[must_use]
pub fn mock_providers(generator: Arc<ScriptedGenerator>) -> ProviderSet {
    ProviderSet {
        transcriber: Arc::new(FixedTranscriber::new("hello there")),
        intent: Arc::new(NoopIntent),
        generator,
        synthesizer: Arc::new(SilenceSynthesizer {
            chunks: 2,
            chunk_samples: 960,
        }),
    }
}
