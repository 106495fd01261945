//! Provider pipeline
//!
//! Runs one dialogue turn through the capability stages: transcribe →
//! recognize-intent → generate-reply (with tool-call rounds) → synthesize.
//! Output streams back as [`PipelineEvent`]s; dialogue mutations are emitted
//! as `Commit` events so the session task is the only writer of the store.
//! Cancellation is cooperative: the run's flag is checked at every stage
//! boundary and between streamed chunks, so a barge-in stops output quickly
//! without retracting anything already sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Future, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::config::PipelineConfig;
use crate::dialogue::Message;
use crate::providers::{
    GenerateOptions, Intent, ProviderSet, ReplyEvent, SynthesizeOptions, TranscribeOptions,
};
use crate::tools::ToolExecutor;
use crate::{Error, Result};

/// Pipeline stage identity, used in logs and terminal error events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcribe,
    Intent,
    Generate,
    Synthesize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transcribe => "transcribe",
            Self::Intent => "intent",
            Self::Generate => "generate",
            Self::Synthesize => "synthesize",
        };
        f.write_str(name)
    }
}

/// Input that triggers a turn
#[derive(Debug, Clone)]
pub enum TurnInput {
    /// Buffered utterance audio, WAV-framed, ready for transcription
    Audio { wav: Vec<u8> },
    /// Typed text; the transcribe stage is skipped
    Text {
        content: String,
        speaker: Option<String>,
    },
}

/// Streamed output of one pipeline run
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Final transcription of the turn audio
    Transcript { text: String },
    /// Recognized intent for the turn
    Intent { intent: Intent },
    /// Incremental assistant text
    ReplyDelta { content: String },
    /// Assistant text complete
    ReplyDone { message_id: Uuid },
    /// Synthesized PCM at the session sample rate
    AudioChunk { pcm: Vec<i16> },
    /// A dialogue message to commit; the session task applies these in order
    Commit { message: Message },
    /// Terminal: all stages finished
    Completed,
    /// Terminal: run was cancelled (barge-in or abort)
    Cancelled,
    /// Terminal: a stage failed; the session stays alive
    Failed { stage: Stage, message: String },
}

impl PipelineEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed { .. })
    }
}

/// One in-flight execution of the pipeline for a single turn
pub struct PipelineRun {
    cancel: Arc<AtomicBool>,
    /// Event stream; closed after a terminal event
    pub events: mpsc::Receiver<PipelineEvent>,
}

impl PipelineRun {
    /// Request cooperative cancellation (barge-in)
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Shareable cancellation flag, for cancelling after the run is consumed
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Sequences capability calls for dialogue turns
///
/// Shared across sessions; all per-turn state lives in the spawned run.
#[derive(Clone)]
pub struct TurnPipeline {
    providers: ProviderSet,
    tools: Arc<ToolExecutor>,
    config: PipelineConfig,
}

impl TurnPipeline {
    #[must_use]
    pub fn new(providers: ProviderSet, tools: Arc<ToolExecutor>, config: PipelineConfig) -> Self {
        Self {
            providers,
            tools,
            config,
        }
    }

    /// Start a run for one turn
    ///
    /// `history` is a snapshot of the dialogue in model-ready order; the run
    /// works on its own copy and emits `Commit` events for the messages the
    /// session task should apply to the store. `format` is the session's
    /// negotiated audio format; synthesis targets its sample rate.
    #[must_use]
    pub fn run_turn(
        &self,
        input: TurnInput,
        history: Vec<Message>,
        format: AudioFormat,
    ) -> PipelineRun {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(64);

        let worker = RunWorker {
            providers: self.providers.clone(),
            tools: Arc::clone(&self.tools),
            config: self.config.clone(),
            format,
            cancel: Arc::clone(&cancel),
            tx,
        };
        tokio::spawn(async move {
            worker.run(input, history).await;
        });

        PipelineRun { cancel, events: rx }
    }
}

/// Await a capability call with the stage's deadline
async fn staged<T>(
    secs: u64,
    stage: Stage,
    future: impl Future<Output = Result<T>> + Send,
) -> Result<T> {
    match tokio::time::timeout(Duration::from_secs(secs), future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Capability(format!(
            "{stage} timed out after {secs}s"
        ))),
    }
}

struct RunWorker {
    providers: ProviderSet,
    tools: Arc<ToolExecutor>,
    config: PipelineConfig,
    format: AudioFormat,
    cancel: Arc<AtomicBool>,
    tx: mpsc::Sender<PipelineEvent>,
}

impl RunWorker {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Send an event; false means the receiver is gone and the run should stop
    async fn emit(&self, event: PipelineEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn fail(&self, stage: Stage, error: &Error) {
        tracing::warn!(stage = %stage, error = %error, "pipeline stage failed");
        let _ = self
            .emit(PipelineEvent::Failed {
                stage,
                message: error.to_string(),
            })
            .await;
    }

    async fn run(self, input: TurnInput, mut working: Vec<Message>) {
        // Stage 1: transcribe (skipped for text input)
        let (text, speaker) = match input {
            TurnInput::Text { content, speaker } => (content, speaker),
            TurnInput::Audio { wav } => {
                let result = staged(
                    self.config.transcribe_timeout_secs,
                    Stage::Transcribe,
                    self.providers
                        .transcriber
                        .transcribe(&wav, &TranscribeOptions::default()),
                )
                .await;
                match result {
                    Ok(text) => {
                        if !self.emit(PipelineEvent::Transcript { text: text.clone() }).await {
                            return;
                        }
                        (text, None)
                    }
                    Err(e) => return self.fail(Stage::Transcribe, &e).await,
                }
            }
        };
        if text.trim().is_empty() {
            let _ = self.emit(PipelineEvent::Completed).await;
            return;
        }
        if self.cancelled() {
            let _ = self.emit(PipelineEvent::Cancelled).await;
            return;
        }

        // Commit the user turn
        let user_message = match speaker {
            Some(speaker) => Message::user_with_speaker(text.clone(), speaker),
            None => Message::user(text.clone()),
        };
        working.push(user_message.clone());
        if !self.emit(PipelineEvent::Commit { message: user_message }).await {
            return;
        }

        // Stage 2: recognize intent
        let intent = match staged(
            self.config.intent_timeout_secs,
            Stage::Intent,
            self.providers.intent.recognize(&text),
        )
        .await
        {
            Ok(intent) => intent,
            Err(e) => return self.fail(Stage::Intent, &e).await,
        };
        if !self.emit(PipelineEvent::Intent { intent: intent.clone() }).await {
            return;
        }
        if self.cancelled() {
            let _ = self.emit(PipelineEvent::Cancelled).await;
            return;
        }

        // High-confidence non-continue intents may short-circuit straight to
        // a side-effecting action; its result precedes the next model call.
        if !intent.is_continue() && intent.confidence >= self.config.intent_threshold {
            if let Some(tool) = self.tools.intent_action(&intent.name) {
                let arguments = intent.entities.to_string();
                let content = match self.tools.execute(tool, &arguments).await {
                    Ok(output) => output,
                    Err(e) => format!("Error: {e}"),
                };
                let tool_message = Message::tool(format!("intent_{}", intent.name), content);
                working.push(tool_message.clone());
                if !self.emit(PipelineEvent::Commit { message: tool_message }).await {
                    return;
                }
            } else {
                tracing::debug!(intent = %intent.name, "no action registered for intent");
            }
        }

        // Stage 3: generate, looping on tool-call rounds
        let tools = self.tools.definitions();
        let opts = GenerateOptions {
            tools: if tools.is_empty() { None } else { Some(tools) },
        };

        let mut reply_text = String::new();
        let mut finished = false;
        for round in 0..self.config.max_tool_depth {
            if self.cancelled() {
                let _ = self.emit(PipelineEvent::Cancelled).await;
                return;
            }

            let round_result = self.generate_round(&working, &opts).await;
            let (round_text, tool_calls) = match round_result {
                Ok(RoundOutcome::Cancelled) => {
                    let _ = self.emit(PipelineEvent::Cancelled).await;
                    return;
                }
                Ok(RoundOutcome::Finished { text, tool_calls }) => (text, tool_calls),
                Err(e) => return self.fail(Stage::Generate, &e).await,
            };
            reply_text.push_str(&round_text);

            let Some(calls) = tool_calls else {
                finished = true;
                break;
            };

            tracing::debug!(round, count = calls.len(), "executing tool calls");
            let assistant = Message::assistant_with_tools(
                (!round_text.is_empty()).then(|| round_text.clone()),
                calls.clone(),
            );
            working.push(assistant.clone());
            if !self.emit(PipelineEvent::Commit { message: assistant }).await {
                return;
            }

            // Failures become tool messages; the turn continues
            for (call, result) in self.tools.execute_batch(&calls).await {
                let content = match result {
                    Ok(output) => output,
                    Err(e) => format!("Error: {e}"),
                };
                let tool_message = Message::tool(call.id, content);
                working.push(tool_message.clone());
                if !self.emit(PipelineEvent::Commit { message: tool_message }).await {
                    return;
                }
            }
        }
        if !finished {
            let error = Error::Capability(format!(
                "tool-call depth exceeded ({} rounds)",
                self.config.max_tool_depth
            ));
            return self.fail(Stage::Generate, &error).await;
        }
        if self.cancelled() {
            let _ = self.emit(PipelineEvent::Cancelled).await;
            return;
        }

        let assistant = Message::assistant(reply_text.clone());
        let message_id = assistant.id;
        if !self.emit(PipelineEvent::ReplyDone { message_id }).await {
            return;
        }

        // Stage 4: synthesize
        if !reply_text.is_empty() {
            if let Err(e) = self.synthesize(&reply_text).await {
                return self.fail(Stage::Synthesize, &e).await;
            }
            if self.cancelled() {
                let _ = self.emit(PipelineEvent::Cancelled).await;
                return;
            }
        }

        // The assistant turn becomes part of the dialogue only once every
        // stage has succeeded; cancelled and failed turns leave no reply.
        if !self.emit(PipelineEvent::Commit { message: assistant }).await {
            return;
        }
        let _ = self.emit(PipelineEvent::Completed).await;
    }

    /// One generation round: stream deltas out, assemble any tool calls
    async fn generate_round(
        &self,
        working: &[Message],
        opts: &GenerateOptions,
    ) -> Result<RoundOutcome> {
        let mut stream = staged(
            self.config.generate_timeout_secs,
            Stage::Generate,
            self.providers.generator.generate(working, opts),
        )
        .await?;

        let mut text = String::new();
        loop {
            let next = tokio::time::timeout(
                Duration::from_secs(self.config.generate_timeout_secs),
                stream.next(),
            )
            .await
            .map_err(|_| {
                Error::Capability(format!(
                    "generate stream stalled after {}s",
                    self.config.generate_timeout_secs
                ))
            })?;

            if self.cancelled() {
                return Ok(RoundOutcome::Cancelled);
            }

            match next {
                Some(Ok(ReplyEvent::TextDelta(delta))) => {
                    text.push_str(&delta);
                    if !self
                        .emit(PipelineEvent::ReplyDelta { content: delta })
                        .await
                    {
                        return Ok(RoundOutcome::Cancelled);
                    }
                }
                Some(Ok(ReplyEvent::ToolCalls(calls))) => {
                    return Ok(RoundOutcome::Finished {
                        text,
                        tool_calls: Some(calls),
                    });
                }
                Some(Ok(ReplyEvent::Done)) | None => {
                    return Ok(RoundOutcome::Finished {
                        text,
                        tool_calls: None,
                    });
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Stream synthesized PCM chunks out, checking the cancel flag per chunk
    async fn synthesize(&self, text: &str) -> Result<()> {
        let opts = SynthesizeOptions {
            sample_rate: self.format.sample_rate,
            voice: None,
        };
        let mut stream = staged(
            self.config.synthesize_timeout_secs,
            Stage::Synthesize,
            self.providers.synthesizer.synthesize(text, &opts),
        )
        .await?;

        loop {
            let next = tokio::time::timeout(
                Duration::from_secs(self.config.synthesize_timeout_secs),
                stream.next(),
            )
            .await
            .map_err(|_| {
                Error::Capability(format!(
                    "synthesize stream stalled after {}s",
                    self.config.synthesize_timeout_secs
                ))
            })?;

            if self.cancelled() {
                // Partial audio already sent stays sent
                return Ok(());
            }

            match next {
                Some(Ok(pcm)) => {
                    if !self.emit(PipelineEvent::AudioChunk { pcm }).await {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}

enum RoundOutcome {
    Finished {
        text: String,
        tool_calls: Option<Vec<crate::dialogue::ToolCall>>,
    },
    Cancelled,
}
