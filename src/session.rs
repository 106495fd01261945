//! Session orchestrator
//!
//! Owns one connection end to end: demultiplexes binary audio and control
//! messages from the transport, feeds the codec bridge and voice gate,
//! starts pipeline runs on turn boundaries, and forwards streamed pipeline
//! output back out. All per-session state is owned by the single session
//! task; both input kinds arrive on one queue, so mutation is serialized
//! without locks.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::audio::{AudioFormat, CodecBridge, EnergyClassifier, GateEvent, VadGate};
use crate::config::Config;
use crate::dialogue::Dialogue;
use crate::events::{EventBus, SessionEvent, SessionEventKind};
use crate::pipeline::{PipelineEvent, PipelineRun, TurnInput, TurnPipeline};
use crate::server::{ControlIn, ControlOut, ListenAction, TtsAction, TurnEvent};
use crate::{audio, Result};

/// Hard cap on buffered turn audio (seconds)
const MAX_TURN_SECS: usize = 30;

/// Session lifecycle after the transport handshake
///
/// Connection setup and the `hello` exchange happen in the transport before
/// the session exists, so a constructed session is always `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Input delivered to the session task
#[derive(Debug)]
pub enum SessionInbound {
    /// One codec-compressed audio frame
    Audio(Vec<u8>),
    /// One parsed control message
    Control(ControlIn),
    /// Transport closed
    Closed,
}

/// Output the session task hands back to the transport
#[derive(Debug)]
pub enum SessionOutbound {
    Control(ControlOut),
    /// One codec-compressed audio frame
    Audio(Vec<u8>),
}

enum Flow {
    Continue,
    Close,
}

/// One live connection's state and wiring
pub struct Session {
    id: String,
    device_id: String,
    created_at: DateTime<Utc>,
    state: SessionState,
    format: AudioFormat,
    codec: CodecBridge,
    gate: VadGate,
    dialogue: Dialogue,
    pipeline: TurnPipeline,
    events: EventBus,
    outbound: mpsc::Sender<SessionOutbound>,
    /// Decoded PCM for the in-progress turn
    turn_buffer: Vec<i16>,
    /// Synthesized PCM awaiting frame-sized encoding
    synth_carry: Vec<i16>,
    /// Whether a TTS audio burst is currently open
    tts_active: bool,
}

impl Session {
    /// Build a fully negotiated session (handshake already completed)
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the negotiated format cannot back a codec
    /// bridge.
    pub fn new(
        id: String,
        device_id: String,
        format: AudioFormat,
        config: &Config,
        pipeline: TurnPipeline,
        events: EventBus,
        outbound: mpsc::Sender<SessionOutbound>,
    ) -> Result<Self> {
        let codec = CodecBridge::new(format, config.audio.dtx, config.audio.min_packet_bytes)?;
        let gate = VadGate::new(
            config.vad.gate_config(),
            Box::new(EnergyClassifier::new(config.vad.energy_reference)),
            format.frame_ms,
        );
        let mut dialogue = Dialogue::new(config.dialogue.max_messages, config.dialogue.keep_system);
        if let Some(prompt) = &config.dialogue.system_prompt {
            dialogue.append(crate::dialogue::Message::system(prompt.clone()));
        }

        Ok(Self {
            id,
            device_id,
            created_at: Utc::now(),
            state: SessionState::Active,
            format,
            codec,
            gate,
            dialogue,
            pipeline,
            events,
            outbound,
            turn_buffer: Vec::new(),
            synth_carry: Vec::new(),
            tts_active: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Read-only view of the dialogue, for snapshot consumers
    #[must_use]
    pub const fn dialogue(&self) -> &Dialogue {
        &self.dialogue
    }

    /// Drive the session until the transport closes
    ///
    /// Consumes the session; on exit the active run is cancelled and codec
    /// resources are released with the session.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<SessionInbound>) {
        self.publish(SessionEventKind::Connected);
        tracing::info!(session_id = %self.id, device_id = %self.device_id, "session active");

        let mut active: Option<PipelineRun> = None;

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else { break };
                    match self.handle_inbound(message, &mut active).await {
                        Flow::Continue => {}
                        Flow::Close => break,
                    }
                }
                event = Self::next_run_event(&mut active), if active.is_some() => {
                    match event {
                        Some(event) => {
                            let terminal = event.is_terminal();
                            self.handle_pipeline_event(event).await;
                            if terminal {
                                active = None;
                                self.finish_turn().await;
                            }
                        }
                        None => {
                            // Worker gone without a terminal event
                            active = None;
                            self.finish_turn().await;
                        }
                    }
                }
            }
        }

        self.state = SessionState::Closing;
        if let Some(mut run) = active.take() {
            run.cancel();
            self.drain_commits(&mut run);
        }
        self.state = SessionState::Closed;
        self.publish(SessionEventKind::Disconnected);
        tracing::info!(session_id = %self.id, "session closed");
    }

    async fn next_run_event(active: &mut Option<PipelineRun>) -> Option<PipelineEvent> {
        match active {
            Some(run) => run.events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Apply dialogue commits still queued from a run being discarded
    ///
    /// A superseded run may have executed tools whose results sit in the
    /// event channel; those stay part of the dialogue even though the rest
    /// of the turn is dropped.
    fn drain_commits(&mut self, run: &mut PipelineRun) {
        while let Ok(event) = run.events.try_recv() {
            if let PipelineEvent::Commit { message } = event {
                self.dialogue.append(message);
            }
        }
    }

    fn publish(&self, kind: SessionEventKind) {
        self.events
            .publish(SessionEvent::new(kind, &self.id, Some(&self.device_id)));
    }

    async fn send(&self, outbound: SessionOutbound) -> Flow {
        if self.outbound.send(outbound).await.is_err() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    async fn send_control(&self, control: ControlOut) -> Flow {
        self.send(SessionOutbound::Control(control)).await
    }

    async fn handle_inbound(
        &mut self,
        message: SessionInbound,
        active: &mut Option<PipelineRun>,
    ) -> Flow {
        match message {
            SessionInbound::Audio(packet) => self.handle_audio(&packet, active).await,
            SessionInbound::Control(control) => self.handle_control(control, active).await,
            SessionInbound::Closed => Flow::Close,
        }
    }

    async fn handle_audio(&mut self, packet: &[u8], active: &mut Option<PipelineRun>) -> Flow {
        if self.state != SessionState::Active {
            tracing::warn!(session_id = %self.id, "audio frame outside active state");
            return Flow::Continue;
        }

        // A bad frame is dropped, never fatal to the session
        let pcm = match self.codec.decode(packet) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "dropping undecodable frame");
                return Flow::Continue;
            }
        };

        self.buffer_turn_audio(&pcm);

        match self.gate.process_frame(&pcm) {
            Some(GateEvent::VoiceStart) => {
                tracing::debug!(session_id = %self.id, "speech detected");
            }
            Some(GateEvent::TurnEnd) => {}
            None => {}
        }

        if self.gate.take_turn_end() {
            return self.start_audio_turn(active).await;
        }
        Flow::Continue
    }

    /// Keep the turn buffer bounded: a short pre-roll before activation, a
    /// hard cap overall
    fn buffer_turn_audio(&mut self, pcm: &[i16]) {
        self.turn_buffer.extend_from_slice(pcm);

        let frame = self.format.samples_per_frame_total();
        let max_samples = MAX_TURN_SECS * self.format.sample_rate as usize;
        let preroll = 10 * frame;

        let cap = if self.gate.is_voice_active() {
            max_samples
        } else {
            preroll
        };
        if self.turn_buffer.len() > cap {
            let excess = self.turn_buffer.len() - cap;
            self.turn_buffer.drain(..excess);
        }
    }

    async fn start_audio_turn(&mut self, active: &mut Option<PipelineRun>) -> Flow {
        let pcm = std::mem::take(&mut self.turn_buffer);
        if pcm.is_empty() {
            return Flow::Continue;
        }
        let wav = match audio::pcm_to_wav(&pcm, self.format.sample_rate, self.format.channels) {
            Ok(wav) => wav,
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "failed to frame turn audio");
                return Flow::Continue;
            }
        };
        self.start_turn(TurnInput::Audio { wav }, active).await
    }

    async fn start_turn(&mut self, input: TurnInput, active: &mut Option<PipelineRun>) -> Flow {
        // Barge-in: a new turn supersedes the in-flight run. Audio queued
        // from the old run is dropped, not carried into the new one.
        if let Some(mut run) = active.take() {
            tracing::debug!(session_id = %self.id, "cancelling superseded run");
            run.cancel();
            self.drain_commits(&mut run);
            self.synth_carry.clear();
            if self.tts_active {
                self.tts_active = false;
                if let Flow::Close = self
                    .send_control(ControlOut::Tts {
                        action: TtsAction::Stop,
                    })
                    .await
                {
                    return Flow::Close;
                }
            }
        }

        self.publish(SessionEventKind::TurnStarted);
        if let Flow::Close = self
            .send_control(ControlOut::Turn {
                event: TurnEvent::Started,
            })
            .await
        {
            return Flow::Close;
        }

        let run = self
            .pipeline
            .run_turn(input, self.dialogue.history(), self.format);
        *active = Some(run);
        Flow::Continue
    }

    async fn handle_control(
        &mut self,
        control: ControlIn,
        active: &mut Option<PipelineRun>,
    ) -> Flow {
        match control {
            ControlIn::Hello { .. } => {
                tracing::warn!(session_id = %self.id, "duplicate hello ignored");
                self.send_control(ControlOut::Error {
                    code: "protocol_error".to_string(),
                    message: "session already established".to_string(),
                })
                .await
            }
            ControlIn::Text { content, speaker } => {
                self.start_turn(TurnInput::Text { content, speaker }, active)
                    .await
            }
            ControlIn::Listen { mode, action } => {
                if let Some(mode) = mode {
                    self.gate.set_mode(mode);
                }
                match action {
                    Some(ListenAction::Start) => {
                        self.gate.reset();
                        self.turn_buffer.clear();
                    }
                    Some(ListenAction::Stop) => {
                        // Explicit turn end; in manual mode this is the only
                        // way a turn closes
                        self.gate.force_turn_end();
                        if self.gate.take_turn_end() {
                            return self.start_audio_turn(active).await;
                        }
                    }
                    None => {}
                }
                Flow::Continue
            }
            ControlIn::Abort => {
                if let Some(mut run) = active.take() {
                    tracing::info!(session_id = %self.id, "client aborted turn");
                    run.cancel();
                    self.drain_commits(&mut run);
                    self.finish_turn().await;
                }
                self.gate.reset();
                self.turn_buffer.clear();
                Flow::Continue
            }
            ControlIn::Ping => self.send_control(ControlOut::Pong).await,
        }
    }

    async fn handle_pipeline_event(&mut self, event: PipelineEvent) {
        let flow = match event {
            PipelineEvent::Transcript { text } => {
                self.send_control(ControlOut::Transcript { text }).await
            }
            PipelineEvent::Intent { intent } => {
                self.send_control(ControlOut::Intent {
                    name: intent.name,
                    confidence: intent.confidence,
                })
                .await
            }
            PipelineEvent::ReplyDelta { content } => {
                self.send_control(ControlOut::ReplyDelta { content }).await
            }
            PipelineEvent::ReplyDone { message_id } => {
                self.send_control(ControlOut::ReplyDone {
                    message_id: message_id.to_string(),
                })
                .await
            }
            PipelineEvent::Commit { message } => {
                self.dialogue.append(message);
                Flow::Continue
            }
            PipelineEvent::AudioChunk { pcm } => self.stream_tts(&pcm).await,
            PipelineEvent::Completed | PipelineEvent::Cancelled => Flow::Continue,
            PipelineEvent::Failed { stage, message } => {
                self.send_control(ControlOut::Error {
                    code: "capability_error".to_string(),
                    message: format!("{stage}: {message}"),
                })
                .await
            }
        };
        if let Flow::Close = flow {
            tracing::debug!(session_id = %self.id, "outbound channel closed");
        }
    }

    /// Encode buffered synthesized PCM into codec frames and send them
    async fn stream_tts(&mut self, pcm: &[i16]) -> Flow {
        if !self.tts_active {
            self.tts_active = true;
            if let Flow::Close = self
                .send_control(ControlOut::Tts {
                    action: TtsAction::Start,
                })
                .await
            {
                return Flow::Close;
            }
        }

        self.synth_carry.extend_from_slice(pcm);
        let frame = self.format.samples_per_frame_total();
        while self.synth_carry.len() >= frame {
            let chunk: Vec<i16> = self.synth_carry.drain(..frame).collect();
            match self.codec.encode(&chunk) {
                Ok(Some(packet)) => {
                    if let Flow::Close = self.send(SessionOutbound::Audio(packet)).await {
                        return Flow::Close;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "tts frame encode failed");
                }
            }
        }
        Flow::Continue
    }

    /// Close out a finished (or cancelled/failed) turn
    async fn finish_turn(&mut self) {
        // Flush the partial trailing frame, zero-padded to the boundary
        if !self.synth_carry.is_empty() {
            let frame = self.format.samples_per_frame_total();
            let mut last: Vec<i16> = std::mem::take(&mut self.synth_carry);
            last.resize(frame, 0);
            if let Ok(Some(packet)) = self.codec.encode(&last) {
                let _ = self.send(SessionOutbound::Audio(packet)).await;
            }
        }
        if self.tts_active {
            self.tts_active = false;
            let _ = self
                .send_control(ControlOut::Tts {
                    action: TtsAction::Stop,
                })
                .await;
        }
        let _ = self
            .send_control(ControlOut::Turn {
                event: TurnEvent::Ended,
            })
            .await;
        self.publish(SessionEventKind::TurnEnded);
    }
}
