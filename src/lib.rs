//! Lark Gateway - Real-time voice assistant gateway
//!
//! This library provides the core functionality for the Lark gateway:
//! - Duplex WebSocket transport carrying compressed audio and JSON control
//! - Opus codec bridge between wire packets and PCM
//! - Voice-activity gating with automatic and push-to-talk turn taking
//! - Bounded dialogue history per session
//! - Staged turn pipeline (transcribe, intent, generate, synthesize) over
//!   pluggable providers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Clients                          │
//! │    embedded devices │ desktop apps │ test harness    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ WebSocket (Opus frames + JSON)
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Lark Gateway                        │
//! │   Codec Bridge │ Voice Gate │ Session │ Dialogue    │
//! └────────────────────┬────────────────────────────────┘
//!                      │ Turn pipeline
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Providers                          │
//! │   STT │ Intent │ LLM (tool calls) │ TTS             │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod session;
pub mod tools;

pub use audio::{AudioFormat, CodecBridge, GateEvent, ListenMode, VadGate};
pub use config::Config;
pub use dialogue::{Dialogue, Message, Role};
pub use error::{Error, Result};
pub use events::{EventBus, SessionEvent, SessionEventKind};
pub use pipeline::{PipelineEvent, PipelineRun, TurnInput, TurnPipeline};
pub use providers::{ProviderRegistry, ProviderSet};
pub use session::{Session, SessionInbound, SessionOutbound, SessionState};
pub use tools::ToolExecutor;
