//! Voice-activity gate
//!
//! Classifies decoded PCM frames and turns them into turn boundaries. The
//! gate is a per-session state machine fed one frame at a time; time is
//! accounted in frame durations, so decisions are deterministic for a given
//! frame sequence regardless of wall-clock jitter.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// How turn end is decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    /// Gate decides turn end from trailing silence
    #[default]
    Auto,
    /// Client signals turn end explicitly; silence is ignored
    Manual,
}

/// Gate state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No frames processed since last reset
    Idle,
    /// Receiving frames, no speech detected yet
    Listening,
    /// Speech detected, accumulating the utterance
    VoiceActive,
    /// Turn end latched, waiting to be consumed
    TurnEnd,
}

/// Edge-triggered events emitted by the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEvent {
    /// Speech started (transition into `VoiceActive`)
    VoiceStart,
    /// Turn ended (trailing silence in auto mode, or forced)
    TurnEnd,
}

/// Per-frame voice classifier seam
///
/// Returns the probability that a frame contains speech, in `[0.0, 1.0]`.
/// The default implementation is RMS energy; ML classifiers plug in here
/// without touching the gate state machine.
pub trait VoiceClassifier: Send + Sync {
    fn classify(&mut self, frame: &[i16]) -> f32;
}

/// RMS-energy classifier
///
/// Maps frame energy linearly onto `[0.0, 1.0]` against a reference level.
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    /// Full-scale RMS level that maps to probability 1.0
    reference: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self { reference: 0.06 }
    }
}

impl EnergyClassifier {
    #[must_use]
    pub const fn new(reference: f32) -> Self {
        Self { reference }
    }
}

impl VoiceClassifier for EnergyClassifier {
    #[allow(clippy::cast_precision_loss)]
    fn classify(&mut self, frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = frame
            .iter()
            .map(|&s| {
                let f = f32::from(s) / 32768.0;
                f * f
            })
            .sum();
        let rms = (sum_squares / frame.len() as f32).sqrt();
        (rms / self.reference).min(1.0)
    }
}

/// Gate tuning, negotiated per session
#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    /// Probability at or above which a frame counts as voice
    pub threshold: f32,
    /// Sliding window length in frames
    pub window_frames: usize,
    /// Fraction of voiced frames in the window that activates the gate
    pub activation_ratio: f32,
    /// Trailing silence (ms) that ends a turn in auto mode
    pub silence_timeout_ms: u64,
    /// Auto or manual turn-end
    pub mode: ListenMode,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            window_frames: 10,
            activation_ratio: 0.5,
            silence_timeout_ms: 700,
            mode: ListenMode::Auto,
        }
    }
}

/// Voice-activity gate: sliding window of frame decisions plus turn state
pub struct VadGate {
    config: GateConfig,
    classifier: Box<dyn VoiceClassifier>,
    /// Frame duration, drives the internal clock
    frame_ms: u64,
    /// Recent frame decisions, oldest first
    window: VecDeque<bool>,
    state: GateState,
    /// Stream time in ms, advanced once per processed frame
    clock_ms: u64,
    first_activity_ms: Option<u64>,
    last_activity_ms: Option<u64>,
    /// Latched turn-end flag; cleared only by `take_turn_end`
    voice_stopped: bool,
}

impl std::fmt::Debug for VadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadGate")
            .field("state", &self.state)
            .field("clock_ms", &self.clock_ms)
            .field("voice_stopped", &self.voice_stopped)
            .finish_non_exhaustive()
    }
}

impl VadGate {
    #[must_use]
    pub fn new(config: GateConfig, classifier: Box<dyn VoiceClassifier>, frame_ms: u32) -> Self {
        Self {
            config,
            classifier,
            frame_ms: u64::from(frame_ms),
            window: VecDeque::with_capacity(config.window_frames),
            state: GateState::Idle,
            clock_ms: 0,
            first_activity_ms: None,
            last_activity_ms: None,
            voice_stopped: false,
        }
    }

    /// Classify one frame and advance the state machine
    ///
    /// Never blocks; returns at most one edge event. Once `TurnEnd` has been
    /// emitted the gate stays latched until [`Self::take_turn_end`].
    #[allow(clippy::cast_precision_loss)]
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<GateEvent> {
        self.clock_ms += self.frame_ms;

        let probability = self.classifier.classify(pcm);
        // Boundary equality counts as voice
        let voiced = probability >= self.config.threshold;

        if self.window.len() == self.config.window_frames {
            self.window.pop_front();
        }
        self.window.push_back(voiced);

        if voiced {
            self.last_activity_ms = Some(self.clock_ms);
        }

        match self.state {
            GateState::Idle | GateState::Listening => {
                self.state = GateState::Listening;
                let voiced_count = self.window.iter().filter(|&&v| v).count();
                let ratio = voiced_count as f32 / self.window.len() as f32;
                if ratio >= self.config.activation_ratio {
                    self.state = GateState::VoiceActive;
                    self.first_activity_ms = Some(self.clock_ms);
                    tracing::debug!(clock_ms = self.clock_ms, "voice active");
                    return Some(GateEvent::VoiceStart);
                }
            }
            GateState::VoiceActive => {
                if self.config.mode == ListenMode::Auto {
                    let last = self.last_activity_ms.unwrap_or(self.clock_ms);
                    if self.clock_ms.saturating_sub(last) >= self.config.silence_timeout_ms {
                        self.latch_turn_end();
                        return Some(GateEvent::TurnEnd);
                    }
                }
            }
            GateState::TurnEnd => {}
        }

        None
    }

    /// Force turn end, regardless of frame history
    ///
    /// Used for the explicit client stop in manual mode (and client aborts
    /// in auto mode). Returns the event if the latch was newly set.
    pub fn force_turn_end(&mut self) -> Option<GateEvent> {
        if self.voice_stopped {
            return None;
        }
        self.latch_turn_end();
        Some(GateEvent::TurnEnd)
    }

    fn latch_turn_end(&mut self) {
        self.state = GateState::TurnEnd;
        self.voice_stopped = true;
        tracing::debug!(clock_ms = self.clock_ms, "turn end latched");
    }

    /// Consume the turn-end latch
    ///
    /// Returns true exactly once per latched turn; consuming resets the gate
    /// to `Idle` for the next turn.
    pub fn take_turn_end(&mut self) -> bool {
        if !self.voice_stopped {
            return false;
        }
        self.voice_stopped = false;
        self.reset();
        true
    }

    /// Reset detection state for a new turn (keeps config and stream clock)
    pub fn reset(&mut self) {
        self.state = GateState::Idle;
        self.window.clear();
        self.first_activity_ms = None;
        self.last_activity_ms = None;
    }

    #[must_use]
    pub const fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub const fn is_voice_active(&self) -> bool {
        matches!(self.state, GateState::VoiceActive)
    }

    #[must_use]
    pub const fn mode(&self) -> ListenMode {
        self.config.mode
    }

    /// Switch listen mode for subsequent turns
    pub fn set_mode(&mut self, mode: ListenMode) {
        self.config.mode = mode;
    }

    /// Stream time of first detected activity for the current turn
    #[must_use]
    pub const fn first_activity_ms(&self) -> Option<u64> {
        self.first_activity_ms
    }

    /// Stream time of most recent detected activity
    #[must_use]
    pub const fn last_activity_ms(&self) -> Option<u64> {
        self.last_activity_ms
    }
}
