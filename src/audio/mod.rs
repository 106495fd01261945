//! Audio processing module
//!
//! Covers the codec bridge (Opus framing between client and server) and the
//! voice-activity gate that turns raw frames into turn boundaries.

pub mod codec;
pub mod vad;

pub use codec::CodecBridge;
pub use vad::{EnergyClassifier, GateEvent, GateState, ListenMode, VadGate, VoiceClassifier};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Sample rates libopus accepts
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Frame durations (ms) that produce valid whole-sample Opus frames
pub const SUPPORTED_FRAME_MS: [u32; 4] = [10, 20, 40, 60];

/// Default session format: 16 kHz mono, 60 ms frames
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_FRAME_MS: u32 = 60;

/// Negotiated audio format, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (1 or 2)
    pub channels: u8,
    /// Frame duration in milliseconds
    pub frame_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            frame_ms: DEFAULT_FRAME_MS,
        }
    }
}

impl AudioFormat {
    /// Samples per frame, per channel
    #[must_use]
    pub const fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize / 1000) * self.frame_ms as usize
    }

    /// Total i16 samples per frame across all channels
    #[must_use]
    pub const fn samples_per_frame_total(&self) -> usize {
        self.samples_per_frame() * self.channels as usize
    }

    /// Validate that this format is acceptable codec input
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` for unsupported sample rates, channel counts,
    /// or frame durations.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::Codec(format!(
                "unsupported sample rate: {}",
                self.sample_rate
            )));
        }
        if self.channels != 1 && self.channels != 2 {
            return Err(Error::Codec(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if !SUPPORTED_FRAME_MS.contains(&self.frame_ms) {
            return Err(Error::Codec(format!(
                "unsupported frame duration: {} ms",
                self.frame_ms
            )));
        }
        Ok(())
    }
}

/// Encode PCM samples as a mono 16-bit WAV byte buffer
///
/// Used to hand buffered turn audio to transcription providers that expect
/// a container, not raw samples.
///
/// # Errors
///
/// Returns `Error::Codec` if the WAV writer fails.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32, channels: u8) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: u16::from(channels),
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Codec(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Codec(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Codec(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_is_16khz_mono_60ms() {
        let format = AudioFormat::default();
        assert_eq!(format.samples_per_frame(), 960);
        assert_eq!(format.samples_per_frame_total(), 960);
        assert!(format.validate().is_ok());
    }

    #[test]
    fn rejects_odd_frame_duration() {
        let format = AudioFormat {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 25,
        };
        assert!(format.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let format = AudioFormat {
            sample_rate: 44_100,
            channels: 1,
            frame_ms: 20,
        };
        assert!(format.validate().is_err());
    }

    #[test]
    fn wav_header_present() {
        let samples = vec![0i16; 960];
        let wav = pcm_to_wav(&samples, 16_000, 1).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
