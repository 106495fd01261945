//! Opus codec bridge
//!
//! Frames raw PCM into fixed-size windows and compresses/decompresses them
//! with libopus. The bridge holds no state beyond the codec handles; those
//! are owned here and released when the bridge is dropped.

use std::sync::Mutex;

use opus::{Application, Channels, Decoder, Encoder};

use super::AudioFormat;
use crate::{Error, Result};

/// Upper bound for a single encoded packet (libopus recommendation)
const MAX_PACKET_BYTES: usize = 4000;

/// Stateless-per-call Opus encoder/decoder pair bound to one session format
pub struct CodecBridge {
    /// Wrapped in `Mutex` only to make the bridge `Sync` for the session
    /// task; all access goes through `&mut self` and never locks.
    encoder: Mutex<Encoder>,
    decoder: Mutex<Decoder>,
    format: AudioFormat,
    /// Discontinuous transmission: suppress near-empty packets instead of
    /// sending them. Off by default; small DTX packets have been observed to
    /// break downstream decoders.
    dtx: bool,
    /// Packets shorter than this are treated as DTX artifacts when `dtx` is on
    min_packet_bytes: usize,
}

impl std::fmt::Debug for CodecBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecBridge")
            .field("format", &self.format)
            .field("dtx", &self.dtx)
            .field("min_packet_bytes", &self.min_packet_bytes)
            .finish_non_exhaustive()
    }
}

impl CodecBridge {
    /// Create a bridge for the negotiated session format
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the format is invalid or libopus rejects it.
    pub fn new(format: AudioFormat, dtx: bool, min_packet_bytes: usize) -> Result<Self> {
        format.validate()?;

        let channels = if format.channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };

        let mut encoder = Encoder::new(format.sample_rate, channels, Application::Voip)
            .map_err(|e| Error::Codec(format!("encoder init: {e}")))?;
        encoder
            .set_vbr(true)
            .map_err(|e| Error::Codec(format!("encoder vbr: {e}")))?;

        let decoder = Decoder::new(format.sample_rate, channels)
            .map_err(|e| Error::Codec(format!("decoder init: {e}")))?;

        tracing::debug!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            frame_ms = format.frame_ms,
            dtx,
            "codec bridge initialized"
        );

        Ok(Self {
            encoder: Mutex::new(encoder),
            decoder: Mutex::new(decoder),
            format,
            dtx,
            min_packet_bytes,
        })
    }

    /// The session format this bridge was built for
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        self.format
    }

    /// Encode one PCM frame into an Opus packet
    ///
    /// Returns `None` when DTX is enabled and the encoded packet falls below
    /// the minimum byte threshold — such packets are suppressed rather than
    /// transmitted.
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the input length is not exactly one frame
    /// at the negotiated format, or if libopus fails.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Option<Vec<u8>>> {
        let expected = self.format.samples_per_frame_total();
        if pcm.len() != expected {
            return Err(Error::Codec(format!(
                "invalid frame length: got {} samples, expected {expected}",
                pcm.len()
            )));
        }

        let packet = self
            .encoder
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .encode_vec(pcm, MAX_PACKET_BYTES)
            .map_err(|e| Error::Codec(format!("encode: {e}")))?;

        if self.dtx && packet.len() < self.min_packet_bytes {
            tracing::trace!(bytes = packet.len(), "suppressing sub-minimum DTX packet");
            return Ok(None);
        }

        Ok(Some(packet))
    }

    /// Decode one Opus packet into a PCM frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if decoding fails or the decoded sample count
    /// does not match the negotiated frame size.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        if packet.is_empty() {
            return Err(Error::Codec("empty packet".to_string()));
        }

        let expected = self.format.samples_per_frame();
        let mut pcm = vec![0i16; self.format.samples_per_frame_total()];

        let decoded = self
            .decoder
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .decode(packet, &mut pcm, false)
            .map_err(|e| Error::Codec(format!("decode: {e}")))?;

        if decoded != expected {
            return Err(Error::Codec(format!(
                "decoded frame size mismatch: got {decoded} samples, expected {expected}"
            )));
        }

        Ok(pcm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> CodecBridge {
        CodecBridge::new(AudioFormat::default(), false, 3).unwrap()
    }

    /// 440 Hz sine at moderate amplitude, one frame long
    fn voiced_frame(format: AudioFormat) -> Vec<i16> {
        let n = format.samples_per_frame_total();
        (0..n)
            .map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                let s = 0.4 * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
                (s * 32767.0) as i16
            })
            .collect()
    }

    #[test]
    fn round_trip_preserves_frame_size() {
        let mut bridge = bridge();
        let frame = voiced_frame(bridge.format());

        let packet = bridge.encode(&frame).unwrap().expect("packet");
        assert!(!packet.is_empty());

        let decoded = bridge.decode(&packet).unwrap();
        assert_eq!(decoded.len(), frame.len());
    }

    #[test]
    fn rejects_wrong_encode_length() {
        let mut bridge = bridge();
        let short = vec![0i16; 100];
        assert!(matches!(bridge.encode(&short), Err(Error::Codec(_))));
    }

    #[test]
    fn rejects_empty_packet() {
        let mut bridge = bridge();
        assert!(matches!(bridge.decode(&[]), Err(Error::Codec(_))));
    }

    #[test]
    fn dtx_suppresses_sub_minimum_packets() {
        // Threshold far above any real packet size forces the suppression path
        let mut bridge = CodecBridge::new(AudioFormat::default(), true, MAX_PACKET_BYTES).unwrap();
        let silence = vec![0i16; bridge.format().samples_per_frame_total()];
        assert!(bridge.encode(&silence).unwrap().is_none());
    }

    #[test]
    fn dtx_disabled_transmits_everything() {
        let mut bridge = bridge();
        let silence = vec![0i16; bridge.format().samples_per_frame_total()];
        assert!(bridge.encode(&silence).unwrap().is_some());
    }
}
