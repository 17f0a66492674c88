//! PCM codec for the realtime session wire format.
//!
//! Local audio is mono `f32` in [-1.0, 1.0]. The wire carries 16-bit signed
//! little-endian PCM, base64-encoded so it can travel inside JSON text frames.
//! Capture and playback run at different fixed rates and nothing here resamples.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Sample rate of microphone audio sent to the remote session.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of audio received from the remote session.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// All audio in the bridge is mono.
pub const CHANNELS: u16 = 1;

/// Errors that can occur while decoding wire audio
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 payload has odd length ({0} bytes)")]
    OddByteLength(usize),
}

/// A block of mono float samples tagged with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        CHANNELS
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Convert float samples to 16-bit PCM.
///
/// Samples are clamped to [-1, 1]. Negative values scale by 32768 and the rest by
/// 32767 so that +1.0 still fits in an `i16`. The fractional part is truncated.
pub fn encode(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Convert 16-bit PCM back to float samples.
pub fn decode(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Serialize PCM samples as little-endian bytes.
pub fn pcm16_to_bytes(pcm: &[i16]) -> Vec<u8> {
    pcm.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Parse little-endian bytes into PCM samples.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Bytes to transport-safe text.
pub fn to_wire_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`to_wire_text`].
pub fn from_wire_text(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// MIME descriptor for raw PCM at the given rate, e.g. `audio/pcm;rate=16000`
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a PCM MIME descriptor.
pub fn parse_mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// One wire-encoded audio frame, as carried by the realtime session.
///
/// Serializes as `{"mimeType": "...", "data": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    pub mime_type: String,
    pub data: String,
}

impl EncodedChunk {
    /// Encode float samples captured at `sample_rate`.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        let bytes = pcm16_to_bytes(&encode(samples));
        Self {
            mime_type: pcm_mime_type(sample_rate),
            data: to_wire_text(&bytes),
        }
    }

    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self::from_samples(frame.samples(), frame.sample_rate())
    }

    /// Sample rate declared by the MIME descriptor, if any
    pub fn sample_rate(&self) -> Option<u32> {
        parse_mime_rate(&self.mime_type)
    }

    /// Decode the payload to float samples.
    pub fn decode_samples(&self) -> Result<Vec<f32>, CodecError> {
        let bytes = from_wire_text(&self.data)?;
        Ok(decode(&bytes_to_pcm16(&bytes)?))
    }

    /// Decode into a frame at a fixed rate, ignoring the declared one.
    pub fn decode_frame(&self, sample_rate: u32) -> Result<AudioFrame, CodecError> {
        Ok(AudioFrame::new(self.decode_samples()?, sample_rate))
    }
}
