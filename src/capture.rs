//! Capture pipeline: fixed-size framing, level metering and mute gating.
//!
//! A [`MicrophoneStream`] pushes mono samples at the capture rate in whatever
//! block sizes the device delivers. The [`FrameSampler`] regroups them into
//! fixed windows. On every window boundary it publishes the signal level and,
//! unless muted, hands a wire-encoded chunk to the frame-ready callback.

use crate::codec::{EncodedChunk, CAPTURE_SAMPLE_RATE};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Samples per captured frame (256 ms at 16 kHz).
pub const DEFAULT_FRAME_LEN: usize = 4096;

/// Errors that can occur while acquiring or running the microphone
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to get device config: {0}")]
    DeviceConfig(String),

    #[error("Failed to create resampler: {0}")]
    Resampler(String),

    #[error("Microphone stream already started")]
    AlreadyStarted,

    #[error("Capture thread error: {0}")]
    ThreadError(String),
}

/// Receives mono samples at the capture rate from the device callback.
pub type SampleSink = Box<dyn FnMut(&[f32]) + Send>;

/// Receives one encoded chunk per unmuted frame.
pub type ChunkSink = Arc<dyn Fn(EncodedChunk) + Send + Sync>;

/// An acquired microphone. Acquisition (and any permission prompt) happens
/// when the stream is opened; samples only flow once [`start`](Self::start)
/// installs a sink.
pub trait MicrophoneStream: Send {
    /// Begin delivering samples to `sink`.
    fn start(&mut self, sink: SampleSink) -> Result<(), CaptureError>;

    /// Stop delivering samples and release the device. Safe to call repeatedly.
    fn stop(&mut self);

    /// Rate of the samples delivered to the sink
    fn sample_rate(&self) -> u32;
}

/// Realtime input level snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioLevelSnapshot {
    /// Increments once per metered frame
    pub seq: u64,
    /// Root-mean-square amplitude in [0, 1].
    pub rms: f32,
    /// Peak (max absolute) amplitude in [0, 1].
    pub peak: f32,
}

#[derive(Debug, Default)]
struct LevelMeterInner {
    seq: AtomicU64,
    rms_bits: AtomicU32,
    peak_bits: AtomicU32,
}

/// Lock-free level meter written by the capture callback and read by the UI.
#[derive(Debug, Clone, Default)]
pub struct SharedLevelMeter {
    inner: Arc<LevelMeterInner>,
}

impl SharedLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, rms: f32, peak: f32) {
        self.inner.rms_bits.store(rms.to_bits(), Ordering::Relaxed);
        self.inner.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        self.inner.seq.fetch_add(1, Ordering::Release);
    }

    pub fn snapshot(&self) -> AudioLevelSnapshot {
        let seq = self.inner.seq.load(Ordering::Acquire);
        AudioLevelSnapshot {
            seq,
            rms: f32::from_bits(self.inner.rms_bits.load(Ordering::Relaxed)),
            peak: f32::from_bits(self.inner.peak_bits.load(Ordering::Relaxed)),
        }
    }

    /// Zero the level (the sequence keeps counting).
    pub fn clear(&self) {
        self.record(0.0, 0.0);
    }
}

/// RMS and peak of a block of samples.
pub fn frame_level(samples: &[f32]) -> (f32, f32) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut peak: f32 = 0.0;
    let mut sum_sq: f64 = 0.0;
    for &s in samples {
        peak = peak.max(s.abs());
        sum_sq += (s as f64) * (s as f64);
    }
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    (rms, peak)
}

/// Amplitude to dBFS; silence maps to negative infinity.
pub fn amp_to_dbfs(amp: f32) -> f32 {
    if !amp.is_finite() || amp <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * amp.log10()
    }
}

/// Regroups incoming samples into fixed windows and processes each one.
pub struct FrameSampler {
    frame_len: usize,
    sample_rate: u32,
    pending: Vec<f32>,
    muted: Arc<AtomicBool>,
    meter: SharedLevelMeter,
    on_chunk: ChunkSink,
    frames_seen: u64,
    frames_emitted: u64,
}

impl FrameSampler {
    pub fn new(
        frame_len: usize,
        sample_rate: u32,
        muted: Arc<AtomicBool>,
        meter: SharedLevelMeter,
        on_chunk: ChunkSink,
    ) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            sample_rate,
            pending: Vec::with_capacity(frame_len * 2),
            muted,
            meter,
            on_chunk,
            frames_seen: 0,
            frames_emitted: 0,
        }
    }

    /// Feed device samples; processes every complete frame.
    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
        let mut offset = 0;
        while self.pending.len() - offset >= self.frame_len {
            let end = offset + self.frame_len;
            let frame = &self.pending[offset..end];
            Self::process_frame(
                frame,
                self.sample_rate,
                &self.muted,
                &self.meter,
                &self.on_chunk,
                &mut self.frames_emitted,
            );
            self.frames_seen += 1;
            offset = end;
        }
        if offset > 0 {
            self.pending.drain(..offset);
        }
    }

    fn process_frame(
        frame: &[f32],
        sample_rate: u32,
        muted: &AtomicBool,
        meter: &SharedLevelMeter,
        on_chunk: &ChunkSink,
        frames_emitted: &mut u64,
    ) {
        let (rms, peak) = frame_level(frame);
        meter.record(rms, peak);

        // Read once per frame so a toggle never splits a frame.
        if muted.load(Ordering::Acquire) {
            log::trace!("Capture: frame muted (rms {:.4})", rms);
            return;
        }

        on_chunk(EncodedChunk::from_samples(frame, sample_rate));
        *frames_emitted += 1;
    }

    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Samples waiting for the next frame boundary
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Owns the live microphone stream for one call.
pub struct CapturePipeline {
    frame_len: usize,
    muted: Arc<AtomicBool>,
    meter: SharedLevelMeter,
    stream: Option<Box<dyn MicrophoneStream>>,
}

impl CapturePipeline {
    /// `muted` and `meter` are shared with the controller so mute can be toggled
    /// and levels read without touching the pipeline.
    pub fn new(frame_len: usize, muted: Arc<AtomicBool>, meter: SharedLevelMeter) -> Self {
        Self {
            frame_len,
            muted,
            meter,
            stream: None,
        }
    }

    /// Start sampling `stream`, invoking `on_chunk` for every unmuted frame.
    pub fn start(
        &mut self,
        mut stream: Box<dyn MicrophoneStream>,
        on_chunk: ChunkSink,
    ) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            stream.stop();
            return Err(CaptureError::AlreadyStarted);
        }

        let sample_rate = stream.sample_rate();
        if sample_rate != CAPTURE_SAMPLE_RATE {
            log::warn!(
                "Capture: stream delivers {} Hz but the wire expects {} Hz",
                sample_rate,
                CAPTURE_SAMPLE_RATE
            );
        }

        let mut sampler = FrameSampler::new(
            self.frame_len,
            sample_rate,
            self.muted.clone(),
            self.meter.clone(),
            on_chunk,
        );

        if let Err(e) = stream.start(Box::new(move |samples: &[f32]| sampler.push(samples))) {
            stream.stop();
            return Err(e);
        }

        log::info!(
            "Capture: started ({} samples per frame at {} Hz)",
            self.frame_len,
            sample_rate
        );
        self.stream = Some(stream);
        Ok(())
    }

    /// Disconnect the sampler and release the microphone.
    pub fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            log::info!("Capture: stopping");
            stream.stop();
            self.meter.clear();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn level_meter(&self) -> SharedLevelMeter {
        self.meter.clone()
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
