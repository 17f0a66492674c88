//! Gapless playback scheduling for audio received from the remote session.
//!
//! The scheduler keeps a single cursor: the earliest output-clock time at which
//! the next chunk may start. Every chunk starts at `max(now, cursor)` and pushes
//! the cursor forward by its own duration, so chunks play back-to-back no
//! matter how bursty their arrival is.

use crate::codec::{AudioFrame, CodecError, EncodedChunk};

/// Errors that can occur in the audio output path
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("No output device available")]
    NoOutputDevice,

    #[error("Failed to open audio output: {0}")]
    Open(String),

    #[error("Audio output is closed")]
    Closed,

    #[error("Failed to schedule audio: {0}")]
    Schedule(String),

    #[error("Failed to decode chunk: {0}")]
    Decode(#[from] CodecError),
}

/// A platform audio output with its own monotonic clock.
pub trait AudioOutput: Send {
    /// Current output clock time, in seconds
    fn current_time(&self) -> f64;

    /// Queue mono samples to start playing at `start_at` on the output clock.
    fn play_at(
        &mut self,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), PlaybackError>;

    /// Release the output. Must be safe to call more than once.
    fn close(&mut self);
}

/// Where a chunk landed on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start_time: f64,
    pub duration_secs: f64,
}

impl ScheduledChunk {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration_secs
    }
}

/// Playback statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackStats {
    pub chunks_scheduled: u64,
    pub failures: u64,
    /// Number of chunks that arrived after the cursor had already passed
    pub underruns: u64,
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    sample_rate: u32,
    cursor: f64,
    stats: PlaybackStats,
    closed: bool,
}

impl PlaybackScheduler {
    /// Create a scheduler playing at a fixed `sample_rate`.
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32) -> Self {
        let cursor = output.current_time();
        Self {
            output,
            sample_rate,
            cursor,
            stats: PlaybackStats::default(),
            closed: false,
        }
    }

    /// Move the cursor to the current output time.
    pub fn reset(&mut self) {
        self.cursor = self.output.current_time();
        log::debug!("Playback: cursor reset to {:.3}s", self.cursor);
    }

    /// Decode and schedule a chunk against the output's own clock.
    pub fn schedule_chunk(
        &mut self,
        chunk: &EncodedChunk,
    ) -> Result<ScheduledChunk, PlaybackError> {
        let now = self.output.current_time();
        self.schedule_chunk_at(chunk, now)
    }

    /// Decode and schedule a chunk given the current clock time.
    pub fn schedule_chunk_at(
        &mut self,
        chunk: &EncodedChunk,
        current_clock_time: f64,
    ) -> Result<ScheduledChunk, PlaybackError> {
        if let Some(rate) = chunk.sample_rate() {
            if rate != self.sample_rate {
                log::trace!(
                    "Playback: chunk declares {} Hz, playing at fixed {} Hz",
                    rate,
                    self.sample_rate
                );
            }
        }

        let frame = match chunk.decode_frame(self.sample_rate) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.failures += 1;
                return Err(e.into());
            }
        };
        self.schedule_frame(frame, current_clock_time)
    }

    /// Schedule an already-decoded frame.
    pub fn schedule_frame(
        &mut self,
        frame: AudioFrame,
        current_clock_time: f64,
    ) -> Result<ScheduledChunk, PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }

        let duration_secs = frame.duration_secs();
        if current_clock_time > self.cursor && self.stats.chunks_scheduled > 0 {
            self.stats.underruns += 1;
        }
        let start_time = current_clock_time.max(self.cursor);

        if let Err(e) = self
            .output
            .play_at(frame.into_samples(), self.sample_rate, start_time)
        {
            self.stats.failures += 1;
            return Err(e);
        }

        self.cursor = start_time + duration_secs;
        self.stats.chunks_scheduled += 1;

        log::trace!(
            "Playback: chunk at {:.3}s for {:.3}s (cursor {:.3}s)",
            start_time,
            duration_secs,
            self.cursor
        );

        Ok(ScheduledChunk {
            start_time,
            duration_secs,
        })
    }

    /// Earliest time the next chunk may start
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Close the underlying output. Later chunks are rejected.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output.close();
        log::debug!(
            "Playback: closed after {} chunks ({} failures, {} underruns)",
            self.stats.chunks_scheduled,
            self.stats.failures,
            self.stats.underruns
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct ManualClock(Arc<Mutex<ClockState>>);

    #[derive(Default)]
    struct ClockState {
        now: f64,
        starts: Vec<f64>,
        fail: bool,
        closed: u32,
    }

    impl AudioOutput for ManualClock {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }

        fn play_at(
            &mut self,
            _samples: Vec<f32>,
            _rate: u32,
            start_at: f64,
        ) -> Result<(), PlaybackError> {
            let mut state = self.0.lock().unwrap();
            if state.fail {
                return Err(PlaybackError::Schedule("device gone".to_string()));
            }
            state.starts.push(start_at);
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().closed += 1;
        }
    }

    fn chunk_of(secs: f64) -> EncodedChunk {
        let n = (secs * PLAYBACK_SAMPLE_RATE as f64).round() as usize;
        EncodedChunk::from_samples(&vec![0.1; n], PLAYBACK_SAMPLE_RATE)
    }

    #[test]
    fn test_back_to_back_without_timestamps() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock.clone()), PLAYBACK_SAMPLE_RATE);

        let first = scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();
        let second = scheduler.schedule_chunk(&chunk_of(0.5)).unwrap();

        assert!((first.duration_secs - 0.5).abs() < 1e-9);
        assert!((second.start_time - (first.start_time + 0.5)).abs() < 1e-9);
        assert_eq!(clock.0.lock().unwrap().starts.len(), 2);
    }

    #[test]
    fn test_never_starts_in_the_past() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock.clone()), PLAYBACK_SAMPLE_RATE);

        scheduler.schedule_chunk_at(&chunk_of(0.25), 0.0).unwrap();
        // Long gap in arrival: next chunk starts at "now", not at the stale cursor.
        let late = scheduler.schedule_chunk_at(&chunk_of(0.25), 3.0).unwrap();
        assert_eq!(late.start_time, 3.0);
        assert!((scheduler.cursor() - 3.25).abs() < 1e-9);
        assert_eq!(scheduler.stats().underruns, 1);
    }

    #[test]
    fn test_bursty_arrival_is_contiguous() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock), PLAYBACK_SAMPLE_RATE);

        let durations = [0.1, 0.4, 0.05, 0.3, 0.2];
        let arrivals = [0.0, 0.0, 0.0, 0.2, 0.2];
        let mut prev: Option<ScheduledChunk> = None;
        for (d, t) in durations.iter().zip(arrivals.iter()) {
            let s = scheduler.schedule_chunk_at(&chunk_of(*d), *t).unwrap();
            assert!(s.start_time >= *t);
            if let Some(p) = prev {
                assert!(s.start_time >= p.end_time() - 1e-9);
            }
            prev = Some(s);
        }
    }

    #[test]
    fn test_reset_moves_cursor_to_now() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock.clone()), PLAYBACK_SAMPLE_RATE);
        scheduler.schedule_chunk_at(&chunk_of(1.0), 0.0).unwrap();
        clock.0.lock().unwrap().now = 0.2;
        scheduler.reset();
        assert_eq!(scheduler.cursor(), 0.2);
    }

    #[test]
    fn test_output_failure_is_reported_and_cursor_kept() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock.clone()), PLAYBACK_SAMPLE_RATE);
        clock.0.lock().unwrap().fail = true;

        let result = scheduler.schedule_chunk(&chunk_of(0.5));
        assert!(matches!(result, Err(PlaybackError::Schedule(_))));
        assert_eq!(scheduler.cursor(), 0.0);
        assert_eq!(scheduler.stats().failures, 1);
    }

    #[test]
    fn test_plays_at_fixed_rate_regardless_of_mime() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock), PLAYBACK_SAMPLE_RATE);
        // 12000 samples labelled 16 kHz still play as 0.5 s at 24 kHz.
        let chunk = EncodedChunk::from_samples(&[0.0; 12000], CAPTURE_SAMPLE_RATE);
        let s = scheduler.schedule_chunk_at(&chunk, 0.0).unwrap();
        assert!((s.duration_secs - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_chunks() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock.clone()), PLAYBACK_SAMPLE_RATE);
        scheduler.close();
        scheduler.close();
        assert_eq!(clock.0.lock().unwrap().closed, 1);
        assert!(matches!(
            scheduler.schedule_chunk(&chunk_of(0.1)),
            Err(PlaybackError::Closed)
        ));
        drop(scheduler);
        assert_eq!(clock.0.lock().unwrap().closed, 1);
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let clock = ManualClock::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(clock), PLAYBACK_SAMPLE_RATE);
        let chunk = EncodedChunk {
            mime_type: "audio/pcm;rate=24000".to_string(),
            data: "AAE".to_string(),
        };
        assert!(matches!(
            scheduler.schedule_chunk(&chunk),
            Err(PlaybackError::Decode(_))
        ));
    }
}
