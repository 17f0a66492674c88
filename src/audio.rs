//! Speaker output using rodio.
//!
//! The rodio `OutputStream` stays on its own thread for its whole life. Chunks
//! are added to the stream's mixer with a silence lead-in, so a chunk asked to
//! start at `t` begins `t - now` seconds after it is queued. The output clock is
//! wall time since the output was opened.

use crate::playback::{AudioOutput, PlaybackError};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Source};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Commands sent to the playback thread
enum OutputCommand {
    Play {
        samples: Vec<f32>,
        sample_rate: u32,
        delay: Duration,
    },
    Close,
}

/// Silence before a chunk that should start `start_at` seconds into the clock.
pub(crate) fn lead_in(start_at: f64, now: f64) -> Duration {
    Duration::from_secs_f64((start_at - now).max(0.0))
}

/// Default speaker as an [`AudioOutput`].
pub struct RodioOutput {
    epoch: Instant,
    command_tx: Option<mpsc::Sender<OutputCommand>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn open_default() -> Result<Self, PlaybackError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_handle = thread::Builder::new()
            .name("voicecall-playback".to_string())
            .spawn(move || run_output_thread(command_rx, ready_tx))
            .map_err(|e| PlaybackError::Open(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread_handle.join();
                return Err(PlaybackError::Open(
                    "playback thread exited before the stream opened".to_string(),
                ));
            }
        }

        log::info!("Speaker: default output opened");
        Ok(Self {
            epoch: Instant::now(),
            command_tx: Some(command_tx),
            thread_handle: Some(thread_handle),
        })
    }
}

impl AudioOutput for RodioOutput {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn play_at(
        &mut self,
        samples: Vec<f32>,
        sample_rate: u32,
        start_at: f64,
    ) -> Result<(), PlaybackError> {
        let tx = self.command_tx.as_ref().ok_or(PlaybackError::Closed)?;
        let delay = lead_in(start_at, self.current_time());
        tx.send(OutputCommand::Play {
            samples,
            sample_rate,
            delay,
        })
        .map_err(|_| PlaybackError::Schedule("playback thread is gone".to_string()))
    }

    fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(OutputCommand::Close);
            log::info!("Speaker: output closed");
        }
        // Not joined: the thread exits on its own once queued audio has played.
        self.thread_handle.take();
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_output_thread(
    command_rx: mpsc::Receiver<OutputCommand>,
    ready_tx: mpsc::Sender<Result<(), PlaybackError>>,
) {
    let stream = match OutputStreamBuilder::open_default_stream() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::Open(e.to_string())));
            return;
        }
    };

    // Track when the last queued chunk ends so already-scheduled audio can
    // play out after close.
    let mut drain_until = Instant::now();

    while let Ok(command) = command_rx.recv() {
        match command {
            OutputCommand::Play {
                samples,
                sample_rate,
                delay,
            } => {
                let duration =
                    Duration::from_secs_f64(samples.len() as f64 / sample_rate.max(1) as f64);
                drain_until = drain_until.max(Instant::now() + delay + duration);
                let source =
                    SamplesBuffer::new(crate::codec::CHANNELS, sample_rate, samples).delay(delay);
                stream.mixer().add(source);
            }
            OutputCommand::Close => break,
        }
    }

    // Dropping the stream cuts off whatever is still queued.
    let remaining = drain_until.saturating_duration_since(Instant::now());
    if !remaining.is_zero() {
        log::debug!("Speaker: letting {:.2}s of queued audio finish", remaining.as_secs_f64());
        thread::sleep(remaining);
    }
    drop(stream);
}
