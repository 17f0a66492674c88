//! Microphone input using cpal.
//!
//! The cpal stream lives on a dedicated thread because `cpal::Stream` is not
//! `Send`. Opening a [`CpalMicrophone`] acquires the device right away; the
//! samples it produces are dropped until the capture pipeline installs a sink.

use crate::capture::{CaptureError, MicrophoneStream, SampleSink};
use crate::codec::CAPTURE_SAMPLE_RATE;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use rubato::{FftFixedIn, Resampler};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Device samples fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Commands sent to the audio capture thread
enum CaptureCommand {
    Stop,
}

type SinkSlot = Arc<StdMutex<Option<SampleSink>>>;

/// Handle to a running capture thread
struct CaptureHandle {
    command_tx: mpsc::Sender<CaptureCommand>,
    thread_handle: JoinHandle<()>,
}

/// A live cpal input stream delivering mono samples at the capture rate.
pub struct CpalMicrophone {
    device_name: String,
    sink: SinkSlot,
    capture_handle: Option<CaptureHandle>,
}

impl CpalMicrophone {
    /// Open the named input device (or the default one) and start the stream.
    pub fn open(device_name: Option<&str>) -> Result<Self, CaptureError> {
        let sink: SinkSlot = Arc::new(StdMutex::new(None));
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_sink = sink.clone();
        let requested = device_name.map(str::to_string);
        let thread_handle = thread::Builder::new()
            .name("voicecall-capture".to_string())
            .spawn(move || run_capture_thread(requested, thread_sink, command_rx, ready_tx))
            .map_err(|e| CaptureError::ThreadError(e.to_string()))?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread_handle.join();
                return Err(CaptureError::ThreadError(
                    "capture thread exited before the stream started".to_string(),
                ));
            }
        };

        log::info!("Microphone: opened '{}'", device_name);
        Ok(Self {
            device_name,
            sink,
            capture_handle: Some(CaptureHandle {
                command_tx,
                thread_handle,
            }),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl MicrophoneStream for CpalMicrophone {
    fn start(&mut self, sink: SampleSink) -> Result<(), CaptureError> {
        if self.capture_handle.is_none() {
            return Err(CaptureError::ThreadError("microphone already released".to_string()));
        }
        let mut slot = self
            .sink
            .lock()
            .map_err(|_| CaptureError::ThreadError("sink lock poisoned".to_string()))?;
        if slot.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        *slot = Some(sink);
        Ok(())
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.sink.lock() {
            slot.take();
        }
        if let Some(handle) = self.capture_handle.take() {
            log::info!("Microphone: releasing '{}'", self.device_name);
            // Ignore error if thread already stopped
            let _ = handle.command_tx.send(CaptureCommand::Stop);
            let _ = handle.thread_handle.join();
        }
    }

    fn sample_rate(&self) -> u32 {
        CAPTURE_SAMPLE_RATE
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find an input device by exact name
fn find_device_by_name(host: &cpal::Host, name: &str) -> Option<cpal::Device> {
    host.input_devices()
        .ok()?
        .find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Try to find a supported config with the target sample rate
fn find_config_with_sample_rate(
    device: &cpal::Device,
    target_rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    device.supported_input_configs().ok()?.find_map(|range| {
        let fits =
            range.min_sample_rate().0 <= target_rate && target_rate <= range.max_sample_rate().0;
        fits.then(|| range.with_sample_rate(SampleRate(target_rate)))
    })
}

/// Average interleaved frames down to one channel.
pub(crate) fn downmix_to_mono(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Per-stream sample processing run inside the cpal callback.
struct InputProcessor {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    sink: SinkSlot,
}

impl InputProcessor {
    fn new(channels: usize, device_rate: u32, sink: SinkSlot) -> Result<Self, CaptureError> {
        let resampler = if device_rate != CAPTURE_SAMPLE_RATE {
            let r = FftFixedIn::new(
                device_rate as usize,
                CAPTURE_SAMPLE_RATE as usize,
                RESAMPLE_CHUNK,
                1,
                1,
            )
            .map_err(|e| CaptureError::Resampler(e.to_string()))?;
            Some(r)
        } else {
            None
        };

        Ok(Self {
            channels,
            resampler,
            pending: Vec::with_capacity(RESAMPLE_CHUNK * 2),
            sink,
        })
    }

    fn process(&mut self, interleaved: &[f32]) {
        let mono = downmix_to_mono(interleaved, self.channels);

        let samples = match self.resampler.as_mut() {
            None => mono,
            Some(r) => {
                self.pending.extend_from_slice(&mono);
                let mut out = Vec::new();
                while self.pending.len() >= RESAMPLE_CHUNK {
                    let chunk: Vec<f32> = self.pending.drain(..RESAMPLE_CHUNK).collect();
                    match r.process(&[chunk], None) {
                        Ok(resampled) => {
                            if let Some(channel) = resampled.first() {
                                out.extend_from_slice(channel);
                            }
                        }
                        Err(e) => log::warn!("Microphone: resample failed: {}", e),
                    }
                }
                out
            }
        };

        if samples.is_empty() {
            return;
        }
        if let Ok(mut slot) = self.sink.lock() {
            if let Some(sink) = slot.as_mut() {
                sink(&samples);
            }
        }
    }
}

/// Run the audio capture in a dedicated thread
fn run_capture_thread(
    device_name: Option<String>,
    sink: SinkSlot,
    command_rx: mpsc::Receiver<CaptureCommand>,
    ready_tx: mpsc::Sender<Result<String, CaptureError>>,
) {
    let stream = match build_stream(device_name.as_deref(), sink) {
        Ok((stream, name)) => {
            let _ = ready_tx.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Wait for stop command
    loop {
        match command_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(CaptureCommand::Stop) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Stream is dropped here, stopping capture
    drop(stream);
}

fn build_stream(
    device_name: Option<&str>,
    sink: SinkSlot,
) -> Result<(cpal::Stream, String), CaptureError> {
    use cpal::Sample;

    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => match find_device_by_name(&host, name) {
            Some(d) => d,
            None => {
                log::warn!("Microphone: '{}' not found, falling back to default", name);
                host.default_input_device().ok_or(CaptureError::NoInputDevice)?
            }
        },
        None => host.default_input_device().ok_or(CaptureError::NoInputDevice)?,
    };
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let config = match find_config_with_sample_rate(&device, CAPTURE_SAMPLE_RATE) {
        Some(config) => config,
        None => {
            let config = device
                .default_input_config()
                .map_err(|e| CaptureError::DeviceConfig(e.to_string()))?;
            log::info!(
                "Microphone: device has no {} Hz mode, resampling from {} Hz",
                CAPTURE_SAMPLE_RATE,
                config.sample_rate().0
            );
            config
        }
    };

    log::info!(
        "Microphone config: {} Hz, {} channels, {:?}",
        config.sample_rate().0,
        config.channels(),
        config.sample_format()
    );

    let sample_format = config.sample_format();
    let stream_config: cpal::StreamConfig = config.into();
    let mut processor = InputProcessor::new(
        stream_config.channels as usize,
        stream_config.sample_rate.0,
        sink,
    )?;

    let err_fn = |err| {
        log::error!("Microphone stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| processor.process(data),
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                processor.process(&samples);
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &stream_config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                processor.process(&samples);
            },
            err_fn,
            None,
        ),
        other => {
            return Err(CaptureError::DeviceConfig(format!(
                "Unsupported sample format: {:?}",
                other
            )));
        }
    }
    .map_err(|e| match e {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoInputDevice,
        // cpal reports a refused microphone as a generic backend failure.
        other => CaptureError::PermissionDenied(other.to_string()),
    })?;

    stream
        .play()
        .map_err(|e| CaptureError::PermissionDenied(e.to_string()))?;

    Ok((stream, name))
}

/// Basic description of an input device
#[derive(Debug, Clone, Serialize)]
pub struct InputDeviceInfo {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Get the list of available input devices
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Get information about the default input device
pub fn default_input_device_info() -> Option<InputDeviceInfo> {
    let host = cpal::default_host();
    let device = host.default_input_device()?;
    let name = device.name().ok()?;
    let config = device.default_input_config().ok()?;
    Some(InputDeviceInfo {
        name,
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    })
}
