//! Platform audio devices behind one seam so the bridge can run against fakes.

use crate::audio::RodioOutput;
use crate::audio_capture::CpalMicrophone;
use crate::capture::{CaptureError, MicrophoneStream};
use crate::playback::{AudioOutput, PlaybackError};

/// Opens the microphone and speaker for a call.
///
/// Both calls may block (device negotiation, permission prompts), so the
/// bridge invokes them from a blocking task.
pub trait AudioBackend: Send + Sync {
    /// Acquire the microphone. Samples must not flow until the returned stream
    /// is started.
    fn open_microphone(&self) -> Result<Box<dyn MicrophoneStream>, CaptureError>;

    /// Open the audio output context.
    fn open_output(&self) -> Result<Box<dyn AudioOutput>, PlaybackError>;

    fn name(&self) -> &'static str;
}

/// cpal microphone + rodio speaker.
#[derive(Debug, Clone, Default)]
pub struct DeviceAudioBackend {
    input_device_name: Option<String>,
}

impl DeviceAudioBackend {
    pub fn new(input_device_name: Option<String>) -> Self {
        Self { input_device_name }
    }
}

impl AudioBackend for DeviceAudioBackend {
    fn open_microphone(&self) -> Result<Box<dyn MicrophoneStream>, CaptureError> {
        let mic = CpalMicrophone::open(self.input_device_name.as_deref())?;
        Ok(Box::new(mic))
    }

    fn open_output(&self) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        Ok(Box::new(RodioOutput::open_default()?))
    }

    fn name(&self) -> &'static str {
        "cpal+rodio"
    }
}
