//! Realtime duplex audio bridge for persona voice calls.
//!
//! Microphone audio is framed, encoded as 16-bit PCM and streamed to a remote
//! realtime session; audio coming back is decoded and scheduled for gapless
//! playback. [`CallBridge`] owns the call state machine and is the entry point.

pub mod audio;
pub mod audio_capture;
pub mod backend;
pub mod bridge;
pub mod call_log;
pub mod capture;
pub mod codec;
pub mod live;
pub mod persona;
pub mod playback;
pub mod session;
pub mod settings;

#[cfg(test)]
mod tests;

pub use backend::{AudioBackend, DeviceAudioBackend};
pub use bridge::{CallBridge, CallError, CallPhase, CallStatus, ConnectionStatus, EndReason};
pub use call_log::{CallLogStore, CallOutcome, CallRecord};
pub use capture::{AudioLevelSnapshot, SharedLevelMeter};
pub use live::{GeminiLiveConnector, RealtimeConnector, RealtimeLink, SessionSetup};
pub use persona::{default_personas, find_persona, Persona};
pub use settings::{BridgeSettings, SettingsError};

/// Initialize the `log` backend. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}
