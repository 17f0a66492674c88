//! Realtime session transports.
//!
//! A [`RealtimeConnector`] opens a remote session and hands back a
//! [`RealtimeLink`]: a command sender plus a stream of [`SessionEvent`]s. The
//! transport owns framing, auth and keepalive; the bridge only sees the events.

mod gemini;
pub mod protocol;

pub use gemini::{GeminiLiveConnector, DEFAULT_LIVE_ENDPOINT, DEFAULT_LIVE_MODEL};
pub use protocol::{ClientMessage, ServerMessage};

use crate::persona::Persona;
use crate::session::SessionEvent;
use async_trait::async_trait;
use protocol::{
    Content, GenerationConfig, PrebuiltVoiceConfig, SetupPayload, SpeechConfig, VoiceConfig,
    RESPONSE_MODALITY_AUDIO,
};
use tokio::sync::mpsc;

/// Errors that can occur while opening or driving a realtime session
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No API key configured for provider: {0}")]
    NoApiKey(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session transport is closed")]
    Closed,
}

/// Connect-time parameters derived from a persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSetup {
    pub model: String,
    pub instruction: String,
    pub voice: String,
}

impl SessionSetup {
    pub fn for_persona(persona: &Persona, model: &str) -> Self {
        Self {
            model: model.to_string(),
            instruction: persona.instruction.clone(),
            voice: persona.voice.clone(),
        }
    }

    fn normalize_model_name(model: &str) -> String {
        let trimmed = model.trim();
        if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{}", trimmed)
        }
    }

    /// The first message of the session: audio-only responses in the persona's voice.
    pub fn to_message(&self) -> ClientMessage {
        let instruction = self.instruction.trim();
        ClientMessage::Setup(SetupPayload {
            model: Self::normalize_model_name(&self.model),
            generation_config: GenerationConfig {
                response_modalities: vec![RESPONSE_MODALITY_AUDIO.to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: (!instruction.is_empty()).then(|| Content::text(instruction)),
        })
    }
}

/// Commands from the bridge to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Send(ClientMessage),
    Close,
}

/// The bridge's handle to an open session.
pub struct RealtimeLink {
    sender: LinkSender,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Cloneable sending half of a [`RealtimeLink`].
#[derive(Clone)]
pub struct LinkSender {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

/// The transport's side of a [`RealtimeLink`].
pub struct LinkEndpoint {
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl RealtimeLink {
    /// Create a connected link/endpoint pair.
    pub fn pair() -> (RealtimeLink, LinkEndpoint) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            RealtimeLink {
                sender: LinkSender {
                    commands: command_tx,
                },
                events: event_rx,
            },
            LinkEndpoint {
                commands: command_rx,
                events: event_tx,
            },
        )
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), LiveError> {
        self.sender.send(message)
    }

    pub fn close(&self) {
        self.sender.close();
    }

    /// Next transport event; `None` once the transport has gone away.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    pub fn into_split(self) -> (LinkSender, mpsc::UnboundedReceiver<SessionEvent>) {
        (self.sender, self.events)
    }
}

impl LinkSender {
    pub fn send(&self, message: ClientMessage) -> Result<(), LiveError> {
        self.commands
            .send(LinkCommand::Send(message))
            .map_err(|_| LiveError::Closed)
    }

    /// Request an orderly close. A transport that is already gone is fine.
    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl LinkEndpoint {
    /// Report an event to the bridge. Returns false once the bridge side is dropped.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub async fn recv_command(&mut self) -> Option<LinkCommand> {
        self.commands.recv().await
    }

    pub fn try_recv_command(&mut self) -> Option<LinkCommand> {
        self.commands.try_recv().ok()
    }
}

/// Opens realtime sessions
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    /// Open a session. The returned link reports [`SessionEvent::Opened`] once
    /// the remote side is ready for audio.
    async fn connect(&self, setup: &SessionSetup) -> Result<RealtimeLink, LiveError>;

    /// Get the connector name
    fn name(&self) -> &'static str;
}
