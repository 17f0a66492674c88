//! Session lifecycle state machine.
//!
//! Transport callbacks arrive as [`SessionEvent`]s and [`SessionManager::handle_event`]
//! turns each one into at most one [`SessionAction`] for the controller to carry
//! out. The manager does no I/O itself.

use crate::codec::EncodedChunk;
use crate::live::protocol::{ClientMessage, ServerMessage};

/// Lifecycle of one remote session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Closed,
    Errored,
}

impl SessionState {
    /// Session is open or opening
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// Outbound audio may be transmitted
    pub fn can_send(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

/// Events reported by the realtime transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The remote session is ready to exchange audio
    Opened,
    Message(ServerMessage),
    /// The remote side closed the session
    Closed { reason: Option<String> },
    Errored(String),
}

/// Why the session asked for teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownCause {
    RemoteClosed(Option<String>),
    RemoteError(String),
}

/// What the controller must do in response to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Start the capture pipeline
    StartCapture,
    /// Decode and schedule received audio
    Schedule(EncodedChunk),
    Teardown(TeardownCause),
}

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub chunks_sent: u64,
    /// Frames produced while the session could not send
    pub chunks_dropped: u64,
    pub chunks_received: u64,
    pub messages_ignored: u64,
}

#[derive(Debug)]
pub struct SessionManager {
    state: SessionState,
    counters: SessionCounters,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            counters: SessionCounters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters
    }

    /// Mark a connect as issued. Only valid from `Idle`.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != SessionState::Idle {
            log::warn!("Session: connect requested in state {:?}", self.state);
            return false;
        }
        self.state = SessionState::Connecting;
        log::debug!("Session: connecting");
        true
    }

    /// Apply a transport event.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<SessionAction> {
        match event {
            SessionEvent::Opened => {
                if self.state != SessionState::Connecting {
                    log::debug!("Session: ignoring open in state {:?}", self.state);
                    return None;
                }
                self.state = SessionState::Connected;
                log::info!("Session: connected");
                Some(SessionAction::StartCapture)
            }
            SessionEvent::Message(message) => {
                if !self.state.can_send() {
                    log::debug!("Session: dropping message in state {:?}", self.state);
                    return None;
                }
                match message.audio_chunk() {
                    Some(chunk) => {
                        self.counters.chunks_received += 1;
                        Some(SessionAction::Schedule(chunk.clone()))
                    }
                    None => {
                        self.counters.messages_ignored += 1;
                        if message.is_interrupted() {
                            log::debug!("Session: remote turn interrupted");
                        }
                        None
                    }
                }
            }
            SessionEvent::Closed { reason } => {
                if !self.state.is_live() {
                    return None;
                }
                self.state = SessionState::Closed;
                log::info!(
                    "Session: closed by remote ({})",
                    reason.as_deref().unwrap_or("no reason")
                );
                Some(SessionAction::Teardown(TeardownCause::RemoteClosed(reason)))
            }
            SessionEvent::Errored(message) => {
                if !self.state.is_live() {
                    return None;
                }
                self.state = SessionState::Errored;
                log::error!("Session error: {}", message);
                Some(SessionAction::Teardown(TeardownCause::RemoteError(message)))
            }
        }
    }

    /// Wrap a captured chunk for sending, or drop it when not connected.
    pub fn outbound(&mut self, chunk: EncodedChunk) -> Option<ClientMessage> {
        if !self.state.can_send() {
            self.counters.chunks_dropped += 1;
            log::trace!("Session: dropped frame in state {:?}", self.state);
            return None;
        }
        self.counters.chunks_sent += 1;
        Some(ClientMessage::audio(chunk))
    }

    /// Local close. Returns whether a live session was closed; calling it on an
    /// idle or already-closed session is a no-op.
    pub fn close(&mut self) -> bool {
        if !self.state.is_live() {
            return false;
        }
        self.state = SessionState::Closed;
        log::debug!("Session: closed locally");
        true
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};

    fn captured() -> EncodedChunk {
        EncodedChunk::from_samples(&[0.0; 16], CAPTURE_SAMPLE_RATE)
    }

    fn audio_message() -> ServerMessage {
        ServerMessage::with_audio(EncodedChunk::from_samples(&[0.0; 24], PLAYBACK_SAMPLE_RATE))
    }

    fn connected() -> SessionManager {
        let mut session = SessionManager::new();
        assert!(session.begin_connect());
        assert_eq!(session.handle_event(SessionEvent::Opened), Some(SessionAction::StartCapture));
        session
    }

    #[test]
    fn test_open_starts_capture() {
        let session = connected();
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_open_only_from_connecting() {
        let mut session = SessionManager::new();
        assert_eq!(session.handle_event(SessionEvent::Opened), None);
        assert_eq!(session.state(), SessionState::Idle);

        let mut session = connected();
        assert!(session.close());
        assert_eq!(session.handle_event(SessionEvent::Opened), None);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_frames_dropped_until_connected() {
        let mut session = SessionManager::new();
        assert!(session.outbound(captured()).is_none());
        session.begin_connect();
        assert!(session.outbound(captured()).is_none());

        session.handle_event(SessionEvent::Opened);
        let message = session.outbound(captured()).unwrap();
        assert_eq!(message.media_chunks().len(), 1);

        session.close();
        assert!(session.outbound(captured()).is_none());

        let counters = session.counters();
        assert_eq!(counters.chunks_sent, 1);
        assert_eq!(counters.chunks_dropped, 3);
    }

    #[test]
    fn test_audio_message_is_scheduled() {
        let mut session = connected();
        match session.handle_event(SessionEvent::Message(audio_message())) {
            Some(SessionAction::Schedule(chunk)) => {
                assert_eq!(chunk.mime_type, "audio/pcm;rate=24000")
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(session.counters().chunks_received, 1);
    }

    #[test]
    fn test_non_audio_message_ignored() {
        let mut session = connected();
        let text = ServerMessage::parse(r#"{"serverContent": {"turnComplete": true}}"#).unwrap();
        assert_eq!(session.handle_event(SessionEvent::Message(text)), None);
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.counters().messages_ignored, 1);
    }

    #[test]
    fn test_message_before_open_not_scheduled() {
        let mut session = SessionManager::new();
        session.begin_connect();
        assert_eq!(session.handle_event(SessionEvent::Message(audio_message())), None);
    }

    #[test]
    fn test_remote_close_requests_teardown_once() {
        let mut session = connected();
        let action = session.handle_event(SessionEvent::Closed {
            reason: Some("bye".to_string()),
        });
        assert_eq!(
            action,
            Some(SessionAction::Teardown(TeardownCause::RemoteClosed(Some("bye".to_string()))))
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.handle_event(SessionEvent::Closed { reason: None }), None);
        assert_eq!(session.handle_event(SessionEvent::Errored("late".to_string())), None);
    }

    #[test]
    fn test_error_while_connecting() {
        let mut session = SessionManager::new();
        session.begin_connect();
        let action = session.handle_event(SessionEvent::Errored("handshake failed".to_string()));
        assert_eq!(
            action,
            Some(SessionAction::Teardown(TeardownCause::RemoteError(
                "handshake failed".to_string()
            )))
        );
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[test]
    fn test_close_is_tolerant() {
        let mut session = SessionManager::new();
        assert!(!session.close());
        session.begin_connect();
        assert!(session.close());
        assert!(!session.close());
        assert!(!session.begin_connect());
    }
}
