//! Gemini Live API transport over a websocket.

use super::{LinkCommand, LinkEndpoint, LiveError, RealtimeConnector, RealtimeLink, SessionSetup};
use crate::live::protocol::ServerMessage;
use crate::session::SessionEvent;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_LIVE_ENDPOINT: &str = concat!(
    "wss://generativelanguage.googleapis.com/ws/",
    "google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent"
);
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Realtime connector for the Gemini Live `BidiGenerateContent` service.
///
/// The model is part of each [`SessionSetup`], not of the connector.
pub struct GeminiLiveConnector {
    api_key: String,
    endpoint: String,
}

impl GeminiLiveConnector {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }

    fn session_url(&self) -> Result<String, LiveError> {
        let endpoint = self.endpoint.trim();
        if !(endpoint.starts_with("wss://") || endpoint.starts_with("ws://")) {
            return Err(LiveError::Config(format!(
                "live endpoint must be a websocket URL: {}",
                endpoint
            )));
        }
        let sep = if endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", endpoint, sep, self.api_key.trim()))
    }
}

/// Turn one websocket payload into a session event.
///
/// `setupComplete` opens the session; every other parsed message is passed on.
fn event_from_payload(payload: &[u8]) -> Option<SessionEvent> {
    let message: ServerMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("GeminiLive: ignoring unparseable frame: {}", e);
            return None;
        }
    };

    if message.is_setup_complete() {
        return Some(SessionEvent::Opened);
    }
    if message.go_away.is_some() {
        log::warn!("GeminiLive: server announced disconnect: {:?}", message.go_away);
    }
    Some(SessionEvent::Message(message))
}

async fn pump<S>(ws: S, mut endpoint: LinkEndpoint)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            command = endpoint.recv_command() => match command {
                Some(LinkCommand::Send(message)) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            log::error!("GeminiLive: failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(text)).await {
                        endpoint.emit(SessionEvent::Errored(e.to_string()));
                        break;
                    }
                }
                Some(LinkCommand::Close) | None => {
                    log::debug!("GeminiLive: closing websocket");
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = event_from_payload(text.as_bytes()) {
                        endpoint.emit(event);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(event) = event_from_payload(&bytes) {
                        endpoint.emit(event);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    endpoint.emit(SessionEvent::Closed { reason });
                    break;
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    endpoint.emit(SessionEvent::Errored(e.to_string()));
                    break;
                }
                None => {
                    endpoint.emit(SessionEvent::Closed { reason: None });
                    break;
                }
            },
        }
    }

    log::debug!("GeminiLive: transport finished");
}

#[async_trait]
impl RealtimeConnector for GeminiLiveConnector {
    async fn connect(&self, setup: &SessionSetup) -> Result<RealtimeLink, LiveError> {
        if self.api_key.trim().is_empty() {
            return Err(LiveError::NoApiKey("gemini".to_string()));
        }

        let url = self.session_url()?;
        // wss:// needs a process-wide rustls provider; an existing one is kept.
        let _ = rustls::crypto::ring::default_provider().install_default();
        log::info!("GeminiLive: connecting (model {})", setup.model);

        let (mut ws, _response) = tokio_tungstenite::connect_async(url).await?;

        let setup_text = serde_json::to_string(&setup.to_message())?;
        ws.send(Message::Text(setup_text)).await?;
        log::debug!("GeminiLive: setup sent, waiting for setupComplete");

        let (link, endpoint) = RealtimeLink::pair();
        tokio::spawn(pump(ws, endpoint));
        Ok(link)
    }

    fn name(&self) -> &'static str {
        "gemini-live"
    }
}
