//! JSON messages of the Gemini Live `BidiGenerateContent` websocket.
//!
//! Only the parts the bridge uses are modelled. Unknown fields in server
//! messages are ignored.

use crate::codec::EncodedChunk;
use serde::{Deserialize, Serialize};

/// Response modality requested at setup. The bridge only asks for audio.
pub const RESPONSE_MODALITY_AUDIO: &str = "AUDIO";

/// Messages sent from the bridge to the remote session.
///
/// Serializes externally tagged: `{"setup": {...}}` / `{"realtimeInput": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupPayload),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    /// Wrap one captured chunk for transmission.
    pub fn audio(chunk: EncodedChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }

    /// The audio carried by a realtime input message, if any
    pub fn media_chunks(&self) -> &[EncodedChunk] {
        match self {
            ClientMessage::RealtimeInput(input) => &input.media_chunks,
            ClientMessage::Setup(_) => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedChunk>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part {
                text: Some(text.into()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<EncodedChunk>,
}

/// A message received from the remote session.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
    #[serde(default)]
    pub interrupted: Option<bool>,
}

impl ServerMessage {
    /// Parse one websocket payload.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Audio payload at `serverContent.modelTurn.parts[0].inlineData`.
    pub fn audio_chunk(&self) -> Option<&EncodedChunk> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.turn_complete)
            .unwrap_or(false)
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|c| c.interrupted)
            .unwrap_or(false)
    }

    /// Build an audio-carrying message, mostly for fakes.
    pub fn with_audio(chunk: EncodedChunk) -> Self {
        Self {
            server_content: Some(ServerContent {
                model_turn: Some(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part {
                        text: None,
                        inline_data: Some(chunk),
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audio_message_shape() {
        let chunk = EncodedChunk {
            mime_type: "audio/pcm;rate=16000".to_string(),
            data: "AAAA".to_string(),
        };
        let value = serde_json::to_value(ClientMessage::audio(chunk)).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}]
                }
            })
        );
    }

    #[test]
    fn test_setup_message_shape() {
        let msg = ClientMessage::Setup(SetupPayload {
            model: "models/m".to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec![RESPONSE_MODALITY_AUDIO.to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: "Puck".to_string(),
                        },
                    },
                }),
            },
            system_instruction: Some(Content::text("Be nice.")),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["setup"]["model"], "models/m");
        assert_eq!(value["setup"]["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        let voice = &value["setup"]["generationConfig"]["speechConfig"]["voiceConfig"];
        assert_eq!(voice["prebuiltVoiceConfig"]["voiceName"], "Puck");
        assert_eq!(value["setup"]["systemInstruction"]["parts"][0]["text"], "Be nice.");
        assert!(value["setup"]["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn test_parse_audio_turn() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAE="}}]
                }
            }
        }"#;
        let msg = ServerMessage::parse(raw).unwrap();
        let chunk = msg.audio_chunk().unwrap();
        assert_eq!(chunk.mime_type, "audio/pcm;rate=24000");
        assert_eq!(chunk.data, "AAE=");
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn test_parse_non_audio_messages() {
        let setup = ServerMessage::parse(r#"{"setupComplete": {}}"#).unwrap();
        assert!(setup.is_setup_complete());
        assert!(setup.audio_chunk().is_none());

        let text_turn = ServerMessage::parse(
            r#"{"serverContent": {"modelTurn": {"parts": [{"text": "hi"}]}}}"#,
        )
        .unwrap();
        assert!(text_turn.audio_chunk().is_none());

        let done = ServerMessage::parse(
            r#"{"serverContent": {"turnComplete": true}, "usageMetadata": {}}"#,
        )
        .unwrap();
        assert!(done.is_turn_complete());
        assert!(done.audio_chunk().is_none());
    }
}
