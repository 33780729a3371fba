//! JSON envelopes exchanged with the inference backend.
//!
//! Every frame is a text frame holding one object with a `type` discriminator.
//! Binary payloads travel base64-encoded (standard alphabet, padded).

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::capture::AudioBlob;
use crate::error::Result;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One finalized capture.
    Audio { audio: String, mime: String },
}

impl ClientMessage {
    pub fn audio(blob: &AudioBlob) -> Self {
        ClientMessage::Audio {
            audio: STANDARD.encode(&blob.bytes),
            mime: blob.mime.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// What the backend heard.
    Transcription { text: String },
    /// Assistant's text reply; precedes the audio.
    Response { text: String },
    /// Synthesized reply speech in the server's playback codec (MP3).
    Audio { audio: String },
    /// Advisory: the backend started a web search.
    SearchStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Transcription { .. } => "transcription",
            ServerMessage::Response { .. } => "response",
            ServerMessage::Audio { .. } => "audio",
            ServerMessage::SearchStarted { .. } => "search_started",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Decode a base64 audio payload.
pub fn decode_audio(payload: &str) -> Result<Vec<u8>> {
    Ok(STANDARD.decode(payload.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParleyError;
    use std::time::Duration;

    #[test]
    fn outbound_audio_envelope_shape() {
        let blob = AudioBlob {
            bytes: vec![1, 2, 3, 4],
            mime: "audio/wav".into(),
            duration: Duration::from_millis(500),
        };
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::audio(&blob).to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "audio");
        assert_eq!(json["audio"], "AQIDBA==");
        assert_eq!(json["mime"], "audio/wav");
    }

    #[test]
    fn inbound_messages_parse_by_type() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"transcription","text":"hi"}"#).unwrap(),
            ServerMessage::Transcription { text: "hi".into() }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"search_started"}"#).unwrap(),
            ServerMessage::SearchStarted { message: None }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"search_started","message":"Searching..."}"#).unwrap(),
            ServerMessage::SearchStarted {
                message: Some("Searching...".into())
            }
        );
        let err = ServerMessage::parse(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(err.kind(), "error");
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        assert!(matches!(
            ServerMessage::parse(r#"{"type":"telemetry"}"#),
            Err(ParleyError::Protocol(_))
        ));
    }

    #[test]
    fn audio_payload_decodes() {
        assert_eq!(decode_audio("AQIDBA==").unwrap(), vec![1, 2, 3, 4]);
        assert!(matches!(decode_audio("***"), Err(ParleyError::Protocol(_))));
    }
}
