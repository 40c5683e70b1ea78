//! JSON text-frame protocol. Every message carries a `type` discriminator.

use serde::{Deserialize, Serialize};

/// Control messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Client started playing assistant audio.
    TtsStart,
    /// Client finished or stopped playing assistant audio.
    TtsStop,
    ClearHistory,
    /// Turn-detection speed, 0 (patient) to 100 (fast).
    SetSpeed { speed: f32 },
}

/// Events sent to the client, in send order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status { status: String, message: String },
    PartialUserRequest { content: String },
    FinalUserRequest { content: String },
    PartialAssistantAnswer { content: String },
    AssistantSentence { content: String, sentence_id: u64 },
    FinalAssistantAnswer { content: String },
    /// Base64-encoded PCM.
    TtsChunk { content: String },
    StopTts,
    TtsInterruption,
}

impl ServerMessage {
    pub fn status(status: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Status {
            status: status.into(),
            message: message.into(),
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Status { .. } => "status",
            ServerMessage::PartialUserRequest { .. } => "partial_user_request",
            ServerMessage::FinalUserRequest { .. } => "final_user_request",
            ServerMessage::PartialAssistantAnswer { .. } => "partial_assistant_answer",
            ServerMessage::AssistantSentence { .. } => "assistant_sentence",
            ServerMessage::FinalAssistantAnswer { .. } => "final_assistant_answer",
            ServerMessage::TtsChunk { .. } => "tts_chunk",
            ServerMessage::StopTts => "stop_tts",
            ServerMessage::TtsInterruption => "tts_interruption",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_parse_from_wire() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"set_speed","speed":75}"#).unwrap();
        assert_eq!(msg, ClientMessage::SetSpeed { speed: 75.0 });
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"tts_start"}"#).unwrap();
        assert_eq!(msg, ClientMessage::TtsStart);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn server_messages_use_snake_case_type_tags() {
        let sentence = ServerMessage::AssistantSentence {
            content: "Hello there.".into(),
            sentence_id: 1,
        };
        assert_eq!(
            serde_json::to_value(&sentence).unwrap(),
            json!({"type": "assistant_sentence", "content": "Hello there.", "sentence_id": 1})
        );
        assert_eq!(serde_json::to_value(ServerMessage::StopTts).unwrap(), json!({"type": "stop_tts"}));
        assert_eq!(ServerMessage::TtsInterruption.kind(), "tts_interruption");
    }
}
