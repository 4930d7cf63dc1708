//! Wire format of the OpenAI Realtime API.
//!
//! Outbound messages are built with `json!`. Inbound messages are decoded
//! into [`ServerEvent`], an internally tagged enum that knows every message
//! type the server sends; anything else is a protocol error.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use super::RealtimeConfig;
use crate::audio::{pcm16_from_le_bytes, AudioFrame};
use crate::{Error, Result};

/// Turn-control commands accepted by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    CreateResponse,
    CancelResponse,
    CommitAudio,
    ClearAudio,
    AppendTextMessage(String),
}

impl ControlCommand {
    pub fn to_json(&self) -> Value {
        match self {
            ControlCommand::CreateResponse => json!({ "type": "response.create" }),
            ControlCommand::CancelResponse => json!({ "type": "response.cancel" }),
            ControlCommand::CommitAudio => json!({ "type": "input_audio_buffer.commit" }),
            ControlCommand::ClearAudio => json!({ "type": "input_audio_buffer.clear" }),
            ControlCommand::AppendTextMessage(text) => json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "user",
                    "content": [{ "type": "input_text", "text": text }],
                },
            }),
        }
    }
}

pub fn audio_append(frame: &AudioFrame) -> Value {
    json!({
        "type": "input_audio_buffer.append",
        "audio": BASE64.encode(frame.to_le_bytes()),
    })
}

/// First message after the handshake. Turn detection is off: the session
/// decides when a turn ends.
pub fn session_update(config: &RealtimeConfig) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": config.instructions,
            "voice": config.voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": Value::Null,
        },
    })
}

/// Event of one response turn, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The server accepted a `response.create`; carries no payload.
    ResponseStarted,
    TranscriptDelta {
        text: String,
    },
    AudioDelta {
        pcm: Vec<i16>,
    },
    TurnCompleted {
        final_transcript: String,
        final_audio: Option<Vec<i16>>,
    },
    Interrupted,
    Error {
        message: String,
    },
}

/// A stream event plus the server response it belongs to, when known.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub response_id: Option<String>,
    pub event: StreamEvent,
}

impl Inbound {
    fn new(response_id: Option<String>, event: StreamEvent) -> Self {
        Self { response_id, event }
    }
}

/// Server error codes that describe harmless races, not failures.
const BENIGN_ERROR_CODES: &[&str] = &["input_audio_buffer_commit_empty", "response_cancel_not_active"];

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_details: Option<StatusDetails>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(rename = "response.audio.delta")]
    AudioDelta { response_id: String, delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { response_id: String, delta: String },
    #[serde(rename = "response.text.delta")]
    TextDelta { response_id: String, delta: String },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseBody },
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseBody },
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "conversation.created")]
    ConversationCreated,
    #[serde(rename = "conversation.item.created")]
    ItemCreated,
    #[serde(rename = "conversation.item.truncated")]
    ItemTruncated,
    #[serde(rename = "conversation.item.deleted")]
    ItemDeleted,
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta,
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted,
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    InputTranscriptionFailed,
    #[serde(rename = "input_audio_buffer.committed")]
    BufferCommitted,
    #[serde(rename = "input_audio_buffer.cleared")]
    BufferCleared,
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded,
    #[serde(rename = "response.output_item.done")]
    OutputItemDone,
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded,
    #[serde(rename = "response.content_part.done")]
    ContentPartDone,
    #[serde(rename = "response.audio.done")]
    AudioDone,
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone,
    #[serde(rename = "response.text.done")]
    TextDone,
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta,
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone,
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated,
}

/// Decode one text message from the server.
///
/// Returns `Ok(None)` for messages that carry nothing the session acts on.
pub fn decode_server_event(text: &str) -> Result<Option<Inbound>> {
    let event: ServerEvent = serde_json::from_str(text).map_err(|e| {
        let kind = serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "<untyped>".into());
        Error::Protocol(format!("rejected server event {}: {}", kind, e))
    })?;

    let inbound = match event {
        ServerEvent::Error { error } => {
            let code = error.code.unwrap_or_default();
            if BENIGN_ERROR_CODES.contains(&code.as_str()) {
                log::debug!("[realtime] ignoring benign error {}", code);
                return Ok(None);
            }
            let message = error.message.unwrap_or_else(|| format!("server error {}", code));
            Inbound::new(None, StreamEvent::Error { message })
        }
        ServerEvent::AudioDelta { response_id, delta } => {
            let bytes = BASE64
                .decode(delta.as_bytes())
                .map_err(|e| Error::Protocol(format!("audio delta is not base64: {}", e)))?;
            let pcm = pcm16_from_le_bytes(&bytes)
                .ok_or_else(|| Error::Protocol("audio delta has odd byte count".into()))?;
            Inbound::new(Some(response_id), StreamEvent::AudioDelta { pcm })
        }
        ServerEvent::AudioTranscriptDelta { response_id, delta }
        | ServerEvent::TextDelta { response_id, delta } => {
            Inbound::new(Some(response_id), StreamEvent::TranscriptDelta { text: delta })
        }
        ServerEvent::ResponseDone { response } => {
            let event = match response.status.as_deref() {
                Some("cancelled") => StreamEvent::Interrupted,
                Some("failed") => StreamEvent::Error {
                    message: response
                        .status_details
                        .and_then(|d| d.error)
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| "response failed".into()),
                },
                _ => StreamEvent::TurnCompleted {
                    final_transcript: joined_transcript(&response.output),
                    final_audio: None,
                },
            };
            Inbound::new(Some(response.id), event)
        }
        ServerEvent::ResponseCreated { response } => {
            log::debug!("[realtime] response {} created", response.id);
            Inbound::new(Some(response.id), StreamEvent::ResponseStarted)
        }
        ServerEvent::SpeechStarted => Inbound::new(None, StreamEvent::Interrupted),
        other => {
            log::debug!("[realtime] {:?}", other);
            return Ok(None);
        }
    };
    Ok(Some(inbound))
}

fn joined_transcript(output: &[OutputItem]) -> String {
    output
        .iter()
        .flat_map(|item| item.content.iter())
        .filter_map(|part| part.transcript.as_deref().or(part.text.as_deref()))
        .collect::<Vec<_>>()
        .join(" ")
}
