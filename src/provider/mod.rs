//! Streaming speech-to-text services feeding the live local transcript.
//!
//! A provider only knows its own wire dialect: how to open the stream
//! ([`StreamSetup`]) and what each server message means ([`SttEvent`]).
//! [`session::run_recognition`] drives the socket.

mod deepgram;
mod openai;
pub mod session;

use std::time::Duration;

use serde_json::Value;

pub use deepgram::DeepgramProvider;
pub use openai::OpenAiProvider;

/// Meaning of one provider message.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Whole current utterance, still open to revision.
    Partial(String),
    /// Utterance the service will not revise any more.
    Utterance(String),
    Failed(String),
}

/// How a block of PCM16 audio travels to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFraming {
    /// Base64 audio inside a `{"type": message_type, field: ...}` text message.
    JsonBase64 {
        message_type: &'static str,
        field: &'static str,
    },
    /// Little-endian bytes in a binary message.
    Binary,
}

#[derive(Debug, Clone)]
pub struct StreamSetup {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Sent once, right after the handshake.
    pub greeting: Option<Value>,
    pub framing: AudioFraming,
    /// Asks the service to finalize buffered audio when capture ends.
    pub finalize: Option<Value>,
    pub goodbye: Option<Value>,
    /// Idle keepalive message and its period.
    pub keepalive: Option<(Value, Duration)>,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub transcription_model: String,
    pub language: String,
}

pub trait SttProvider: Send {
    /// Short name used as the log tag.
    fn label(&self) -> &'static str;
    fn setup(&self, settings: &ProviderSettings) -> StreamSetup;
    fn on_message(&mut self, text: &str) -> Vec<SttEvent>;
    /// Stream is over; report whatever was never closed as an utterance.
    fn finish(&mut self) -> Vec<SttEvent> {
        Vec::new()
    }
}

/// `"deepgram"` or anything else for OpenAI.
pub fn for_id(id: &str) -> Box<dyn SttProvider> {
    match id {
        "deepgram" => Box::new(DeepgramProvider::default()),
        _ => Box::new(OpenAiProvider::default()),
    }
}
