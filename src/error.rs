//! Error types for the voice assistant

use thiserror::Error;

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the audio pipeline and session
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone unavailable or access refused; listening is disabled
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    /// Send attempted on a transport that is not connected (or muted)
    #[error("not connected to the realtime model")]
    NotConnected,

    /// Connection-level failure of the realtime transport
    #[error("transport error: {0}")]
    Transport(String),

    /// One playback item failed to decode or play
    #[error("playback error: {0}")]
    Playback(String),

    /// Local speech recognition failure
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Local speech synthesis failure
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Audio device or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Message from the remote model that could not be understood
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
