//! JARVIS voice assistant core: microphone capture, a realtime speech model
//! session, gapless chunked playback and a local recognition/synthesis
//! fallback, coordinated by one turn-taking state machine.
//!
//! ```text
//! mic ─▶ MicrophoneCapture ─▶ PcmFramer ─▶ Session ─▶ RealtimeClient ⇄ model
//!                                            │  ▲             │
//!                          StreamingRecognizer│  └─ events ───┘
//!                                            ▼
//!                          PlaybackSequencer ─▶ SpeakerOutput
//! ```

pub mod audio;
pub mod error;
pub mod fallback;
pub mod provider;
pub mod realtime;
pub mod session;
pub mod settings;
pub mod state;
mod ws;

pub use error::{Error, Result};
