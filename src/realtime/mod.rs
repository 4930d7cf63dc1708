//! Duplex session with the remote realtime model.

mod client;
pub mod protocol;

use std::time::Duration;

pub use client::RealtimeClient;
pub use protocol::{ControlCommand, Inbound, StreamEvent};

use crate::audio::AudioFrame;
use crate::Result;

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

pub const JARVIS_INSTRUCTIONS: &str = "You are JARVIS, the assistant from Iron Man. Be helpful, \
brief and a little dry. Your replies are spoken aloud, so answer in plain sentences without \
markup, lists or symbols. Reply in the language the user speaks to you.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub api_key: String,
    pub instructions: String,
    /// Bound on each connection attempt.
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.into(),
            model: DEFAULT_REALTIME_MODEL.into(),
            voice: "alloy".into(),
            api_key: String::new(),
            instructions: JARVIS_INSTRUCTIONS.into(),
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
        }
    }
}

impl RealtimeConfig {
    pub fn endpoint(&self) -> String {
        if self.model.is_empty() {
            return self.url.clone();
        }
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, sep, self.model)
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("Authorization".into(), format!("Bearer {}", self.api_key)),
            ("OpenAI-Beta".into(), "realtime=v1".into()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Stream(Inbound),
    Closed { reason: String },
}

/// Transport event tagged with the connection that produced it.
///
/// Every `connect` starts a new connection id; events from older
/// connections are stale.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub connection: u64,
    pub event: TransportEvent,
}

/// Duplex channel to the realtime model.
///
/// Inbound events arrive on the channel the implementation was built with,
/// in receipt order.
pub trait Transport {
    /// Begin connecting. No-op while connecting or connected.
    fn connect(&mut self) -> Result<()>;
    fn state(&self) -> ConnectionState;
    /// Id of the current connection, matched against [`TransportMessage::connection`].
    fn connection(&self) -> u64;
    /// Fails with `NotConnected` unless connected and unmuted.
    fn send_audio_frame(&mut self, frame: &AudioFrame) -> Result<()>;
    fn send_control(&mut self, command: ControlCommand) -> Result<()>;
    fn set_muted(&mut self, muted: bool);
    /// Close gracefully. Queued outbound messages are dropped.
    fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_model() {
        let config = RealtimeConfig::default();
        assert_eq!(
            config.endpoint(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );
        let custom = RealtimeConfig {
            url: "ws://localhost:9000/rt?x=1".into(),
            model: "m".into(),
            ..RealtimeConfig::default()
        };
        assert_eq!(custom.endpoint(), "ws://localhost:9000/rt?x=1&model=m");
    }
}
