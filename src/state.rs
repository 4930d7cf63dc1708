use crate::realtime::ConnectionState;
use crate::session::Phase;

/// Events sent from the session to the front-end.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Phase(Phase),
    Connection(ConnectionState),
    /// Local recognizer text for the utterance in progress (replaces the previous).
    Transcript(String),
    TranscriptCleared,
    /// Remote response text as it streams in.
    ResponseDelta(String),
    ResponseFinished(String),
    AssistantSpeaking(bool),
    Muted(bool),
    MicMuted(bool),
    /// Microphone unavailable; the listen control is disabled.
    ListeningDisabled(String),
    NoteSaved { index: usize, text: String },
    Notice(String),
    Error(String),
}

/// Running counters for one session, reported at teardown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_rejected: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub audio_chunks: u64,
}

impl SessionStats {
    pub fn record_frame(&mut self, samples: usize) {
        self.frames_sent = self.frames_sent.saturating_add(1);
        self.bytes_sent = self.bytes_sent.saturating_add(samples as u64 * 2);
    }
}
