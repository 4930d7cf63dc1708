//! Local recognition and synthesis, plus the non-realtime completion path.

mod completion;
mod recognition;
mod synthesis;

pub use completion::{Completion, CompletionBackend, CompletionClient, CompletionReply, FALLBACK_MESSAGE};
pub use recognition::{RecognitionEvent, RecognitionMessage, Recognizer, StreamingRecognizer};
pub use synthesis::{default_program, normalize_text, select_voice, SpeechEvent, Synthesizer, SystemVoice};
