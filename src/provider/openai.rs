use std::mem;

use serde::Deserialize;
use serde_json::json;

use super::{AudioFraming, ProviderSettings, StreamSetup, SttEvent, SttProvider};

const TRANSCRIPTION_URL: &str = "wss://api.openai.com/v1/realtime?intent=transcription";

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TranscriptionMessage {
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    Delta {
        #[serde(default)]
        item_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    Completed {
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

/// OpenAI transcription session.
///
/// The server streams per-item deltas; they are joined here so each
/// partial carries the whole utterance.
#[derive(Debug, Default)]
pub struct OpenAiProvider {
    item: Option<String>,
    pending: String,
}

impl SttProvider for OpenAiProvider {
    fn label(&self) -> &'static str {
        "openai-stt"
    }

    fn setup(&self, settings: &ProviderSettings) -> StreamSetup {
        let mut transcription = json!({ "model": settings.transcription_model });
        if !settings.language.is_empty() {
            transcription["language"] = json!(settings.language);
        }
        StreamSetup {
            url: TRANSCRIPTION_URL.into(),
            headers: vec![
                ("Authorization".into(), format!("Bearer {}", settings.api_key)),
                ("OpenAI-Beta".into(), "realtime=v1".into()),
            ],
            greeting: Some(json!({
                "type": "transcription_session.update",
                "session": {
                    "input_audio_format": "pcm16",
                    "input_audio_transcription": transcription,
                    "input_audio_noise_reduction": { "type": "near_field" },
                    "turn_detection": {
                        "type": "server_vad",
                        "silence_duration_ms": 500,
                    },
                },
            })),
            framing: AudioFraming::JsonBase64 {
                message_type: "input_audio_buffer.append",
                field: "audio",
            },
            finalize: Some(json!({ "type": "input_audio_buffer.commit" })),
            goodbye: None,
            keepalive: None,
            sample_rate: 24000,
        }
    }

    fn on_message(&mut self, text: &str) -> Vec<SttEvent> {
        let message: TranscriptionMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => return vec![SttEvent::Failed(format!("unreadable message: {}", e))],
        };
        match message {
            TranscriptionMessage::Delta { item_id, delta } => {
                if item_id.is_some() && item_id != self.item {
                    self.item = item_id;
                    self.pending.clear();
                }
                self.pending.push_str(&delta);
                vec![SttEvent::Partial(self.pending.clone())]
            }
            TranscriptionMessage::Completed { transcript } => {
                let pending = mem::take(&mut self.pending);
                self.item = None;
                let text = transcript.unwrap_or(pending).trim().to_string();
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![SttEvent::Utterance(text)]
                }
            }
            TranscriptionMessage::Error { error } => {
                if error.code.as_deref() == Some("input_audio_buffer_commit_empty") {
                    return Vec::new();
                }
                vec![SttEvent::Failed(
                    error.message.unwrap_or_else(|| "transcription error".into()),
                )]
            }
            TranscriptionMessage::Other => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<SttEvent> {
        self.item = None;
        let text = mem::take(&mut self.pending);
        let text = text.trim();
        if text.is_empty() {
            Vec::new()
        } else {
            vec![SttEvent::Utterance(text.to_string())]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(item: &str, text: &str) -> String {
        json!({
            "type": "conversation.item.input_audio_transcription.delta",
            "item_id": item,
            "delta": text,
        })
        .to_string()
    }

    #[test]
    fn partials_carry_the_whole_utterance() {
        let mut stt = OpenAiProvider::default();
        assert_eq!(stt.on_message(&delta("a", "Hello")), vec![SttEvent::Partial("Hello".into())]);
        assert_eq!(
            stt.on_message(&delta("a", " there")),
            vec![SttEvent::Partial("Hello there".into())]
        );
        assert_eq!(stt.on_message(&delta("b", "Next")), vec![SttEvent::Partial("Next".into())]);
    }

    #[test]
    fn completed_item_is_an_utterance() {
        let mut stt = OpenAiProvider::default();
        stt.on_message(&delta("a", "hel"));
        let done = json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "a",
            "transcript": " hello ",
        })
        .to_string();
        assert_eq!(stt.on_message(&done), vec![SttEvent::Utterance("hello".into())]);
        assert!(stt.finish().is_empty());
    }

    #[test]
    fn finish_reports_unfinished_text() {
        let mut stt = OpenAiProvider::default();
        stt.on_message(&delta("a", "open the pod bay"));
        assert_eq!(stt.finish(), vec![SttEvent::Utterance("open the pod bay".into())]);
    }

    #[test]
    fn unknown_messages_and_empty_commits_are_quiet() {
        let mut stt = OpenAiProvider::default();
        assert!(stt
            .on_message(r#"{"type":"transcription_session.created","session":{}}"#)
            .is_empty());
        let empty = json!({
            "type": "error",
            "error": { "code": "input_audio_buffer_commit_empty", "message": "buffer too small" },
        })
        .to_string();
        assert!(stt.on_message(&empty).is_empty());
        assert!(matches!(stt.on_message("not json").as_slice(),[SttEvent::Failed(_)]));
    }

    #[test]
    fn setup_configures_the_transcription_session() {
        let setup = OpenAiProvider::default().setup(&ProviderSettings {
            api_key: "k".into(),
            transcription_model: "gpt-4o-mini-transcribe".into(),
            language: "en".into(),
        });
        let greeting = setup.greeting.unwrap();
        assert_eq!(greeting["type"], "transcription_session.update");
        assert_eq!(greeting["session"]["input_audio_transcription"]["language"], "en");
        assert_eq!(setup.sample_rate, 24000);
    }
}
