use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use super::{AudioFraming, ProviderSettings, StreamSetup, SttEvent, SttProvider};

const SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Default, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

#[derive(Debug, Default, Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ListenMessage {
    Results {
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        #[serde(default)]
        channel: Channel,
    },
    UtteranceEnd,
    #[serde(other)]
    Other,
}

/// Deepgram live transcription.
///
/// Final segments are held until Deepgram marks the end of speech, so the
/// partial text never loses words that were already locked in.
#[derive(Debug, Default)]
pub struct DeepgramProvider {
    locked: Vec<String>,
}

impl DeepgramProvider {
    fn locked_text(&self) -> String {
        self.locked.join(" ")
    }

    fn close_utterance(&mut self) -> Vec<SttEvent> {
        let text = self.locked_text();
        self.locked.clear();
        if text.trim().is_empty() {
            Vec::new()
        } else {
            vec![SttEvent::Utterance(text)]
        }
    }
}

impl SttProvider for DeepgramProvider {
    fn label(&self) -> &'static str {
        "deepgram"
    }

    fn setup(&self, settings: &ProviderSettings) -> StreamSetup {
        let or = |value: &str, default: &'static str| {
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        };
        let url = format!(
            "wss://api.deepgram.com/v1/listen?encoding=linear16&sample_rate={}&channels=1\
             &model={}&language={}&interim_results=true&punctuate=true&smart_format=true\
             &endpointing=300&utterance_end_ms=1000",
            SAMPLE_RATE,
            or(&settings.transcription_model, "nova-3"),
            or(&settings.language, "en"),
        );
        StreamSetup {
            url,
            headers: vec![("Authorization".into(), format!("Token {}", settings.api_key))],
            greeting: None,
            framing: AudioFraming::Binary,
            finalize: Some(json!({ "type": "Finalize" })),
            goodbye: Some(json!({ "type": "CloseStream" })),
            keepalive: Some((json!({ "type": "KeepAlive" }), Duration::from_secs(5))),
            sample_rate: SAMPLE_RATE,
        }
    }

    fn on_message(&mut self, text: &str) -> Vec<SttEvent> {
        let message: ListenMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => return vec![SttEvent::Failed(format!("unreadable message: {}", e))],
        };
        match message {
            ListenMessage::Results {
                is_final,
                speech_final,
                channel,
            } => {
                let heard = channel
                    .alternatives
                    .into_iter()
                    .next()
                    .map(|a| a.transcript)
                    .unwrap_or_default();
                if !is_final {
                    if heard.is_empty() {
                        return Vec::new();
                    }
                    let preview = if self.locked.is_empty() {
                        heard
                    } else {
                        format!("{} {}", self.locked_text(), heard)
                    };
                    return vec![SttEvent::Partial(preview)];
                }
                if !heard.is_empty() {
                    self.locked.push(heard);
                }
                if speech_final {
                    self.close_utterance()
                } else if self.locked.is_empty() {
                    Vec::new()
                } else {
                    vec![SttEvent::Partial(self.locked_text())]
                }
            }
            ListenMessage::UtteranceEnd => self.close_utterance(),
            ListenMessage::Other => Vec::new(),
        }
    }

    fn finish(&mut self) -> Vec<SttEvent> {
        self.close_utterance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(text: &str, is_final: bool, speech_final: bool) -> String {
        json!({
            "type": "Results",
            "is_final": is_final,
            "speech_final": speech_final,
            "channel": { "alternatives": [{ "transcript": text, "confidence": 0.9 }] },
        })
        .to_string()
    }

    #[test]
    fn locked_segments_prefix_the_partial() {
        let mut stt = DeepgramProvider::default();
        assert_eq!(
            stt.on_message(&results("what is", false, false)),
            vec![SttEvent::Partial("what is".into())]
        );
        assert_eq!(
            stt.on_message(&results("what is the", true, false)),
            vec![SttEvent::Partial("what is the".into())]
        );
        assert_eq!(
            stt.on_message(&results("weather", false, false)),
            vec![SttEvent::Partial("what is the weather".into())]
        );
        assert_eq!(
            stt.on_message(&results("weather", true, true)),
            vec![SttEvent::Utterance("what is the weather".into())]
        );
        assert!(stt.finish().is_empty());
    }

    #[test]
    fn utterance_end_closes_held_segments() {
        let mut stt = DeepgramProvider::default();
        stt.on_message(&results("hello", true, false));
        assert_eq!(
            stt.on_message(r#"{"type":"UtteranceEnd","last_word_end":1.2}"#),
            vec![SttEvent::Utterance("hello".into())]
        );
        assert!(stt.on_message(r#"{"type":"Metadata","request_id":"x"}"#).is_empty());
    }

    #[test]
    fn setup_uses_linear16_at_16k() {
        let setup = DeepgramProvider::default().setup(&ProviderSettings::default());
        assert!(setup.url.contains("sample_rate=16000"));
        assert!(setup.url.contains("model=nova-3"));
        assert_eq!(setup.framing, AudioFraming::Binary);
        assert!(setup.keepalive.is_some());
    }
}
