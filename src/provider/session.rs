//! One websocket recognition stream, from handshake to the trailing finals.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use super::{AudioFraming, ProviderSettings, StreamSetup, SttEvent, SttProvider};
use crate::fallback::{RecognitionEvent, RecognitionMessage};
use crate::ws;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_ATTEMPTS: u32 = 2;
/// Grace period for trailing finals after the audio side hangs up.
const LINGER: Duration = Duration::from_secs(2);

/// Keeps the recognized-so-far text across utterances.
///
/// Providers report one utterance at a time; the session wants the whole
/// transcript of the turn, so closed utterances accumulate here.
#[derive(Debug, Default)]
struct TranscriptAssembler {
    closed: Vec<String>,
}

impl TranscriptAssembler {
    fn text_with(&self, open: &str) -> String {
        let open = open.trim();
        let mut parts: Vec<&str> = self.closed.iter().map(String::as_str).collect();
        if !open.is_empty() {
            parts.push(open);
        }
        parts.join(" ")
    }

    fn apply(&mut self, event: SttEvent, tag: &str) -> Vec<RecognitionEvent> {
        match event {
            SttEvent::Partial(open) => vec![RecognitionEvent::Transcript(self.text_with(&open))],
            SttEvent::Utterance(text) => {
                log::info!("[{}] heard \"{}\"", tag, text);
                let text = text.trim();
                if !text.is_empty() {
                    self.closed.push(text.to_string());
                }
                vec![
                    RecognitionEvent::Transcript(self.text_with("")),
                    RecognitionEvent::EndOfSpeech,
                ]
            }
            SttEvent::Failed(reason) => {
                log::warn!("[{}] {}", tag, reason);
                vec![RecognitionEvent::Error(reason)]
            }
        }
    }
}

fn audio_message(pcm: Vec<u8>, framing: AudioFraming) -> Message {
    match framing {
        AudioFraming::JsonBase64 {
            message_type,
            field,
        } => {
            let mut body = json!({ "type": message_type });
            body[field] = Value::String(BASE64.encode(&pcm));
            Message::Text(body.to_string().into())
        }
        AudioFraming::Binary => Message::Binary(pcm.into()),
    }
}

async fn send_json<S>(sink: &mut S, value: &Value) -> bool
where
    S: Sink<Message> + Unpin,
{
    sink.send(Message::Text(value.to_string().into())).await.is_ok()
}

/// Streams PCM16 LE audio from `audio_rx` to the provider until the channel
/// closes, then waits briefly for the last results.
///
/// Everything sent on `events` is tagged with `stream`. Every failure
/// surfaces as a [`RecognitionEvent::Error`].
pub async fn run_recognition(
    mut provider: Box<dyn SttProvider>,
    settings: ProviderSettings,
    stream: u64,
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<RecognitionMessage>,
) {
    let report = |event: RecognitionEvent| {
        let events = events.clone();
        async move {
            let _ = events.send(RecognitionMessage { stream, event }).await;
        }
    };
    let StreamSetup {
        url,
        headers,
        greeting,
        framing,
        finalize,
        goodbye,
        keepalive,
        ..
    } = provider.setup(&settings);
    let tag = provider.label();
    log::info!("[{}] opening stream {}", tag, stream);

    let socket = match ws::connect_with_retry(tag, &url, &headers, CONNECT_TIMEOUT, CONNECT_ATTEMPTS)
        .await
    {
        Ok(socket) => socket,
        Err(e) => {
            log::error!("[{}] {}", tag, e);
            report(RecognitionEvent::Error(e.to_string())).await;
            return;
        }
    };
    let (mut sink, mut incoming) = socket.split();

    if let Some(greeting) = greeting {
        if !send_json(&mut sink, &greeting).await {
            report(RecognitionEvent::Error("stream closed during setup".into())).await;
            return;
        }
    }

    // Without a keepalive the timer still needs a period; it is never polled.
    let (ping, period) = match keepalive {
        Some((ping, period)) => (Some(ping), period),
        None => (None, Duration::from_secs(3600)),
    };
    let mut idle = tokio::time::interval_at(Instant::now() + period, period);
    idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut assembler = TranscriptAssembler::default();
    let mut linger_until: Option<Instant> = None;
    let mut sent_bytes: u64 = 0;

    loop {
        let heard = tokio::select! {
            audio = audio_rx.recv(), if linger_until.is_none() => {
                match audio {
                    Some(pcm) => {
                        sent_bytes += pcm.len() as u64;
                        if sink.send(audio_message(pcm, framing)).await.is_err() {
                            break;
                        }
                        idle.reset();
                    }
                    None => {
                        log::debug!("[{}] audio done after {} bytes", tag, sent_bytes);
                        for message in finalize.iter().chain(goodbye.iter()) {
                            send_json(&mut sink, message).await;
                        }
                        linger_until = Some(Instant::now() + LINGER);
                    }
                }
                continue;
            }
            _ = idle.tick(), if linger_until.is_none() && ping.is_some() => {
                if let Some(ping) = &ping {
                    send_json(&mut sink, ping).await;
                }
                continue;
            }
            _ = tokio::time::sleep_until(linger_until.unwrap_or_else(Instant::now)), if linger_until.is_some() => break,
            message = incoming.next() => match message {
                Some(Ok(Message::Text(text))) => provider.on_message(&text),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = frame {
                        log::debug!("[{}] closed by server: {} {}", tag, frame.code, frame.reason);
                    }
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::warn!("[{}] websocket error: {}", tag, e);
                    break;
                }
                None => break,
            },
        };

        for event in heard {
            for out in assembler.apply(event, tag) {
                report(out).await;
            }
        }
    }

    for event in provider.finish() {
        for out in assembler.apply(event, tag) {
            report(out).await;
        }
    }
    let _ = sink.close().await;
    log::info!("[{}] stream {} closed", tag, stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_spans_utterances() {
        let mut assembler = TranscriptAssembler::default();
        assert_eq!(
            assembler.apply(SttEvent::Partial("hello".into()), "t"),
            vec![RecognitionEvent::Transcript("hello".into())]
        );
        assert_eq!(
            assembler.apply(SttEvent::Utterance("hello jarvis".into()), "t"),
            vec![
                RecognitionEvent::Transcript("hello jarvis".into()),
                RecognitionEvent::EndOfSpeech
            ]
        );
        assert_eq!(
            assembler.apply(SttEvent::Partial("are you".into()), "t"),
            vec![RecognitionEvent::Transcript("hello jarvis are you".into())]
        );
        assert_eq!(
            assembler.apply(SttEvent::Failed("quota".into()), "t"),
            vec![RecognitionEvent::Error("quota".into())]
        );
    }

    #[test]
    fn binary_framing_sends_bytes_as_is() {
        let message = audio_message(vec![1, 2, 3, 4], AudioFraming::Binary);
        assert_eq!(message.into_data().to_vec(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn json_framing_wraps_base64() {
        let message = audio_message(
            vec![0, 1],
            AudioFraming::JsonBase64 {
                message_type: "input_audio_buffer.append",
                field: "audio",
            },
        );
        let body: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
        assert_eq!(body["type"], "input_audio_buffer.append");
        assert_eq!(body["audio"], BASE64.encode([0u8, 1]));
    }
}
