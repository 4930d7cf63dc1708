use tokio::sync::mpsc;

use crate::audio::{pcm16_to_f32, pcm16_to_le_bytes, sample_to_pcm16, AudioFrame, LinearResampler, REALTIME_SAMPLE_RATE};
use crate::provider::{self, session::run_recognition, ProviderSettings};
use crate::{Error, Result};

/// Output of the local recognizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Full recognized-so-far text; replaces the previous transcript.
    Transcript(String),
    EndOfSpeech,
    Error(String),
}

/// A [`RecognitionEvent`] plus the stream that produced it.
///
/// A stopped stream keeps reporting for a moment while the service
/// finalizes; the session drops anything not from its current stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionMessage {
    pub stream: u64,
    pub event: RecognitionEvent,
}

/// Continuous speech-to-text with interim results.
pub trait Recognizer {
    /// Opens a new stream and returns its id.
    fn start(&mut self) -> Result<u64>;
    /// Feed one captured frame (24 kHz mono).
    fn accept_frame(&mut self, frame: &AudioFrame);
    fn stop(&mut self);
}

const AUDIO_QUEUE: usize = 64;

struct ActiveRecognition {
    stream: u64,
    audio: mpsc::Sender<Vec<u8>>,
    resampler: LinearResampler,
    rate: u32,
    dropped: u64,
}

/// [`Recognizer`] backed by a streaming STT websocket provider.
pub struct StreamingRecognizer {
    provider_id: String,
    settings: ProviderSettings,
    events: mpsc::Sender<RecognitionMessage>,
    active: Option<ActiveRecognition>,
    next_stream: u64,
}

impl StreamingRecognizer {
    pub fn new(
        provider_id: impl Into<String>,
        settings: ProviderSettings,
        events: mpsc::Sender<RecognitionMessage>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            settings,
            events,
            active: None,
            next_stream: 1,
        }
    }
}

impl Recognizer for StreamingRecognizer {
    fn start(&mut self) -> Result<u64> {
        if let Some(active) = self.active.as_ref() {
            return Ok(active.stream);
        }
        if self.settings.api_key.trim().is_empty() {
            return Err(Error::Recognition(format!(
                "no API key for {} recognition",
                self.provider_id
            )));
        }
        let provider = provider::for_id(&self.provider_id);
        let rate = provider.setup(&self.settings).sample_rate;
        let stream = self.next_stream;
        self.next_stream += 1;
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        tokio::spawn(run_recognition(
            provider,
            self.settings.clone(),
            stream,
            audio_rx,
            self.events.clone(),
        ));
        self.active = Some(ActiveRecognition {
            stream,
            audio: audio_tx,
            resampler: LinearResampler::new(),
            rate,
            dropped: 0,
        });
        Ok(stream)
    }

    fn accept_frame(&mut self, frame: &AudioFrame) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let bytes = if active.rate == REALTIME_SAMPLE_RATE {
            frame.to_le_bytes()
        } else {
            let resampled =
                active
                    .resampler
                    .process(&pcm16_to_f32(frame.samples()), REALTIME_SAMPLE_RATE, active.rate);
            let pcm: Vec<i16> = resampled.into_iter().map(sample_to_pcm16).collect();
            pcm16_to_le_bytes(&pcm)
        };
        if active.audio.try_send(bytes).is_err() {
            active.dropped += 1;
        }
    }

    /// Closing the audio channel makes the provider session finalize and exit.
    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            if active.dropped > 0 {
                log::warn!("[recognition] {} frames dropped", active.dropped);
            }
        }
    }
}
