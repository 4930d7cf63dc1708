//! Speaker output backing the playback sequencer.

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use tokio::sync::mpsc;

use super::{AudioSink, LinearResampler, PlaybackEnded};
use crate::{Error, Result};

struct Track {
    seq: u64,
    samples: Vec<f32>,
    pos: usize,
}

struct OpenStream {
    stream: cpal::Stream,
    config: StreamConfig,
}

/// One persistent cpal output stream that plays a single track at a time.
///
/// The stream is opened on the first `play`. When a track runs out the
/// audio thread reports [`PlaybackEnded`] on the channel given to `new`.
pub struct SpeakerOutput {
    device_name: Option<String>,
    track: Arc<Mutex<Option<Track>>>,
    ended: mpsc::Sender<PlaybackEnded>,
    stream: Option<OpenStream>,
}

impl SpeakerOutput {
    pub fn new(device_name: Option<String>, ended: mpsc::Sender<PlaybackEnded>) -> Self {
        Self {
            device_name,
            track: Arc::new(Mutex::new(None)),
            ended,
            stream: None,
        }
    }

    fn open(&mut self) -> Result<&OpenStream> {
        if self.stream.is_none() {
            let host = cpal::default_host();
            let device = match &self.device_name {
                Some(name) => host
                    .output_devices()
                    .map_err(|e| Error::Audio(e.to_string()))?
                    .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                    .ok_or_else(|| Error::Audio(format!("output device '{}' not found", name)))?,
                None => host
                    .default_output_device()
                    .ok_or_else(|| Error::Audio("no output device available".to_string()))?,
            };
            let config = device
                .default_output_config()
                .map_err(|e| Error::Audio(e.to_string()))?
                .config();
            let channels = usize::from(config.channels.max(1));

            let track = Arc::clone(&self.track);
            let ended = self.ended.clone();
            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let Ok(mut slot) = track.lock() else {
                            data.fill(0.0);
                            return;
                        };
                        for frame in data.chunks_mut(channels) {
                            let sample = match slot.as_mut() {
                                Some(t) if t.pos < t.samples.len() => {
                                    t.pos += 1;
                                    t.samples[t.pos - 1]
                                }
                                _ => 0.0,
                            };
                            frame.fill(sample);
                        }
                        if slot.as_ref().is_some_and(|t| t.pos >= t.samples.len()) {
                            if let Some(done) = slot.take() {
                                let _ = ended.try_send(PlaybackEnded(done.seq));
                            }
                        }
                    },
                    |err| {
                        log::error!("[playback] output stream error: {}", err);
                    },
                    None,
                )
                .map_err(|e| Error::Playback(format!("failed to build output stream: {}", e)))?;
            log::info!(
                "[playback] output at {}Hz {}ch",
                config.sample_rate.0,
                config.channels
            );
            self.stream = Some(OpenStream { stream, config });
        }
        self.stream
            .as_ref()
            .ok_or_else(|| Error::Playback("output stream unavailable".into()))
    }
}

impl AudioSink for SpeakerOutput {
    fn play(&mut self, seq: u64, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        let device_rate = self.open()?.config.sample_rate.0;
        let samples = LinearResampler::new().process(&samples, sample_rate, device_rate);
        log::debug!("[playback] item {}: {} samples", seq, samples.len());
        {
            let mut slot = self
                .track
                .lock()
                .map_err(|_| Error::Playback("track lock poisoned".into()))?;
            *slot = Some(Track {
                seq,
                samples,
                pos: 0,
            });
        }
        let open = self.open()?;
        open.stream
            .play()
            .map_err(|e| Error::Playback(format!("failed to start output: {}", e)))
    }

    fn stop(&mut self) {
        if let Ok(mut slot) = self.track.lock() {
            *slot = None;
        }
        if let Some(open) = &self.stream {
            if let Err(e) = open.stream.pause() {
                log::debug!("[playback] pause failed: {}", e);
            }
        }
    }
}
