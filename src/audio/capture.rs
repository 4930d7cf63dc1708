use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{AudioFrame, LinearResampler, PcmFramer, DEFAULT_FRAME_SIZE, REALTIME_SAMPLE_RATE};
use crate::{Error, Result};

/// Microphone request constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub channel_count: u16,
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl CaptureConstraints {
    /// Mono 24 kHz with echo cancellation and noise suppression on.
    pub fn realtime() -> Self {
        Self {
            channel_count: 1,
            sample_rate: REALTIME_SAMPLE_RATE,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::realtime()
    }
}

/// Owner of the live microphone stream.
///
/// `start` begins delivering [`AudioFrame`]s on `frames`. `stop` releases the
/// device before returning and may be called any number of times.
pub trait Capture {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

struct ActiveStream {
    stream: cpal::Stream,
    framer: Arc<Mutex<PcmFramer>>,
    frames: mpsc::Sender<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

/// cpal-backed [`Capture`]. No device is touched until `start`.
pub struct MicrophoneCapture {
    device_name: Option<String>,
    constraints: CaptureConstraints,
    frame_size: usize,
    active: Option<ActiveStream>,
}

impl MicrophoneCapture {
    pub fn new(
        device_name: Option<String>,
        constraints: CaptureConstraints,
        frame_size: usize,
    ) -> Self {
        let frame_size = if frame_size == 0 {
            DEFAULT_FRAME_SIZE
        } else {
            frame_size
        };
        Self {
            device_name,
            constraints,
            frame_size,
            active: None,
        }
    }

    fn open_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match &self.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| Error::PermissionDenied(format!("failed to list devices: {}", e)))?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| Error::PermissionDenied(format!("device '{}' not found", name))),
            None => host
                .default_input_device()
                .ok_or_else(|| Error::PermissionDenied("no default input device".into())),
        }
    }
}

impl Capture for MicrophoneCapture {
    fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let device = self.open_device()?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".into());

        if self.constraints.echo_cancellation || self.constraints.noise_suppression {
            log::debug!("[capture] echo cancellation / noise suppression left to the OS input chain");
        }

        let target_rate = self.constraints.sample_rate;
        let config = match try_config(&device, target_rate, self.constraints.channel_count) {
            Some(cfg) => cfg,
            None => {
                let default = device.default_input_config().map_err(|e| {
                    Error::PermissionDenied(format!("no input config: {}", e))
                })?;
                log::info!(
                    "[capture] {}Hz unavailable, resampling from {}Hz {}ch",
                    target_rate,
                    default.sample_rate().0,
                    default.channels()
                );
                default.config()
            }
        };
        log::info!(
            "[capture] using device '{}' at {}Hz {}ch, {} samples per frame",
            device_name,
            config.sample_rate.0,
            config.channels,
            self.frame_size
        );

        let framer = Arc::new(Mutex::new(PcmFramer::new(self.frame_size)));
        let dropped = Arc::new(AtomicU64::new(0));
        let channels = usize::from(config.channels.max(1));
        let input_rate = config.sample_rate.0;

        let cb_framer = Arc::clone(&framer);
        let cb_dropped = Arc::clone(&dropped);
        let cb_frames = frames.clone();
        let mut resampler = LinearResampler::new();
        let mut scratch: Vec<f32> = Vec::new();
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix_into(data, channels, &mut scratch);
                    let samples = resampler.process(mono, input_rate, target_rate);
                    let Ok(mut framer) = cb_framer.lock() else {
                        return;
                    };
                    framer.process(&samples, |frame| {
                        if cb_frames.try_send(frame).is_err() {
                            cb_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                },
                |err| {
                    log::error!("[capture] stream error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    Error::PermissionDenied("input device not available".into())
                }
                other => Error::Audio(format!("failed to build input stream: {}", other)),
            })?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                Error::PermissionDenied("input device not available".into())
            }
            other => Error::Audio(format!("failed to start input stream: {}", other)),
        })?;

        self.active = Some(ActiveStream {
            stream,
            framer,
            frames,
            dropped,
        });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveStream {
            stream,
            framer,
            frames,
            dropped,
        } = active;

        if let Err(e) = stream.pause() {
            log::debug!("[capture] pause failed: {}", e);
        }
        drop(stream);

        let tail = framer.lock().ok().and_then(|mut f| f.flush());
        if let Some(frame) = tail {
            if frames.try_send(frame).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(frames);

        let dropped = dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            log::warn!("[capture] {} frames dropped: consumer fell behind", dropped);
        }
        log::info!("[capture] stopped");
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn try_config(device: &cpal::Device, rate: u32, channels: u16) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let fits = |range: &cpal::SupportedStreamConfigRange| {
        range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate
    };
    // Prefer the requested channel count, otherwise anything at the rate (downmixed).
    supported
        .iter()
        .find(|range| range.channels() == channels && fits(range))
        .or_else(|| supported.iter().find(|range| fits(range)))
        .map(|range| StreamConfig {
            channels: range.channels(),
            sample_rate: SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        })
}

/// Average interleaved channels into `scratch`, which keeps its capacity
/// between callbacks. Mono input is returned as is.
fn downmix_into<'a>(data: &'a [f32], channels: usize, scratch: &'a mut Vec<f32>) -> &'a [f32] {
    if channels <= 1 {
        return data;
    }
    scratch.clear();
    scratch.extend(
        data.chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
    scratch
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realtime_constraints() {
        let c = CaptureConstraints::default();
        assert_eq!(c.channel_count, 1);
        assert_eq!(c.sample_rate, 24000);
        assert!(c.echo_cancellation && c.noise_suppression);
    }

    #[test]
    fn stop_is_idempotent_without_a_stream() {
        let mut capture = MicrophoneCapture::new(None, CaptureConstraints::realtime(), 0);
        assert_eq!(capture.frame_size, DEFAULT_FRAME_SIZE);
        capture.stop();
        capture.stop();
        assert!(!capture.is_active());
    }

    #[test]
    fn downmix_reuses_its_scratch_buffer() {
        let mut scratch = Vec::new();
        let stereo: [f32; 6] = [0.5, -0.5, 1.0, 0.0, 0.25, 0.75];
        assert_eq!(downmix_into(&stereo, 2, &mut scratch), &[0.0f32, 0.5, 0.5]);
        let (ptr, capacity) = (scratch.as_ptr(), scratch.capacity());

        assert_eq!(downmix_into(&stereo[..4], 2, &mut scratch), &[0.0f32, 0.5]);
        assert_eq!(scratch.as_ptr(), ptr);
        assert_eq!(scratch.capacity(), capacity);

        let mono: [f32; 2] = [0.1, 0.2];
        assert_eq!(downmix_into(&mono, 1, &mut scratch).as_ptr(), mono.as_ptr());
    }
}
