//! Audio pipeline: microphone capture, PCM framing, WAV framing and playback.

mod capture;
mod output;
mod playback;
pub mod wav;
mod worklet;

use std::sync::Arc;

pub use capture::{list_input_devices, Capture, CaptureConstraints, MicrophoneCapture};
pub use output::SpeakerOutput;
pub use playback::{AudioSink, PlaybackEnded, PlaybackSequencer};
pub use worklet::PcmFramer;

/// Sample rate of the realtime channel in both directions.
pub const REALTIME_SAMPLE_RATE: u32 = 24000;

/// Samples per emitted capture frame.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Fixed-size block of mono PCM16 samples emitted by the capture path.
///
/// Frames are immutable once built; cloning shares the sample storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Little-endian byte encoding, as sent on the wire.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm16_to_le_bytes(&self.samples)
    }
}

/// Convert one float sample in [-1, 1] to PCM16.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Decode little-endian PCM16 bytes. Returns `None` on an odd byte count.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

/// Streaming linear resampler; keeps phase across calls so chunk
/// boundaries do not click.
#[derive(Debug, Default)]
pub struct LinearResampler {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

impl LinearResampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, samples: &[f32], input_rate: u32, target_rate: u32) -> Vec<f32> {
        if samples.is_empty() || input_rate == target_rate || target_rate == 0 {
            return samples.to_vec();
        }
        let step = f64::from(input_rate) / f64::from(target_rate);
        let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

        let mut buf = Vec::with_capacity(samples.len() + 1);
        if self.has_last {
            buf.push(self.last_sample);
        }
        buf.extend_from_slice(samples);

        let mut i = 0usize;
        let mut t = self.t;
        while i + 1 < buf.len() {
            let s0 = buf[i];
            let s1 = buf[i + 1];
            out.push(s0 + (s1 - s0) * t as f32);
            t += step;
            while t >= 1.0 && i + 1 < buf.len() {
                t -= 1.0;
                i += 1;
            }
        }

        self.t = t;
        if let Some(&last) = buf.last() {
            self.last_sample = last;
            self.has_last = true;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_conversion_rounds_and_clamps() {
        assert_eq!(sample_to_pcm16(0.0), 0);
        assert_eq!(sample_to_pcm16(1.0), 32767);
        assert_eq!(sample_to_pcm16(-1.0), -32767);
        assert_eq!(sample_to_pcm16(2.5), 32767);
        assert_eq!(sample_to_pcm16(-7.0), -32767);
        // 0.5 * 32767 = 16383.5 rounds away from zero
        assert_eq!(sample_to_pcm16(0.5), 16384);
        assert_eq!(sample_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn le_bytes_decode_rejects_odd_length() {
        assert_eq!(pcm16_from_le_bytes(&[1, 0, 2]), None);
        assert_eq!(pcm16_from_le_bytes(&[1, 0, 0xff, 0xff]), Some(vec![1, -1]));
    }

    #[test]
    fn frame_bytes_are_little_endian() {
        let frame = AudioFrame::new(vec![0x0102, -2]);
        assert_eq!(frame.to_le_bytes(), vec![0x02, 0x01, 0xfe, 0xff]);
    }

    #[test]
    fn resampler_halves_sample_count() {
        let mut resampler = LinearResampler::new();
        let input: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = resampler.process(&input, 48000, 24000);
        assert!((239..=241).contains(&out.len()), "got {}", out.len());
    }

    #[test]
    fn resampler_passthrough_on_equal_rates() {
        let mut resampler = LinearResampler::new();
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resampler.process(&input, 24000, 24000), input);
    }
}
