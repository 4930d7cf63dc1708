use super::{sample_to_pcm16, AudioFrame};

/// Accumulates float samples from the audio callback and cuts them into
/// fixed-size PCM16 frames.
///
/// Runs on the realtime audio thread. `process` never blocks and only
/// allocates for the frames it emits; downmixing and resampling happen
/// before it in the capture callback.
#[derive(Debug)]
pub struct PcmFramer {
    buffer: Box<[f32]>,
    index: usize,
}

impl PcmFramer {
    pub fn new(frame_size: usize) -> Self {
        Self {
            buffer: vec![0.0; frame_size.max(1)].into_boxed_slice(),
            index: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.buffer.len()
    }

    /// Samples held back waiting for the frame to fill.
    pub fn pending(&self) -> usize {
        self.index
    }

    /// Consume every sample of `input`; `emit` is called once per filled frame.
    pub fn process<F>(&mut self, input: &[f32], mut emit: F)
    where
        F: FnMut(AudioFrame),
    {
        for &sample in input {
            self.buffer[self.index] = sample;
            self.index += 1;
            if self.index == self.buffer.len() {
                emit(self.convert(self.index));
                self.index = 0;
            }
        }
    }

    /// Emit the partial frame left at teardown, if any.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.index == 0 {
            return None;
        }
        let frame = self.convert(self.index);
        self.index = 0;
        Some(frame)
    }

    fn convert(&self, len: usize) -> AudioFrame {
        AudioFrame::new(self.buffer[..len].iter().map(|&s| sample_to_pcm16(s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic sample source in [-1.5, 1.5] so clamping is exercised.
    fn samples(count: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..count)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 * 3.0 - 1.5
            })
            .collect()
    }

    #[test]
    fn emits_floor_of_total_over_frame_size() {
        for (frame_size, chunk, total) in [(4096, 128, 20_000), (100, 7, 1_000), (64, 64, 640), (10, 33, 99)] {
            let input = samples(total, frame_size as u32);
            let mut framer = PcmFramer::new(frame_size);
            let mut frames = Vec::new();
            for part in input.chunks(chunk) {
                framer.process(part, |f| frames.push(f));
            }
            assert_eq!(frames.len(), total / frame_size);
            assert!(frames.iter().all(|f| f.len() == frame_size));
            assert_eq!(framer.pending(), total % frame_size);

            let emitted: Vec<i16> = frames.iter().flat_map(|f| f.samples().to_vec()).collect();
            let expected: Vec<i16> = input[..emitted.len()]
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
                .collect();
            assert_eq!(emitted, expected);
        }
    }

    #[test]
    fn partial_fill_carries_across_callbacks() {
        let mut framer = PcmFramer::new(4);
        let mut frames = Vec::new();
        framer.process(&[0.0, 0.25, 0.5], |f| frames.push(f));
        assert!(frames.is_empty());
        framer.process(&[1.0, -1.0], |f| frames.push(f));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples(), &[0, 8192, 16384, 32767]);
        assert_eq!(framer.pending(), 1);
    }

    #[test]
    fn flush_returns_short_trailing_frame_once() {
        let mut framer = PcmFramer::new(8);
        framer.process(&[0.5, 0.5, 0.5], |_| panic!("frame not full yet"));
        let tail = framer.flush().expect("partial frame");
        assert_eq!(tail.len(), 3);
        assert!(framer.flush().is_none());
    }
}
