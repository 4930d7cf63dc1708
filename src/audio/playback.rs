use std::collections::BTreeMap;

use super::{pcm16_to_f32, wav};
use crate::Result;

/// Completion notice for one playback item, reported by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEnded(pub u64);

/// Something that can play one decoded item at a time.
///
/// `play` must return promptly; the sink reports the end of the item later
/// as [`PlaybackEnded`]. `stop` halts output before returning and never
/// reports `PlaybackEnded` for the stopped item.
pub trait AudioSink {
    fn play(&mut self, seq: u64, samples: Vec<f32>, sample_rate: u32) -> Result<()>;
    fn stop(&mut self);
}

#[derive(Debug)]
struct PlaybackItem {
    turn: u64,
    wav: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Playing {
    seq: u64,
    turn: u64,
}

/// Plays synthesized audio chunks strictly in sequence-number order, one
/// at a time.
pub struct PlaybackSequencer {
    sink: Box<dyn AudioSink>,
    queue: BTreeMap<u64, PlaybackItem>,
    current: Option<Playing>,
    last_started: Option<u64>,
    muted: bool,
}

impl PlaybackSequencer {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            queue: BTreeMap::new(),
            current: None,
            last_started: None,
            muted: false,
        }
    }

    /// Wrap `pcm` as a WAV item and schedule it.
    pub fn enqueue(&mut self, pcm: &[i16], seq: u64, turn: u64) {
        if self.muted {
            log::debug!("muted, discarding playback item {}", seq);
            return;
        }
        if self.last_started.is_some_and(|last| seq <= last) || self.queue.contains_key(&seq) {
            log::warn!("playback item {} arrived out of order, dropping", seq);
            return;
        }
        let wav = match wav::wrap_pcm16(pcm) {
            Ok(wav) => wav,
            Err(e) => {
                log::warn!("dropping playback item {}: {}", seq, e);
                return;
            }
        };
        self.queue.insert(seq, PlaybackItem { turn, wav });
        self.pump();
    }

    /// Sink notification that an item finished; starts the next one.
    pub fn on_ended(&mut self, ended: PlaybackEnded) {
        match self.current {
            Some(playing) if playing.seq == ended.0 => {
                log::debug!("playback item {} finished", ended.0);
                self.current = None;
                self.pump();
            }
            _ => log::debug!("ignoring stale playback notice for {}", ended.0),
        }
    }

    /// Stop the playing item now and drop everything until [`unmute`](Self::unmute).
    pub fn mute(&mut self) {
        self.muted = true;
        self.stop_all();
    }

    pub fn unmute(&mut self) {
        self.muted = false;
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Drop queued items of `turn` and stop it if it is playing.
    pub fn discard_turn(&mut self, turn: u64) {
        let before = self.queue.len();
        self.queue.retain(|_, item| item.turn != turn);
        let dropped = before - self.queue.len();
        if dropped > 0 {
            log::debug!("discarded {} queued items of turn {}", dropped, turn);
        }
        if self.current.is_some_and(|playing| playing.turn == turn) {
            self.sink.stop();
            self.current = None;
            self.pump();
        }
    }

    /// Drop queued items from every turn other than `keep`.
    pub fn discard_other_turns(&mut self, keep: u64) {
        self.queue.retain(|_, item| item.turn == keep);
        if self.current.is_some_and(|playing| playing.turn != keep) {
            self.sink.stop();
            self.current = None;
            self.pump();
        }
    }

    pub fn stop_all(&mut self) {
        self.queue.clear();
        if self.current.take().is_some() {
            self.sink.stop();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }

    pub fn current_seq(&self) -> Option<u64> {
        self.current.map(|playing| playing.seq)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn pump(&mut self) {
        while self.current.is_none() && !self.muted {
            let Some((seq, item)) = self.queue.pop_first() else {
                return;
            };
            self.last_started = Some(seq);
            let started = wav::unwrap_pcm16(&item.wav)
                .and_then(|(rate, samples)| self.sink.play(seq, pcm16_to_f32(&samples), rate));
            match started {
                Ok(()) => {
                    self.current = Some(Playing {
                        seq,
                        turn: item.turn,
                    });
                }
                Err(e) => log::warn!("skipping playback item {}: {}", seq, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkCall {
        Play(u64, usize),
        Stop,
    }

    #[derive(Clone, Default)]
    struct FakeSink {
        calls: Rc<RefCell<Vec<SinkCall>>>,
        fail_on: Option<u64>,
    }

    impl AudioSink for FakeSink {
        fn play(&mut self, seq: u64, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
            assert_eq!(sample_rate, 24000);
            if self.fail_on == Some(seq) {
                return Err(Error::Playback("device busy".into()));
            }
            self.calls.borrow_mut().push(SinkCall::Play(seq, samples.len()));
            Ok(())
        }

        fn stop(&mut self) {
            self.calls.borrow_mut().push(SinkCall::Stop);
        }
    }

    fn sequencer(sink: FakeSink) -> PlaybackSequencer {
        PlaybackSequencer::new(Box::new(sink))
    }

    #[test]
    fn plays_one_item_at_a_time_in_order() {
        let sink = FakeSink::default();
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 10], 0, 1);
        seq.enqueue(&[2; 20], 1, 1);
        assert_eq!(*sink.calls.borrow(), vec![SinkCall::Play(0, 10)]);
        assert_eq!(seq.queued(), 1);

        seq.on_ended(PlaybackEnded(0));
        assert_eq!(
            *sink.calls.borrow(),
            vec![SinkCall::Play(0, 10), SinkCall::Play(1, 20)]
        );
        seq.on_ended(PlaybackEnded(1));
        assert!(seq.is_idle());
    }

    #[test]
    fn stale_notice_does_not_advance_queue() {
        let sink = FakeSink::default();
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 4], 5, 1);
        seq.enqueue(&[1; 4], 6, 1);
        seq.on_ended(PlaybackEnded(3));
        assert_eq!(seq.current_seq(), Some(5));
    }

    #[test]
    fn mute_stops_current_and_suppresses_later_items() {
        let sink = FakeSink::default();
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 4], 0, 1);
        seq.mute();
        assert_eq!(
            *sink.calls.borrow(),
            vec![SinkCall::Play(0, 4), SinkCall::Stop]
        );
        seq.enqueue(&[1; 4], 1, 1);
        assert!(seq.is_idle());

        seq.unmute();
        seq.enqueue(&[1; 8], 2, 1);
        assert_eq!(sink.calls.borrow().last(), Some(&SinkCall::Play(2, 8)));
    }

    #[test]
    fn failed_item_is_skipped() {
        let sink = FakeSink {
            fail_on: Some(0),
            ..FakeSink::default()
        };
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 4], 0, 1);
        seq.enqueue(&[1; 6], 1, 1);
        assert_eq!(seq.current_seq(), Some(1));
        assert_eq!(*sink.calls.borrow(), vec![SinkCall::Play(1, 6)]);
        seq.on_ended(PlaybackEnded(1));
        assert!(seq.is_idle());
    }

    #[test]
    fn discard_turn_only_touches_that_turn() {
        let sink = FakeSink::default();
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 4], 0, 1);
        seq.enqueue(&[1; 4], 1, 1);
        seq.enqueue(&[1; 4], 2, 2);
        seq.discard_turn(1);
        assert_eq!(
            *sink.calls.borrow(),
            vec![SinkCall::Play(0, 4), SinkCall::Stop, SinkCall::Play(2, 4)]
        );
        assert_eq!(seq.queued(), 0);
    }

    #[test]
    fn late_lower_sequence_is_rejected() {
        let sink = FakeSink::default();
        let mut seq = sequencer(sink.clone());
        seq.enqueue(&[1; 4], 3, 1);
        seq.enqueue(&[1; 4], 2, 1);
        assert_eq!(seq.queued(), 0);
    }
}
