use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Where the answer to a turn comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnMode {
    /// Audio streamed to the realtime model.
    Realtime,
    /// Local transcript sent to the completion endpoint, spoken locally.
    Local,
}

/// One request/response cycle.
#[derive(Debug)]
pub(crate) struct Turn {
    pub id: u64,
    pub mode: TurnMode,
    /// Server response this turn is bound to, set by `response.created`.
    pub response_id: Option<String>,
    pub frames_sent: u64,
    /// A response (or completion) has been requested.
    pub requested: bool,
    /// Stop arrived while connecting; request once connected.
    pub request_on_connect: bool,
    /// Typed message waiting for the connection.
    pub pending_text: Option<String>,
    pub response_done: bool,
    pub audio_started: bool,
    /// Local utterance speaking the answer, if any.
    pub utterance: Option<u64>,
    pub last_activity: Instant,
}

impl Turn {
    pub fn new(id: u64, mode: TurnMode) -> Self {
        Self {
            id,
            mode,
            response_id: None,
            frames_sent: 0,
            requested: false,
            request_on_connect: false,
            pending_text: None,
            response_done: false,
            audio_started: false,
            utterance: None,
            last_activity: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Waiting on the remote side with nothing to show yet.
    pub fn awaiting_response(&self) -> bool {
        (self.requested || self.request_on_connect) && !self.response_done
    }

    pub fn deadline(&self, timeout: Duration) -> Option<Instant> {
        self.awaiting_response()
            .then(|| self.last_activity + timeout)
    }
}

/// Response ids of finished turns; their late events are dropped.
#[derive(Debug, Default)]
pub(crate) struct RetiredResponses {
    ids: VecDeque<String>,
}

impl RetiredResponses {
    const KEEP: usize = 16;

    pub fn retire(&mut self, id: Option<String>) {
        if let Some(id) = id {
            if self.ids.len() == Self::KEEP {
                self.ids.pop_front();
            }
            self.ids.push_back(id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|r| r == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_only_while_awaiting() {
        let mut turn = Turn::new(1, TurnMode::Realtime);
        let timeout = Duration::from_secs(30);
        assert!(turn.deadline(timeout).is_none());
        turn.requested = true;
        assert_eq!(turn.deadline(timeout), Some(turn.last_activity + timeout));
        turn.response_done = true;
        assert!(turn.deadline(timeout).is_none());
    }

    #[test]
    fn retired_ids_are_bounded() {
        let mut retired = RetiredResponses::default();
        for i in 0..20 {
            retired.retire(Some(format!("r{}", i)));
        }
        retired.retire(None);
        assert!(!retired.contains("r0"));
        assert!(retired.contains("r19"));
    }
}
