//! Turn-taking state machine coordinating capture, the realtime transport,
//! playback and the local fallback path.
//!
//! [`Session::handle`] is synchronous; every asynchronous source feeds it
//! through a bounded channel drained by [`driver::run`].

pub mod driver;
mod turn;

use std::collections::VecDeque;
use std::sync::mpsc::Sender;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::audio::{AudioFrame, Capture, PlaybackEnded, PlaybackSequencer};
use crate::fallback::{
    Completion, CompletionReply, RecognitionEvent, RecognitionMessage, Recognizer, SpeechEvent,
    Synthesizer,
    FALLBACK_MESSAGE,
};
use crate::realtime::{
    ConnectionState, ControlCommand, Inbound, StreamEvent, Transport, TransportEvent,
    TransportMessage,
};
use crate::state::{SessionStats, UiEvent};
use crate::Error;
use turn::{RetiredResponses, Turn, TurnMode};

pub use driver::{channels, EventReceivers, EventSenders};

/// Frames buffered between the capture callback and the session.
const FRAME_QUEUE: usize = 64;
/// Frames held while the transport is still connecting (~80 s at 4096 samples).
const MAX_BACKLOG: usize = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Listening,
    Processing,
    Speaking,
    Disconnected,
    Error,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Abandon an outstanding response after this long without progress.
    pub response_timeout: Option<Duration>,
    /// Submit the turn when the recognizer reports end of speech.
    pub auto_submit: bool,
    pub start_muted: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Some(Duration::from_secs(30)),
            auto_submit: true,
            start_muted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    StartListening,
    StopListening,
    ToggleListening,
    Mute,
    Unmute,
    ToggleMute,
    SetMicMuted(bool),
    SendText(String),
    SaveNote,
    /// Save the note, then send it to the completion model as a prompt.
    ProcessNote,
    Reconnect,
    GoOffline,
    Disconnect,
    Reset,
    Quit,
}

/// Everything the session reacts to.
#[derive(Debug)]
pub enum Input {
    Command(UserCommand),
    Frame(AudioFrame),
    Transport(TransportMessage),
    Recognition(RecognitionMessage),
    Speech(SpeechEvent),
    Playback(PlaybackEnded),
    Completion(CompletionReply),
    ResponseStalled,
}

/// Collaborators owned by the session.
pub struct Components {
    pub capture: Box<dyn Capture>,
    /// `None` runs offline only.
    pub transport: Option<Box<dyn Transport>>,
    pub recognizer: Option<Box<dyn Recognizer>>,
    pub synthesizer: Box<dyn Synthesizer>,
    pub completion: Box<dyn Completion>,
    pub playback: PlaybackSequencer,
}

pub struct Session {
    config: SessionConfig,
    capture: Box<dyn Capture>,
    transport: Option<Box<dyn Transport>>,
    recognizer: Option<Box<dyn Recognizer>>,
    synthesizer: Box<dyn Synthesizer>,
    completion: Box<dyn Completion>,
    playback: PlaybackSequencer,
    ui: Sender<UiEvent>,

    phase: Phase,
    offline: bool,
    muted: bool,
    mic_muted: bool,
    listening_disabled: bool,
    quit: bool,

    frames_tx: mpsc::Sender<AudioFrame>,
    frames_rx: mpsc::Receiver<AudioFrame>,
    backlog: VecDeque<AudioFrame>,

    turn: Option<Turn>,
    next_turn: u64,
    next_seq: u64,
    retired: RetiredResponses,
    /// `response.create` sent on this connection whose `response.created`
    /// has not arrived yet.
    unstarted: u32,
    /// Recognizer stream feeding the current turn.
    recognition: Option<u64>,

    transcript: String,
    last_transcript: String,
    response: String,
    notes: Vec<String>,
    stats: SessionStats,
}

impl Session {
    pub fn new(components: Components, config: SessionConfig, ui: Sender<UiEvent>) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let Components {
            capture,
            transport,
            recognizer,
            synthesizer,
            completion,
            mut playback,
        } = components;
        let muted = config.start_muted;
        if muted {
            playback.mute();
        }
        Self {
            offline: transport.is_none(),
            config,
            capture,
            transport,
            recognizer,
            synthesizer,
            completion,
            playback,
            ui,
            phase: Phase::Idle,
            muted,
            mic_muted: false,
            listening_disabled: false,
            quit: false,
            frames_tx,
            frames_rx,
            backlog: VecDeque::new(),
            turn: None,
            next_turn: 1,
            next_seq: 1,
            retired: RetiredResponses::default(),
            unstarted: 0,
            recognition: None,
            transcript: String::new(),
            last_transcript: String::new(),
            response: String::new(),
            notes: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn response_text(&self) -> &str {
        &self.response
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Next captured frame. Never yields `None` while the session lives.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames_rx.recv().await
    }

    /// When the outstanding response, if any, counts as stalled.
    pub fn response_deadline(&self) -> Option<Instant> {
        let timeout = self.config.response_timeout?;
        self.turn.as_ref()?.deadline(timeout)
    }

    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Command(cmd) => self.on_command(cmd),
            Input::Frame(frame) => self.on_frame(frame),
            Input::Transport(msg) => self.on_transport(msg),
            Input::Recognition(msg) => self.on_recognition(msg),
            Input::Speech(event) => self.on_speech(event),
            Input::Playback(ended) => {
                self.playback.on_ended(ended);
                self.maybe_finish_turn();
            }
            Input::Completion(reply) => self.on_completion(reply),
            Input::ResponseStalled => self.on_stall(),
        }
    }

    /// Release every resource. Safe to call more than once.
    pub fn teardown(&mut self) {
        self.stop_capture(false);
        self.abort_turn(true);
        self.playback.stop_all();
        self.synthesizer.cancel();
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
        self.backlog.clear();
        log::info!(
            "[session] teardown: {} frames ({} bytes) sent, {} rejected, {} turns completed, {} failed",
            self.stats.frames_sent,
            self.stats.bytes_sent,
            self.stats.frames_rejected,
            self.stats.turns_completed,
            self.stats.turns_failed
        );
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase == phase {
            return;
        }
        log::info!("[session] {:?} -> {:?}", self.phase, phase);
        if self.phase == Phase::Speaking {
            self.emit(UiEvent::AssistantSpeaking(false));
        }
        self.phase = phase;
        self.emit(UiEvent::Phase(phase));
    }

    fn realtime_state(&self) -> ConnectionState {
        self.transport
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    // ---- commands ----

    fn on_command(&mut self, cmd: UserCommand) {
        log::debug!("[session] command {:?} in {:?}", cmd, self.phase);
        match cmd {
            UserCommand::StartListening => self.start_listening(),
            UserCommand::StopListening => self.stop_listening(),
            UserCommand::ToggleListening => {
                if self.phase == Phase::Listening {
                    self.stop_listening();
                } else {
                    self.start_listening();
                }
            }
            UserCommand::Mute => self.set_muted(true),
            UserCommand::Unmute => self.set_muted(false),
            UserCommand::ToggleMute => self.set_muted(!self.muted),
            UserCommand::SetMicMuted(muted) => {
                self.mic_muted = muted;
                if let Some(transport) = self.transport.as_mut() {
                    transport.set_muted(muted);
                }
                self.emit(UiEvent::MicMuted(muted));
            }
            UserCommand::SendText(text) => self.send_text(text),
            UserCommand::SaveNote => {
                self.save_note();
            }
            UserCommand::ProcessNote => {
                if let Some(text) = self.save_note() {
                    self.submit_text(text, true);
                }
            }
            UserCommand::Reconnect => self.reconnect(),
            UserCommand::GoOffline => self.go_offline(),
            UserCommand::Disconnect => {
                self.stop_capture(false);
                self.abort_turn(true);
                if let Some(transport) = self.transport.as_mut() {
                    transport.disconnect();
                }
                self.backlog.clear();
                self.emit(UiEvent::Connection(ConnectionState::Disconnected));
                self.set_phase(Phase::Disconnected);
            }
            UserCommand::Reset => self.reset(),
            UserCommand::Quit => {
                self.teardown();
                self.quit = true;
            }
        }
    }

    fn start_listening(&mut self) {
        if self.listening_disabled {
            self.emit(UiEvent::Notice("Microphone unavailable; listening is disabled.".into()));
            return;
        }
        match self.phase {
            Phase::Listening => {
                log::debug!("[session] already listening");
                return;
            }
            Phase::Disconnected => {
                self.emit(UiEvent::Notice(
                    "Disconnected. Reconnect or go offline to continue.".into(),
                ));
                return;
            }
            Phase::Processing | Phase::Speaking => {
                log::info!("[session] listening again; abandoning current turn");
                self.abort_turn(true);
            }
            Phase::Idle | Phase::Error => {}
        }

        let mode = self.begin_realtime();
        self.open_turn(mode);

        if let Err(e) = self.capture.start(self.frames_tx.clone()) {
            self.turn = None;
            match e {
                Error::PermissionDenied(msg) => {
                    log::error!("[session] microphone unavailable: {}", msg);
                    self.listening_disabled = true;
                    self.emit(UiEvent::ListeningDisabled(msg));
                }
                other => {
                    log::error!("[session] capture failed: {}", other);
                    self.emit(UiEvent::Error(other.to_string()));
                }
            }
            self.set_phase(Phase::Error);
            return;
        }

        if let Some(recognizer) = self.recognizer.as_mut() {
            match recognizer.start() {
                Ok(stream) => self.recognition = Some(stream),
                Err(e) => {
                    log::warn!("[session] live transcript unavailable: {}", e);
                    self.emit(UiEvent::Notice(format!("Live transcript unavailable: {}", e)));
                }
            }
        }
        self.set_phase(Phase::Listening);
    }

    /// Pick the mode for a new turn, connecting lazily when realtime is in use.
    fn begin_realtime(&mut self) -> TurnMode {
        if self.offline {
            return TurnMode::Local;
        }
        let Some(transport) = self.transport.as_mut() else {
            return TurnMode::Local;
        };
        match transport.state() {
            ConnectionState::Connected => {
                if let Err(e) = transport.send_control(ControlCommand::ClearAudio) {
                    log::warn!("[session] clearing input buffer failed: {}", e);
                }
                TurnMode::Realtime
            }
            ConnectionState::Connecting => TurnMode::Realtime,
            ConnectionState::Disconnected | ConnectionState::Closing => match transport.connect() {
                Ok(()) => {
                    self.emit(UiEvent::Connection(ConnectionState::Connecting));
                    TurnMode::Realtime
                }
                Err(e) => {
                    log::warn!("[session] realtime unavailable, using offline mode: {}", e);
                    self.offline = true;
                    self.emit(UiEvent::Notice(format!("Realtime unavailable ({}); offline mode.", e)));
                    TurnMode::Local
                }
            },
        }
    }

    fn open_turn(&mut self, mode: TurnMode) {
        let id = self.next_turn;
        self.next_turn += 1;
        log::info!("[session] turn {} ({:?})", id, mode);
        self.turn = Some(Turn::new(id, mode));
        self.backlog.clear();
        self.transcript.clear();
        self.response.clear();
        self.emit(UiEvent::TranscriptCleared);
    }

    fn stop_listening(&mut self) {
        if self.phase != Phase::Listening {
            log::debug!("[session] stop ignored in {:?}", self.phase);
            return;
        }
        self.stop_capture(true);
        self.set_phase(Phase::Processing);

        let state = self.realtime_state();
        let Some(turn) = self.turn.as_mut() else {
            self.set_phase(Phase::Idle);
            return;
        };
        turn.touch();
        match (turn.mode, state) {
            (TurnMode::Realtime, ConnectionState::Connected) => self.request_response(),
            (TurnMode::Realtime, ConnectionState::Connecting) => {
                log::info!("[session] response requested once connected");
                turn.request_on_connect = true;
            }
            (TurnMode::Realtime, _) => self.fail_turn("Not connected to the assistant."),
            (TurnMode::Local, _) => {
                let prompt = self.transcript.trim().to_string();
                if prompt.is_empty() {
                    self.turn = None;
                    self.emit(UiEvent::Notice("I didn't catch that.".into()));
                    self.set_phase(Phase::Idle);
                    return;
                }
                turn.requested = true;
                let id = turn.id;
                self.completion.request(id, prompt);
            }
        }
    }

    /// Stop capture and the recognizer; frames still queued are forwarded
    /// when `forward` is set, discarded otherwise.
    fn stop_capture(&mut self, forward: bool) {
        if !self.capture.is_active() {
            return;
        }
        self.capture.stop();
        while let Ok(frame) = self.frames_rx.try_recv() {
            if forward {
                self.route_frame(frame);
            }
        }
        if let Some(recognizer) = self.recognizer.as_mut() {
            recognizer.stop();
        }
        self.recognition = None;
        if !self.transcript.is_empty() {
            self.last_transcript = self.transcript.clone();
        }
    }

    fn request_response(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let mut commands = Vec::new();
        if let Some(text) = turn.pending_text.take() {
            commands.push(ControlCommand::AppendTextMessage(text));
        } else if turn.frames_sent > 0 {
            commands.push(ControlCommand::CommitAudio);
        }
        commands.push(ControlCommand::CreateResponse);
        turn.request_on_connect = false;
        turn.requested = true;
        turn.touch();
        let id = turn.id;
        let sent = commands
            .into_iter()
            .try_for_each(|command| transport.send_control(command));
        match sent {
            Ok(()) => {
                self.unstarted += 1;
                log::info!("[session] response requested for turn {}", id);
            }
            Err(e) => {
                log::error!("[session] requesting response failed: {}", e);
                self.fail_turn(&e.to_string());
            }
        }
    }

    fn send_text(&mut self, text: String) {
        self.submit_text(text, false);
    }

    /// Starts a typed turn. `completion_only` bypasses the realtime model.
    fn submit_text(&mut self, text: String, completion_only: bool) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        match self.phase {
            Phase::Disconnected if !completion_only => {
                self.emit(UiEvent::Notice(
                    "Disconnected. Reconnect or go offline to continue.".into(),
                ));
                return;
            }
            Phase::Listening => {
                self.stop_capture(false);
                self.abort_turn(false);
            }
            Phase::Processing | Phase::Speaking => self.abort_turn(true),
            Phase::Idle | Phase::Error | Phase::Disconnected => {}
        }
        let mode = if completion_only {
            TurnMode::Local
        } else {
            self.begin_realtime()
        };
        self.open_turn(mode);
        self.transcript = text.clone();
        self.last_transcript = text.clone();
        self.emit(UiEvent::Transcript(text.clone()));
        self.set_phase(Phase::Processing);

        let state = self.realtime_state();
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        match mode {
            TurnMode::Realtime => {
                turn.pending_text = Some(text);
                if state == ConnectionState::Connected {
                    self.request_response();
                } else {
                    turn.request_on_connect = true;
                }
            }
            TurnMode::Local => {
                turn.requested = true;
                let id = turn.id;
                self.completion.request(id, text);
            }
        }
    }

    fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        if muted {
            self.playback.mute();
            self.synthesizer.cancel();
            if let Some(turn) = self.turn.as_mut() {
                turn.utterance = None;
            }
        } else {
            self.playback.unmute();
        }
        log::info!("[session] output {}", if muted { "muted" } else { "unmuted" });
        self.emit(UiEvent::Muted(muted));
        self.maybe_finish_turn();
    }

    fn save_note(&mut self) -> Option<String> {
        let text = if self.transcript.trim().is_empty() {
            self.last_transcript.trim().to_string()
        } else {
            self.transcript.trim().to_string()
        };
        if text.is_empty() {
            self.emit(UiEvent::Notice("Nothing to save yet.".into()));
            return None;
        }
        self.notes.push(text.clone());
        let index = self.notes.len();
        log::info!("[session] note {} saved", index);
        self.emit(UiEvent::NoteSaved {
            index,
            text: text.clone(),
        });
        Some(text)
    }

    fn reconnect(&mut self) {
        if matches!(self.phase, Phase::Listening | Phase::Processing | Phase::Speaking) {
            self.emit(UiEvent::Notice("Finish the current turn before reconnecting.".into()));
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            self.emit(UiEvent::Notice("No realtime connection configured.".into()));
            return;
        };
        self.offline = false;
        match transport.connect() {
            Ok(()) => {
                let state = transport.state();
                self.emit(UiEvent::Connection(state));
                self.set_phase(Phase::Idle);
            }
            Err(e) => {
                log::error!("[session] reconnect failed: {}", e);
                self.emit(UiEvent::Error(e.to_string()));
            }
        }
    }

    fn go_offline(&mut self) {
        self.stop_capture(false);
        self.abort_turn(true);
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
        self.backlog.clear();
        self.offline = true;
        self.emit(UiEvent::Connection(ConnectionState::Disconnected));
        self.emit(UiEvent::Notice("Offline mode.".into()));
        self.set_phase(Phase::Idle);
    }

    fn reset(&mut self) {
        self.stop_capture(false);
        self.abort_turn(true);
        self.playback.stop_all();
        self.synthesizer.cancel();
        self.backlog.clear();
        self.listening_disabled = false;
        self.transcript.clear();
        self.response.clear();
        self.emit(UiEvent::TranscriptCleared);
        self.set_phase(Phase::Idle);
    }

    // ---- capture ----

    fn on_frame(&mut self, frame: AudioFrame) {
        if self.phase != Phase::Listening {
            log::debug!("[session] dropping frame outside listening");
            return;
        }
        self.route_frame(frame);
    }

    fn route_frame(&mut self, frame: AudioFrame) {
        if let Some(recognizer) = self.recognizer.as_mut() {
            recognizer.accept_frame(&frame);
        }
        let realtime = matches!(self.turn.as_ref(), Some(t) if t.mode == TurnMode::Realtime);
        if !realtime {
            return;
        }
        if self.mic_muted {
            self.stats.frames_rejected += 1;
            return;
        }
        match self.realtime_state() {
            ConnectionState::Connected => self.send_frame(frame),
            ConnectionState::Connecting => {
                if self.backlog.len() == MAX_BACKLOG {
                    self.backlog.pop_front();
                    self.stats.frames_rejected += 1;
                }
                self.backlog.push_back(frame);
            }
            _ => self.stats.frames_rejected += 1,
        }
    }

    fn send_frame(&mut self, frame: AudioFrame) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.send_audio_frame(&frame) {
            Ok(()) => {
                self.stats.record_frame(frame.len());
                if let Some(turn) = self.turn.as_mut() {
                    turn.frames_sent += 1;
                }
            }
            Err(Error::NotConnected) => {
                self.stats.frames_rejected += 1;
                log::error!("[session] audio frame sent on a dead transport");
                self.fail_turn("Not connected to the assistant.");
            }
            Err(e) => {
                self.stats.frames_rejected += 1;
                log::warn!("[session] audio frame dropped: {}", e);
            }
        }
    }

    // ---- transport ----

    fn on_transport(&mut self, msg: TransportMessage) {
        let current = self.transport.as_ref().map(|t| t.connection());
        if current != Some(msg.connection) {
            log::debug!("[session] event from stale connection {}", msg.connection);
            return;
        }
        match msg.event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Closed { reason } => {
                if self.phase != Phase::Disconnected {
                    self.to_disconnected(&reason);
                }
            }
            TransportEvent::Stream(inbound) => self.on_stream(inbound),
        }
    }

    fn on_connected(&mut self) {
        log::info!("[session] realtime connected");
        self.unstarted = 0;
        self.emit(UiEvent::Connection(ConnectionState::Connected));
        let backlog: Vec<AudioFrame> = self.backlog.drain(..).collect();
        let realtime = matches!(self.turn.as_ref(), Some(t) if t.mode == TurnMode::Realtime);
        if !realtime {
            return;
        }
        if !backlog.is_empty() {
            log::debug!("[session] flushing {} backlog frames", backlog.len());
        }
        for frame in backlog {
            self.send_frame(frame);
        }
        if self.turn.as_ref().is_some_and(|t| t.request_on_connect) {
            self.request_response();
        }
    }

    fn on_stream(&mut self, inbound: Inbound) {
        let Inbound { response_id, event } = inbound;
        if let StreamEvent::Error { message } = &event {
            let message = message.clone();
            self.to_disconnected(&message);
            return;
        }
        let Some(id) = response_id else {
            if event == StreamEvent::Interrupted {
                self.interrupted();
            }
            return;
        };
        if self.retired.contains(&id) {
            log::debug!("[session] event for finished response {}", id);
            return;
        }
        if event == StreamEvent::ResponseStarted {
            self.on_response_started(id);
            return;
        }
        let Some(turn) = self
            .turn
            .as_mut()
            .filter(|t| t.response_id.as_deref() == Some(id.as_str()))
        else {
            log::debug!("[session] event for unbound response {} ignored", id);
            return;
        };
        turn.touch();

        match event {
            StreamEvent::TranscriptDelta { text } => {
                self.response.push_str(&text);
                self.emit(UiEvent::ResponseDelta(text));
            }
            StreamEvent::AudioDelta { pcm } => self.on_audio(&pcm),
            StreamEvent::TurnCompleted {
                final_transcript,
                final_audio,
            } => {
                if let Some(pcm) = final_audio {
                    self.on_audio(&pcm);
                }
                self.on_turn_completed(final_transcript);
            }
            StreamEvent::Interrupted => self.interrupted(),
            StreamEvent::ResponseStarted | StreamEvent::Error { .. } => {}
        }
    }

    /// The server answers `response.create` messages in order, so only the
    /// last one outstanding belongs to the current turn. Earlier ones were
    /// requested by turns since abandoned.
    fn on_response_started(&mut self, id: String) {
        self.unstarted = self.unstarted.saturating_sub(1);
        let waiting = self.turn.as_mut().filter(|t| {
            t.mode == TurnMode::Realtime && t.requested && t.response_id.is_none()
        });
        match waiting {
            Some(turn) if self.unstarted == 0 => {
                log::debug!("[session] turn {} bound to response {}", turn.id, id);
                turn.response_id = Some(id);
                turn.touch();
            }
            _ => {
                log::debug!("[session] response {} belongs to an abandoned turn", id);
                self.retired.retire(Some(id));
            }
        }
    }

    fn on_audio(&mut self, pcm: &[i16]) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.stats.audio_chunks += 1;
        self.playback.enqueue(pcm, seq, turn.id);
        if !turn.audio_started {
            turn.audio_started = true;
            self.set_phase(Phase::Speaking);
            self.emit(UiEvent::AssistantSpeaking(!self.muted));
        }
    }

    fn on_turn_completed(&mut self, final_transcript: String) {
        if self.response.is_empty() && !final_transcript.is_empty() {
            self.response = final_transcript;
        }
        let text = self.response.clone();
        self.emit(UiEvent::ResponseFinished(text.clone()));
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        turn.response_done = true;
        if !turn.audio_started && !self.muted && !text.trim().is_empty() {
            log::info!("[session] turn {} had no audio; speaking locally", turn.id);
            self.speak(&text);
        }
        self.maybe_finish_turn();
    }

    fn interrupted(&mut self) {
        match self.phase {
            Phase::Listening => {
                if let Some(turn) = self.turn.as_ref() {
                    self.playback.discard_other_turns(turn.id);
                }
            }
            Phase::Processing | Phase::Speaking => {
                log::info!("[session] interrupted; listening again");
                self.abort_turn(false);
                self.start_listening();
            }
            _ => log::debug!("[session] interruption ignored in {:?}", self.phase),
        }
    }

    fn to_disconnected(&mut self, reason: &str) {
        log::error!("[session] connection lost: {}", reason);
        self.stop_capture(false);
        if self.turn.is_some() {
            self.stats.turns_failed += 1;
            self.abort_turn(false);
        }
        self.backlog.clear();
        if let Some(transport) = self.transport.as_mut() {
            transport.disconnect();
        }
        self.emit(UiEvent::Error(reason.to_string()));
        self.emit(UiEvent::Connection(ConnectionState::Disconnected));
        self.set_phase(Phase::Disconnected);
    }

    // ---- local fallback ----

    fn on_recognition(&mut self, msg: RecognitionMessage) {
        if self.recognition != Some(msg.stream) {
            log::debug!("[session] event from finished recognizer stream {}", msg.stream);
            return;
        }
        match msg.event {
            RecognitionEvent::Transcript(text) => {
                if self.phase != Phase::Listening {
                    log::debug!("[session] late transcript ignored");
                    return;
                }
                self.transcript = text.clone();
                self.emit(UiEvent::Transcript(text));
            }
            RecognitionEvent::EndOfSpeech => {
                if self.phase == Phase::Listening && self.config.auto_submit {
                    log::info!("[session] end of speech");
                    self.stop_listening();
                }
            }
            RecognitionEvent::Error(message) => {
                log::warn!("[session] recognition error: {}", message);
                self.emit(UiEvent::Notice(format!("Live transcript stopped: {}", message)));
            }
        }
    }

    fn on_completion(&mut self, reply: CompletionReply) {
        let current = self
            .turn
            .as_ref()
            .is_some_and(|t| t.id == reply.turn && t.mode == TurnMode::Local && !t.response_done);
        if !current {
            log::debug!("[session] completion for stale turn {}", reply.turn);
            return;
        }
        match reply.result {
            Ok(text) => {
                self.response = text.clone();
                self.emit(UiEvent::ResponseFinished(text.clone()));
                if let Some(turn) = self.turn.as_mut() {
                    turn.response_done = true;
                }
                if !self.muted && !text.trim().is_empty() {
                    self.speak(&text);
                }
                self.maybe_finish_turn();
            }
            Err(e) => {
                log::error!("[session] completion failed: {}", e);
                self.fail_turn(FALLBACK_MESSAGE);
            }
        }
    }

    fn speak(&mut self, text: &str) {
        match self.synthesizer.speak(text) {
            Ok(utterance) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.utterance = Some(utterance);
                }
            }
            Err(e) => {
                log::warn!("[session] local speech failed: {}", e);
                self.emit(UiEvent::Notice(format!("Speech unavailable: {}", e)));
            }
        }
    }

    fn on_speech(&mut self, event: SpeechEvent) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.utterance != Some(event.utterance()) {
            log::debug!("[session] speech event for stale utterance {}", event.utterance());
            return;
        }
        match event {
            SpeechEvent::Started { .. } | SpeechEvent::Boundary { .. } => {
                if self.phase == Phase::Processing {
                    self.set_phase(Phase::Speaking);
                    self.emit(UiEvent::AssistantSpeaking(true));
                }
            }
            SpeechEvent::Ended { .. } => {
                turn.utterance = None;
                self.maybe_finish_turn();
            }
            SpeechEvent::Failed { message, .. } => {
                turn.utterance = None;
                log::warn!("[session] local speech failed: {}", message);
                self.emit(UiEvent::Notice(format!("Speech failed: {}", message)));
                self.maybe_finish_turn();
            }
        }
    }

    // ---- turn endings ----

    fn on_stall(&mut self) {
        let stalled = self.response_deadline().is_some_and(|d| d <= Instant::now());
        if !stalled {
            return;
        }
        log::warn!("[session] response stalled; cancelling turn");
        self.fail_turn(FALLBACK_MESSAGE);
    }

    /// Wrap up the current turn once the response and its audio are done.
    fn maybe_finish_turn(&mut self) {
        let done = self.turn.as_ref().is_some_and(|t| {
            t.response_done && t.utterance.is_none() && self.playback.is_idle()
        });
        if !done || !matches!(self.phase, Phase::Processing | Phase::Speaking) {
            return;
        }
        if let Some(turn) = self.turn.take() {
            log::info!("[session] turn {} complete", turn.id);
            self.retired.retire(turn.response_id);
        }
        self.stats.turns_completed += 1;
        if !self.transcript.is_empty() {
            self.last_transcript = std::mem::take(&mut self.transcript);
        }
        self.emit(UiEvent::TranscriptCleared);
        self.set_phase(Phase::Idle);
    }

    /// Abandon the current turn, show `message` and return to idle.
    fn fail_turn(&mut self, message: &str) {
        self.stats.turns_failed += 1;
        self.abort_turn(true);
        self.response = message.to_string();
        self.emit(UiEvent::ResponseFinished(message.to_string()));
        self.set_phase(Phase::Idle);
    }

    /// Drop the current turn and everything it queued; optionally cancel
    /// its remote response.
    fn abort_turn(&mut self, cancel_remote: bool) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        log::debug!("[session] aborting turn {}", turn.id);
        self.playback.discard_turn(turn.id);
        if turn.utterance.is_some() {
            self.synthesizer.cancel();
        }
        let cancel = cancel_remote
            && turn.mode == TurnMode::Realtime
            && turn.requested
            && !turn.response_done
            && self.realtime_state() == ConnectionState::Connected;
        if cancel {
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.send_control(ControlCommand::CancelResponse) {
                    log::warn!("[session] cancel failed: {}", e);
                }
            }
        }
        self.retired.retire(turn.response_id);
        self.backlog.clear();
    }
}
