use tokio::sync::mpsc;
use tokio::time::sleep_until;

use super::{Input, Session, UserCommand};
use crate::audio::PlaybackEnded;
use crate::fallback::{CompletionReply, RecognitionMessage, SpeechEvent};
use crate::realtime::TransportMessage;

const EVENT_QUEUE: usize = 256;

/// Sending halves handed to the session's collaborators.
#[derive(Clone)]
pub struct EventSenders {
    pub commands: mpsc::Sender<UserCommand>,
    pub transport: mpsc::Sender<TransportMessage>,
    pub recognition: mpsc::Sender<RecognitionMessage>,
    pub speech: mpsc::Sender<SpeechEvent>,
    pub playback: mpsc::Sender<PlaybackEnded>,
    pub completion: mpsc::Sender<CompletionReply>,
}

/// Receiving halves drained by [`run`].
pub struct EventReceivers {
    pub commands: mpsc::Receiver<UserCommand>,
    pub transport: mpsc::Receiver<TransportMessage>,
    pub recognition: mpsc::Receiver<RecognitionMessage>,
    pub speech: mpsc::Receiver<SpeechEvent>,
    pub playback: mpsc::Receiver<PlaybackEnded>,
    pub completion: mpsc::Receiver<CompletionReply>,
}

pub fn channels() -> (EventSenders, EventReceivers) {
    let (commands_tx, commands_rx) = mpsc::channel(EVENT_QUEUE);
    let (transport_tx, transport_rx) = mpsc::channel(EVENT_QUEUE);
    let (recognition_tx, recognition_rx) = mpsc::channel(EVENT_QUEUE);
    let (speech_tx, speech_rx) = mpsc::channel(EVENT_QUEUE);
    let (playback_tx, playback_rx) = mpsc::channel(EVENT_QUEUE);
    let (completion_tx, completion_rx) = mpsc::channel(EVENT_QUEUE);
    (
        EventSenders {
            commands: commands_tx,
            transport: transport_tx,
            recognition: recognition_tx,
            speech: speech_tx,
            playback: playback_tx,
            completion: completion_tx,
        },
        EventReceivers {
            commands: commands_rx,
            transport: transport_rx,
            recognition: recognition_rx,
            speech: speech_rx,
            playback: playback_rx,
            completion: completion_rx,
        },
    )
}

/// Feed every event source into `session` until it quits or the command
/// channel closes, then tear it down.
///
/// Must run on the thread that owns the audio streams; the session is not
/// `Send`.
pub async fn run(session: &mut Session, mut rx: EventReceivers) {
    log::info!("[driver] session loop started");
    while !session.should_quit() {
        let deadline = session.response_deadline();
        let input = tokio::select! {
            biased;
            cmd = rx.commands.recv() => match cmd {
                Some(cmd) => Input::Command(cmd),
                None => Input::Command(UserCommand::Quit),
            },
            Some(msg) = rx.transport.recv() => Input::Transport(msg),
            Some(ended) = rx.playback.recv() => Input::Playback(ended),
            Some(frame) = session.next_frame() => Input::Frame(frame),
            Some(msg) = rx.recognition.recv() => Input::Recognition(msg),
            Some(event) = rx.speech.recv() => Input::Speech(event),
            Some(reply) = rx.completion.recv() => Input::Completion(reply),
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => Input::ResponseStalled,
        };
        session.handle(input);
    }
    log::info!("[driver] session loop finished");
}
