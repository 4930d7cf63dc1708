use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc as std_mpsc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use jarvis_voice::audio::{
    list_input_devices, CaptureConstraints, MicrophoneCapture, PlaybackSequencer, SpeakerOutput,
};
use jarvis_voice::fallback::{CompletionClient, StreamingRecognizer, SystemVoice};
use jarvis_voice::realtime::{RealtimeClient, Transport};
use jarvis_voice::session::{self, Components, Session, UserCommand};
use jarvis_voice::settings::{self, Settings};
use jarvis_voice::state::UiEvent;

/// JARVIS - realtime voice assistant for the terminal
#[derive(Parser)]
#[command(name = "jarvis", version, about)]
struct Cli {
    /// Settings file (defaults to the per-user data directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Skip the realtime model; answer with text completion and local speech
    #[arg(long)]
    offline: bool,

    /// Input device name
    #[arg(long)]
    device: Option<String>,

    /// Print input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Start with assistant audio muted
    #[arg(long)]
    muted: bool,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "DEEPGRAM_API_KEY", hide_env_values = true)]
    deepgram_key: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list_devices {
        for name in list_input_devices() {
            println!("{}", name);
        }
        return ExitCode::SUCCESS;
    }

    let path = match cli.settings.clone().map(Ok).unwrap_or_else(settings::settings_path) {
        Ok(path) => path,
        Err(e) => {
            log::error!("[jarvis] {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut settings = settings::load(&path);
    apply_cli(&mut settings, &cli);
    log::info!("[jarvis] settings from {}", path.display());

    let (senders, receivers) = session::channels();
    let (ui_tx, ui_rx) = std_mpsc::channel::<UiEvent>();
    let printer = std::thread::spawn(move || print_events(ui_rx));

    let transport: Option<Box<dyn Transport>> = if cli.offline {
        None
    } else {
        Some(Box::new(RealtimeClient::new(
            settings.realtime_config(),
            senders.transport.clone(),
        )))
    };
    let components = Components {
        capture: Box::new(MicrophoneCapture::new(
            settings.mic_device(),
            CaptureConstraints::realtime(),
            settings.frame_size,
        )),
        transport,
        recognizer: Some(Box::new(StreamingRecognizer::new(
            settings.recognition_provider.clone(),
            settings.provider_settings(),
            senders.recognition.clone(),
        ))),
        synthesizer: Box::new(SystemVoice::new(
            settings.synthesis_program(),
            settings.synthesis_voice(),
            settings.speech_rate,
            senders.speech.clone(),
        )),
        completion: Box::new(CompletionClient::new(
            settings.completion_backend(),
            senders.completion.clone(),
        )),
        playback: PlaybackSequencer::new(Box::new(SpeakerOutput::new(
            settings.output_device(),
            senders.playback.clone(),
        ))),
    };

    let mut session = Session::new(components, settings.session_config(), ui_tx);
    tokio::spawn(read_commands(senders.commands.clone()));
    print_help();

    session::driver::run(&mut session, receivers).await;

    let stats = session.stats().clone();
    drop(session);
    let _ = printer.join();
    println!(
        "frames sent: {} ({} KiB), turns: {} completed / {} failed",
        stats.frames_sent,
        stats.bytes_sent / 1024,
        stats.turns_completed,
        stats.turns_failed
    );
    ExitCode::SUCCESS
}

fn apply_cli(settings: &mut Settings, cli: &Cli) {
    if let Some(key) = cli.api_key.clone() {
        settings.set_key("openai", key);
    }
    if let Some(key) = cli.deepgram_key.clone() {
        settings.set_key("deepgram", key);
    }
    if let Some(device) = cli.device.clone() {
        settings.mic_device = device;
    }
    if cli.muted {
        settings.start_muted = true;
    }
}

fn print_help() {
    println!("Enter toggles listening. Commands: listen, stop, mute, unmute, mic off, mic on,");
    println!("say <text>, note, process, reconnect, offline, disconnect, reset, quit");
}

async fn read_commands(commands: mpsc::Sender<UserCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_command(&line) {
                Some(cmd) => {
                    let quit = cmd == UserCommand::Quit;
                    if commands.send(cmd).await.is_err() || quit {
                        return;
                    }
                }
                None => println!("unknown command: {}", line.trim()),
            },
            Ok(None) => break,
            Err(e) => {
                log::error!("[jarvis] stdin: {}", e);
                break;
            }
        }
    }
    let _ = commands.send(UserCommand::Quit).await;
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let line = line.trim();
    if let Some(text) = line.strip_prefix("say ") {
        return Some(UserCommand::SendText(text.to_string()));
    }
    let cmd = match line.to_ascii_lowercase().as_str() {
        "" => UserCommand::ToggleListening,
        "listen" | "l" => UserCommand::StartListening,
        "stop" | "s" => UserCommand::StopListening,
        "mute" | "m" => UserCommand::ToggleMute,
        "unmute" => UserCommand::Unmute,
        "mic off" => UserCommand::SetMicMuted(true),
        "mic on" => UserCommand::SetMicMuted(false),
        "note" | "n" => UserCommand::SaveNote,
        "process" | "p" => UserCommand::ProcessNote,
        "reconnect" => UserCommand::Reconnect,
        "offline" => UserCommand::GoOffline,
        "disconnect" => UserCommand::Disconnect,
        "reset" => UserCommand::Reset,
        "quit" | "q" | "exit" => UserCommand::Quit,
        _ => return None,
    };
    Some(cmd)
}

fn print_events(events: std_mpsc::Receiver<UiEvent>) {
    let mut streaming = false;
    for event in events {
        let ts = chrono::Local::now().format("%H:%M:%S");
        if streaming && !matches!(event, UiEvent::ResponseDelta(_)) {
            println!();
            streaming = false;
        }
        match event {
            UiEvent::ResponseDelta(text) => {
                if !streaming {
                    print!("[{}] JARVIS: ", ts);
                    streaming = true;
                }
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
            UiEvent::Phase(phase) => println!("[{}] -- {:?}", ts, phase),
            UiEvent::Connection(state) => println!("[{}] connection: {:?}", ts, state),
            UiEvent::Transcript(text) => println!("[{}] you: {}", ts, text),
            UiEvent::TranscriptCleared | UiEvent::AssistantSpeaking(_) => {}
            UiEvent::ResponseFinished(text) => println!("[{}] JARVIS (final): {}", ts, text),
            UiEvent::Muted(muted) => println!("[{}] audio {}", ts, if muted { "muted" } else { "on" }),
            UiEvent::MicMuted(muted) => println!("[{}] mic {}", ts, if muted { "muted" } else { "on" }),
            UiEvent::ListeningDisabled(reason) => println!("[{}] listening disabled: {}", ts, reason),
            UiEvent::NoteSaved { index, text } => println!("[{}] note {}: {}", ts, index, text),
            UiEvent::Notice(text) => println!("[{}] {}", ts, text),
            UiEvent::Error(text) => println!("[{}] error: {}", ts, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command(""), Some(UserCommand::ToggleListening));
        assert_eq!(parse_command(" Mic Off "), Some(UserCommand::SetMicMuted(true)));
        assert_eq!(
            parse_command("say what time is it"),
            Some(UserCommand::SendText("what time is it".into()))
        );
        assert_eq!(parse_command("p"), Some(UserCommand::ProcessNote));
        assert_eq!(parse_command("dance"), None);
    }
}
