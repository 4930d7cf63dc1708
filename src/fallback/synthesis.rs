use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, OnceCell};

use crate::{Error, Result};

/// Progress of one local utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    Started { utterance: u64 },
    /// Word-level progress, paced by the speaking rate.
    Boundary { utterance: u64, word_index: usize },
    Ended { utterance: u64 },
    Failed { utterance: u64, message: String },
}

impl SpeechEvent {
    pub fn utterance(&self) -> u64 {
        match self {
            SpeechEvent::Started { utterance }
            | SpeechEvent::Boundary { utterance, .. }
            | SpeechEvent::Ended { utterance }
            | SpeechEvent::Failed { utterance, .. } => *utterance,
        }
    }
}

/// Local text-to-speech.
pub trait Synthesizer {
    /// Start speaking `text`, replacing any utterance in progress.
    fn speak(&mut self, text: &str) -> Result<u64>;
    /// Halt output now. The cancelled utterance never reports `Ended`.
    fn cancel(&mut self);
    fn is_speaking(&self) -> bool;
}

/// Line breaks become spaces so the synthesizer reads one sentence stream.
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string()
}

/// The preferred voice when installed, otherwise the first one listed.
pub fn select_voice(available: &[String], preferred: &str) -> Option<String> {
    available
        .iter()
        .find(|v| v.eq_ignore_ascii_case(preferred))
        .or_else(|| available.first())
        .cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoiceProgram {
    Espeak,
    Say,
}

impl VoiceProgram {
    fn detect(program: &str) -> Self {
        let name = std::path::Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if name == "say" {
            VoiceProgram::Say
        } else {
            VoiceProgram::Espeak
        }
    }

    fn default_voice(self) -> &'static str {
        match self {
            VoiceProgram::Espeak => "en-gb",
            VoiceProgram::Say => "Daniel",
        }
    }

    fn list_args(self) -> &'static [&'static str] {
        match self {
            VoiceProgram::Espeak => &["--voices"],
            VoiceProgram::Say => &["-v", "?"],
        }
    }

    fn parse_voices(self, listing: &str) -> Vec<String> {
        match self {
            VoiceProgram::Espeak => parse_espeak_voices(listing),
            VoiceProgram::Say => parse_say_voices(listing),
        }
    }

    fn speak_args(self, voice: Option<&str>, words_per_minute: u32, text: &str) -> Vec<String> {
        let rate_flag = match self {
            VoiceProgram::Espeak => "-s",
            VoiceProgram::Say => "-r",
        };
        let mut args = Vec::new();
        if let Some(voice) = voice {
            args.push("-v".to_string());
            args.push(voice.to_string());
        }
        args.push(rate_flag.to_string());
        args.push(words_per_minute.to_string());
        args.push(text.to_string());
        args
    }
}

/// `espeak-ng --voices`: the language column names the voice.
fn parse_espeak_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter(|line| !line.trim_start().starts_with("Pty"))
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}

/// `say -v '?'`: `<name>  <locale>  # <sample>`, names may contain spaces.
fn parse_say_voices(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let head = line.split('#').next()?.trim();
            let (name, _locale) = head.rsplit_once(char::is_whitespace)?;
            let name = name.trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

pub fn default_program() -> &'static str {
    if cfg!(target_os = "macos") {
        "say"
    } else {
        "espeak-ng"
    }
}

/// [`Synthesizer`] driving the platform speech program as a child process.
pub struct SystemVoice {
    program: String,
    kind: VoiceProgram,
    preferred_voice: String,
    words_per_minute: u32,
    events: mpsc::Sender<SpeechEvent>,
    next_utterance: u64,
    /// Utterance currently speaking, 0 when silent.
    speaking: Arc<AtomicU64>,
    cancel: Option<oneshot::Sender<()>>,
    voices: Arc<OnceCell<Vec<String>>>,
}

impl SystemVoice {
    pub fn new(
        program: Option<String>,
        preferred_voice: Option<String>,
        words_per_minute: u32,
        events: mpsc::Sender<SpeechEvent>,
    ) -> Self {
        let program = program
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| default_program().to_string());
        let kind = VoiceProgram::detect(&program);
        let preferred_voice = preferred_voice
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| kind.default_voice().to_string());
        Self {
            program,
            kind,
            preferred_voice,
            words_per_minute: words_per_minute.clamp(80, 450),
            events,
            next_utterance: 0,
            speaking: Arc::new(AtomicU64::new(0)),
            cancel: None,
            voices: Arc::new(OnceCell::new()),
        }
    }
}

impl Synthesizer for SystemVoice {
    fn speak(&mut self, text: &str) -> Result<u64> {
        let text = normalize_text(text);
        if text.is_empty() {
            return Err(Error::Synthesis("nothing to speak".into()));
        }
        self.cancel();
        self.next_utterance += 1;
        let utterance = self.next_utterance;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);
        self.speaking.store(utterance, Ordering::SeqCst);

        tokio::spawn(run_utterance(Utterance {
            id: utterance,
            text,
            program: self.program.clone(),
            kind: self.kind,
            preferred_voice: self.preferred_voice.clone(),
            words_per_minute: self.words_per_minute,
            events: self.events.clone(),
            speaking: Arc::clone(&self.speaking),
            voices: Arc::clone(&self.voices),
            cancel: cancel_rx,
        }));
        Ok(utterance)
    }

    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.speaking.store(0, Ordering::SeqCst);
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) != 0
    }
}

impl Drop for SystemVoice {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Utterance {
    id: u64,
    text: String,
    program: String,
    kind: VoiceProgram,
    preferred_voice: String,
    words_per_minute: u32,
    events: mpsc::Sender<SpeechEvent>,
    speaking: Arc<AtomicU64>,
    voices: Arc<OnceCell<Vec<String>>>,
    cancel: oneshot::Receiver<()>,
}

async fn list_voices(program: &str, kind: VoiceProgram) -> Vec<String> {
    match Command::new(program)
        .args(kind.list_args())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => {
            let voices = kind.parse_voices(&String::from_utf8_lossy(&output.stdout));
            log::debug!("[synthesis] {} voices available", voices.len());
            voices
        }
        Err(e) => {
            log::warn!("[synthesis] could not list voices from {}: {}", program, e);
            Vec::new()
        }
    }
}

async fn run_utterance(mut job: Utterance) {
    let voices = job
        .voices
        .get_or_init(|| list_voices(&job.program, job.kind))
        .await;
    let voice = select_voice(voices, &job.preferred_voice);
    let args = job
        .kind
        .speak_args(voice.as_deref(), job.words_per_minute, &job.text);

    let finish = |event: SpeechEvent| {
        let _ = job
            .speaking
            .compare_exchange(job.id, 0, Ordering::SeqCst, Ordering::SeqCst);
        event
    };

    let mut child = match Command::new(&job.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let event = finish(SpeechEvent::Failed {
                utterance: job.id,
                message: format!("failed to run {}: {}", job.program, e),
            });
            let _ = job.events.send(event).await;
            return;
        }
    };
    log::debug!(
        "[synthesis] utterance {} with voice {:?}",
        job.id,
        voice.as_deref().unwrap_or("default")
    );
    let _ = job.events.send(SpeechEvent::Started { utterance: job.id }).await;

    let words = job.text.split_whitespace().count();
    let mut ticker =
        tokio::time::interval(Duration::from_secs_f64(60.0 / f64::from(job.words_per_minute)));
    let mut word_index = 0usize;

    let event = loop {
        tokio::select! {
            biased;
            _ = &mut job.cancel => {
                if let Err(e) = child.kill().await {
                    log::debug!("[synthesis] kill failed: {}", e);
                }
                log::debug!("[synthesis] utterance {} cancelled", job.id);
                return;
            }
            status = child.wait() => {
                break match status {
                    Ok(status) if status.success() => SpeechEvent::Ended { utterance: job.id },
                    Ok(status) => SpeechEvent::Failed {
                        utterance: job.id,
                        message: format!("{} exited with {}", job.program, status),
                    },
                    Err(e) => SpeechEvent::Failed {
                        utterance: job.id,
                        message: e.to_string(),
                    },
                };
            }
            _ = ticker.tick(), if word_index < words => {
                let _ = job
                    .events
                    .send(SpeechEvent::Boundary { utterance: job.id, word_index })
                    .await;
                word_index += 1;
            }
        }
    };
    let event = finish(event);
    let _ = job.events.send(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_line_breaks() {
        assert_eq!(normalize_text("Good\nevening,\r\nsir.\n"), "Good evening, sir.");
        assert_eq!(normalize_text("  \n "), "");
    }

    #[test]
    fn select_prefers_designated_voice() {
        let voices = vec!["af".to_string(), "en-gb".to_string(), "en-us".to_string()];
        assert_eq!(select_voice(&voices, "EN-GB").as_deref(), Some("en-gb"));
        assert_eq!(select_voice(&voices, "fr").as_deref(), Some("af"));
        assert_eq!(select_voice(&[], "fr"), None);
    }

    #[test]
    fn parses_espeak_listing() {
        let listing = "Pty Language       Age/Gender VoiceName          File                 Other Languages\n \
                       5  af              --/M      Afrikaans          gmw/af\n \
                       5  en-gb           --/M      English_(Great_Britain) gmw/en  (en 2)\n";
        assert_eq!(parse_espeak_voices(listing), vec!["af", "en-gb"]);
    }

    #[test]
    fn parses_say_listing() {
        let listing = "Alex                en_US    # Most people recognize me by my voice.\n\
                       Bad News            en_US    # The light you see at the end of the tunnel\n\
                       Daniel              en_GB    # Hello, my name is Daniel.\n";
        assert_eq!(parse_say_voices(listing), vec!["Alex", "Bad News", "Daniel"]);
    }

    #[test]
    fn program_kind_and_args() {
        assert_eq!(VoiceProgram::detect("/usr/bin/say"), VoiceProgram::Say);
        assert_eq!(VoiceProgram::detect("espeak-ng"), VoiceProgram::Espeak);
        assert_eq!(
            VoiceProgram::Say.speak_args(Some("Daniel"), 180, "hi"),
            vec!["-v", "Daniel", "-r", "180", "hi"]
        );
        assert_eq!(VoiceProgram::Espeak.speak_args(None, 175, "hi"), vec!["-s", "175", "hi"]);
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let (tx, _rx) = mpsc::channel(8);
        let mut voice = SystemVoice::new(Some("true".into()), None, 175, tx);
        assert!(matches!(voice.speak(" \n "), Err(Error::Synthesis(_))));
        assert!(!voice.is_speaking());
    }

    #[tokio::test]
    async fn missing_program_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut voice = SystemVoice::new(Some("/nonexistent/speech-program".into()), None, 175, tx);
        let id = voice.speak("hello").unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, SpeechEvent::Failed { utterance, .. } if utterance == id));
        assert!(!voice.is_speaking());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_program_reports_started_then_ended() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut voice = SystemVoice::new(Some("true".into()), None, 175, tx);
        let id = voice.speak("at your service").unwrap();
        assert!(voice.is_speaking());
        assert_eq!(rx.recv().await, Some(SpeechEvent::Started { utterance: id }));
        loop {
            match rx.recv().await.unwrap() {
                SpeechEvent::Boundary { .. } => continue,
                last => {
                    assert_eq!(last, SpeechEvent::Ended { utterance: id });
                    break;
                }
            }
        }
        assert!(!voice.is_speaking());
    }
}
