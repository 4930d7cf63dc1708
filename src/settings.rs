use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::DEFAULT_FRAME_SIZE;
use crate::fallback::CompletionBackend;
use crate::provider::ProviderSettings;
use crate::realtime::{RealtimeConfig, DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_URL, JARVIS_INSTRUCTIONS};
use crate::session::SessionConfig;
use crate::{Error, Result};

/// Everything the `jarvis` binary reads from `settings.json`.
///
/// Missing keys take their [`Default`] value, so older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub realtime_url: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    /// Keyed by service: `{"openai": "sk-...", "deepgram": "..."}`.
    pub api_keys: HashMap<String, String>,
    /// Local transcript service, `openai` or `deepgram`.
    pub recognition_provider: String,
    pub transcription_model: String,
    pub language: String,
    pub mic_device: String,
    pub output_device: String,
    /// `POST {prompt}` endpoint for offline mode. Empty calls OpenAI directly.
    pub completion_url: String,
    pub completion_model: String,
    /// Empty picks `say` on macOS, `espeak-ng` elsewhere.
    pub synthesis_program: String,
    pub synthesis_voice: String,
    pub speech_rate: u32,
    pub frame_size: usize,
    pub connect_timeout_secs: u64,
    pub connect_attempts: u32,
    /// Seconds without progress before a response is abandoned; 0 disables.
    pub response_timeout_secs: u64,
    pub auto_submit: bool,
    pub start_muted: bool,
}

impl Settings {
    pub fn key(&self, service: &str) -> &str {
        self.api_keys.get(service).map_or("", String::as_str)
    }

    /// An empty key forgets the service.
    pub fn set_key(&mut self, service: &str, key: String) {
        match key.trim() {
            "" => {
                self.api_keys.remove(service);
            }
            _ => {
                self.api_keys.insert(service.to_string(), key);
            }
        }
    }

    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            url: self.realtime_url.clone(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            api_key: self.key("openai").to_string(),
            instructions: self.instructions.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            connect_attempts: self.connect_attempts.max(1),
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            api_key: self.key(&self.recognition_provider).to_string(),
            transcription_model: self.transcription_model.clone(),
            language: self.language.clone(),
        }
    }

    pub fn completion_backend(&self) -> CompletionBackend {
        if self.completion_url.trim().is_empty() {
            CompletionBackend::OpenAi {
                api_key: self.key("openai").to_string(),
                model: self.completion_model.clone(),
            }
        } else {
            CompletionBackend::Endpoint {
                url: self.completion_url.clone(),
            }
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            response_timeout: (self.response_timeout_secs > 0)
                .then(|| Duration::from_secs(self.response_timeout_secs)),
            auto_submit: self.auto_submit,
            start_muted: self.start_muted,
        }
    }

    fn non_empty(value: &str) -> Option<String> {
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    pub fn mic_device(&self) -> Option<String> {
        Self::non_empty(&self.mic_device)
    }

    pub fn output_device(&self) -> Option<String> {
        Self::non_empty(&self.output_device)
    }

    pub fn synthesis_program(&self) -> Option<String> {
        Self::non_empty(&self.synthesis_program)
    }

    pub fn synthesis_voice(&self) -> Option<String> {
        Self::non_empty(&self.synthesis_voice)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            realtime_url: DEFAULT_REALTIME_URL.into(),
            model: DEFAULT_REALTIME_MODEL.into(),
            voice: "alloy".into(),
            instructions: JARVIS_INSTRUCTIONS.into(),
            api_keys: HashMap::new(),
            recognition_provider: "openai".into(),
            transcription_model: "gpt-4o-mini-transcribe".into(),
            language: "en".into(),
            mic_device: String::new(),
            output_device: String::new(),
            completion_url: String::new(),
            completion_model: "gpt-4o".into(),
            synthesis_program: String::new(),
            synthesis_voice: String::new(),
            speech_rate: 175,
            frame_size: DEFAULT_FRAME_SIZE,
            connect_timeout_secs: 10,
            connect_attempts: 3,
            response_timeout_secs: 30,
            auto_submit: true,
            start_muted: false,
        }
    }
}

pub fn settings_path() -> Result<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Jarvis").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".jarvis").join("settings.json"));
    }
    Err(Error::Config("failed to resolve data directory".into()))
}

/// Load settings from `path`. A missing file yields defaults; an unreadable
/// one is logged and replaced by defaults.
pub fn load(path: &Path) -> Settings {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("[settings] cannot read {}: {}", path.display(), e);
            }
            return Settings::default();
        }
    };
    match serde_json::from_str(&text) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("[settings] ignoring malformed {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

pub fn save(settings: &Settings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;
    Ok(())
}
