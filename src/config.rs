//! Session configuration: defaults match the deployed assistant, a TOML
//! file and CLI/env overrides adjust per install.
//!
//! Secrets never live in the file; API keys are read from the environment
//! by the binary and handed to the adapters directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::state::TransportMode;
use crate::turn::{GateConfig, TurnStrategy};
use crate::vad::VadEngineKind;

/// Default persona instruction for the assistant.
pub const DEFAULT_SYSTEM_PROMPT: &str = "Tu es iAsted, l'assistant vocal de la Présidence de la \
République Gabonaise. Tu réponds en français, avec concision et sur un ton protocolaire.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub transport: TransportMode,
    /// Re-arm listening automatically after each assistant utterance.
    pub continuous: bool,
    pub strategy: TurnStrategy,
    /// Level (0–100) at or above which a sample counts as speech.
    pub silence_threshold: u8,
    /// Which frame classifier drives the silence gate.
    pub vad_engine: VadEngineKind,
    /// Continuous silence required to close a turn automatically.
    pub silence_window_ms: u64,
    /// Level sampling cadence.
    pub level_poll_ms: u64,
    /// Captures shorter than this are discarded as noise.
    pub min_capture_ms: u64,
    /// Hard cap on one capture.
    pub max_capture_ms: u64,
    /// Rate clips are converted to before upload.
    pub target_sample_rate: u32,
    pub frame_channel_capacity: usize,
    /// Poll cadence for the playback drain signal.
    pub playback_poll_ms: u64,
    pub language: String,
    pub system_prompt: String,
    pub sound_effects: bool,
    pub input_device: Option<String>,
    pub remote: RemoteConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::TurnBased,
            continuous: false,
            strategy: TurnStrategy::SilenceDetect,
            silence_threshold: 10,
            vad_engine: VadEngineKind::Level,
            silence_window_ms: 2000,
            level_poll_ms: 100,
            min_capture_ms: 200,
            max_capture_ms: 30_000,
            target_sample_rate: 16_000,
            frame_channel_capacity: 64,
            playback_poll_ms: 50,
            language: "fr".into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            sound_effects: true,
            input_device: None,
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub openai_base_url: String,
    pub chat_model: String,
    pub chat_temperature: f32,
    pub stream_completions: bool,
    pub transcription_model: String,
    pub elevenlabs_base_url: String,
    pub voice_id: String,
    pub tts_model: String,
    /// Trusted intermediary that issues ephemeral realtime credentials.
    pub token_endpoint: String,
    /// Channel URL used when the issuer does not return one.
    pub realtime_url: String,
    pub realtime_voice: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".into(),
            chat_model: "gpt-4o-mini".into(),
            chat_temperature: 0.7,
            stream_completions: true,
            transcription_model: "whisper-1".into(),
            elevenlabs_base_url: "https://api.elevenlabs.io".into(),
            voice_id: "9BWtsMINqrJLrRacOk9x".into(),
            tts_model: "eleven_multilingual_v2".into(),
            token_endpoint: String::new(),
            realtime_url:
                "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17".into(),
            realtime_voice: "alloy".into(),
        }
    }
}

impl VoiceConfig {
    pub fn gate(&self) -> GateConfig {
        GateConfig {
            window: Duration::from_millis(self.silence_window_ms),
            min_capture: Duration::from_millis(self.min_capture_ms),
            max_capture: Duration::from_millis(self.max_capture_ms),
        }
    }

    pub fn level_poll(&self) -> Duration {
        Duration::from_millis(self.level_poll_ms)
    }

    pub fn playback_poll(&self) -> Duration {
        Duration::from_millis(self.playback_poll_ms)
    }

    /// # Errors
    ///
    /// Returns a description of the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        if self.silence_threshold > 100 {
            bail!("silence_threshold must be on the 0-100 scale");
        }
        if self.level_poll_ms == 0 {
            bail!("level_poll_ms must be positive");
        }
        if self.silence_window_ms < self.level_poll_ms {
            bail!("silence_window_ms must be at least one poll interval");
        }
        if self.max_capture_ms <= self.min_capture_ms {
            bail!("max_capture_ms must exceed min_capture_ms");
        }
        if !(8_000..=48_000).contains(&self.target_sample_rate) {
            bail!("target_sample_rate must be between 8000 and 48000");
        }
        Ok(())
    }

    /// Conventional config location (`<config dir>/iasted/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("iasted").join("config.toml"))
    }

    /// Load from an explicit path, or the default path, or built-in
    /// defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or invalid files; a missing file is
    /// not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };
        let config = match resolved {
            Some(ref path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }
}
