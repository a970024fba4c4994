use crate::defaults;
use crate::error::{ModelhostError, Result};
use crate::protocol::LoadOptions;
use crate::task::Task;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub chat: ChatConfig,
    pub worker: WorkerConfig,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsrConfig {
    /// Catalog name, URL or path of the whisper model
    pub model: String,
    pub language: String,
    pub device: String,
    pub threads: Option<usize>,
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub model: String,
    pub voice: String,
    pub device: String,
}

/// Chat configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    pub model: String,
    pub device: String,
    pub max_new_tokens: usize,
    pub system_prompt: Option<String>,
}

/// Worker context and output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Directory for synthesized audio (default: system temp dir)
    pub output_dir: Option<PathBuf>,
    /// How long shutdown waits for a worker thread
    pub join_timeout_ms: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_ASR_MODEL.to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            device: defaults::DEFAULT_DEVICE.to_string(),
            threads: None,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_TTS_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
            device: defaults::DEFAULT_DEVICE.to_string(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_CHAT_MODEL.to_string(),
            device: defaults::DEFAULT_DEVICE.to_string(),
            max_new_tokens: defaults::MAX_NEW_TOKENS,
            system_prompt: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            join_timeout_ms: defaults::WORKER_JOIN_TIMEOUT_MS,
        }
    }
}

impl WorkerConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML or invalid values.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(ModelhostError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - MODELHOST_ASR_MODEL → asr.model
    /// - MODELHOST_LANGUAGE → asr.language
    /// - MODELHOST_DEVICE → asr.device, tts.device, chat.device
    /// - MODELHOST_VOICE → tts.voice
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("MODELHOST_ASR_MODEL")
            && !model.is_empty()
        {
            self.asr.model = model;
        }

        if let Ok(language) = std::env::var("MODELHOST_LANGUAGE")
            && !language.is_empty()
        {
            self.asr.language = language;
        }

        if let Ok(device) = std::env::var("MODELHOST_DEVICE")
            && !device.is_empty()
        {
            self.asr.device = device.clone();
            self.tts.device = device.clone();
            self.chat.device = device;
        }

        if let Ok(voice) = std::env::var("MODELHOST_VOICE")
            && !voice.is_empty()
        {
            self.tts.voice = voice;
        }

        self
    }

    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if !defaults::is_known_voice(&self.tts.voice) {
            return Err(ModelhostError::ConfigInvalidValue {
                key: "tts.voice".to_string(),
                message: format!("unknown voice '{}'", self.tts.voice),
            });
        }
        if self.chat.max_new_tokens == 0 {
            return Err(ModelhostError::ConfigInvalidValue {
                key: "chat.max_new_tokens".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.asr.threads == Some(0) {
            return Err(ModelhostError::ConfigInvalidValue {
                key: "asr.threads".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Options sent with `load` to the worker for `task`.
    pub fn load_options(&self, task: Task) -> LoadOptions {
        let (model, device, params) = match task {
            Task::Transcription => (
                &self.asr.model,
                &self.asr.device,
                serde_json::json!({ "language": self.asr.language }),
            ),
            Task::SpeechSynthesis => (
                &self.tts.model,
                &self.tts.device,
                serde_json::json!({ "voice": self.tts.voice }),
            ),
            Task::Chat => (
                &self.chat.model,
                &self.chat.device,
                serde_json::json!({ "max_new_tokens": self.chat.max_new_tokens }),
            ),
        };
        LoadOptions {
            device: Some(device.clone()),
            model_url: Some(model.clone()),
            params: Some(params),
        }
    }

    /// Look up a value by dotted key (e.g. `asr.model`) and render it as TOML.
    pub fn get_value_by_path(&self, key: &str) -> Result<String> {
        let root = toml::Value::try_from(self).map_err(|e| ModelhostError::ConfigParse {
            message: e.to_string(),
        })?;

        let mut value = &root;
        for part in key.split('.') {
            value = value
                .get(part)
                .ok_or_else(|| ModelhostError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "no such key".to_string(),
                })?;
        }

        Ok(match value {
            toml::Value::String(s) => s.clone(),
            toml::Value::Table(_) => toml::to_string(value).map_err(|e| {
                ModelhostError::ConfigParse {
                    message: e.to_string(),
                }
            })?,
            other => other.to_string(),
        })
    }

    /// Render the whole configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| ModelhostError::ConfigParse {
            message: e.to_string(),
        })
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/modelhost/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("modelhost")
            .join("config.toml")
    }
}
