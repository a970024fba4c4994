//! Tasks, requests, results and the per-task model load state.

use crate::defaults;
use crate::error::{ModelhostError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three inference tasks.
///
/// Serialized with the identifiers used in preference files and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "whisper")]
    Transcription,
    #[serde(rename = "tts")]
    SpeechSynthesis,
    #[serde(rename = "llm")]
    Chat,
}

impl Task {
    pub const ALL: [Task; 3] = [Task::Transcription, Task::SpeechSynthesis, Task::Chat];

    /// Stable identifier (`whisper`, `tts`, `llm`).
    pub fn id(&self) -> &'static str {
        match self {
            Task::Transcription => "whisper",
            Task::SpeechSynthesis => "tts",
            Task::Chat => "llm",
        }
    }

    /// Human-readable name.
    pub fn label(&self) -> &'static str {
        match self {
            Task::Transcription => "Speech to text",
            Task::SpeechSynthesis => "Text to speech",
            Task::Chat => "Chat",
        }
    }

    /// Whether the task streams `update` events before `complete`.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Task::Chat)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Task {
    type Err = ModelhostError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper" | "asr" | "transcription" | "stt" => Ok(Task::Transcription),
            "tts" | "speech" | "synthesis" => Ok(Task::SpeechSynthesis),
            "llm" | "chat" => Ok(Task::Chat),
            other => Err(ModelhostError::validation(format!("unknown task '{other}'"))),
        }
    }
}

/// Load state of a task's model, as seen by the controller.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModelLoadState {
    #[default]
    Unloaded,
    Loading {
        progress: f32,
        message: String,
    },
    Ready,
    Failed {
        reason: String,
    },
}

impl ModelLoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelLoadState::Ready)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ModelLoadState::Loading { .. })
    }

    /// True when the variant differs, ignoring progress and messages.
    pub fn differs_in_kind(&self, other: &ModelLoadState) -> bool {
        std::mem::discriminant(self) != std::mem::discriminant(other)
    }

    /// Status line shown next to the load affordance.
    pub fn label(&self) -> String {
        match self {
            ModelLoadState::Unloaded => "Model not loaded".to_string(),
            ModelLoadState::Loading { progress, message } => {
                format!("{} ({}%)", message, (progress * 100.0).round() as u32)
            }
            ModelLoadState::Ready => "Model ready".to_string(),
            ModelLoadState::Failed { reason } => format!("Load failed: {reason}"),
        }
    }
}

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of a chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Payload of a single inference.
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceRequest {
    /// 16 kHz mono samples.
    Transcribe { audio: Vec<f32> },
    Synthesize { text: String, voice: String },
    /// Full history; the last entry is the user's new message.
    Chat { messages: Vec<ChatMessage> },
}

impl InferenceRequest {
    pub fn task(&self) -> Task {
        match self {
            InferenceRequest::Transcribe { .. } => Task::Transcription,
            InferenceRequest::Synthesize { .. } => Task::SpeechSynthesis,
            InferenceRequest::Chat { .. } => Task::Chat,
        }
    }

    /// Reject empty or malformed payloads before they reach a worker.
    pub fn validate(&self) -> Result<()> {
        match self {
            InferenceRequest::Transcribe { audio } => {
                if audio.is_empty() {
                    return Err(ModelhostError::validation("Please provide some audio"));
                }
            }
            InferenceRequest::Synthesize { text, voice } => {
                if text.trim().is_empty() {
                    return Err(ModelhostError::validation("Please enter some text"));
                }
                if !defaults::is_known_voice(voice) {
                    return Err(ModelhostError::validation(format!("Unknown voice '{voice}'")));
                }
            }
            InferenceRequest::Chat { messages } => match messages.last() {
                Some(last) if last.role == Role::User && !last.content.trim().is_empty() => {}
                Some(_) => {
                    return Err(ModelhostError::validation(
                        "Chat history must end with a non-empty user message",
                    ));
                }
                None => return Err(ModelhostError::validation("Please enter a prompt")),
            },
        }
        Ok(())
    }
}

/// Final output of an inference.
///
/// The variant names map to the completion keys of the wire protocol:
/// transcripts travel as `data`, synthesized WAV bytes as `result`,
/// chat replies as `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskResult {
    #[serde(rename = "data")]
    Transcript(String),
    #[serde(rename = "result")]
    Audio(Vec<u8>),
    #[serde(rename = "output")]
    Reply(String),
}

impl TaskResult {
    /// Text of a transcript or chat reply.
    pub fn text(&self) -> Option<&str> {
        match self {
            TaskResult::Transcript(text) | TaskResult::Reply(text) => Some(text),
            TaskResult::Audio(_) => None,
        }
    }

    /// WAV bytes of synthesized speech.
    pub fn audio(&self) -> Option<&[u8]> {
        match self {
            TaskResult::Audio(bytes) => Some(bytes),
            _ => None,
        }
    }
}
