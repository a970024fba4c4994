//! JSON messages exchanged between a controller and its worker context.

use crate::defaults::DEFAULT_VOICE;
use crate::task::{ChatMessage, InferenceRequest, TaskResult};
use serde::{Deserialize, Serialize};

/// Options attached to a `load` message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    /// Backend-specific parameters (language, voice, token limits).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl LoadOptions {
    /// Look up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }

    /// Look up an unsigned integer parameter.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.as_ref()?.get(key)?.as_u64()
    }
}

/// Payload of a `run` message: audio for transcription or text for synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunPayload {
    Audio {
        audio: Vec<f32>,
    },
    Speech {
        text: String,
        #[serde(default = "default_voice")]
        voice: String,
    },
}

fn default_voice() -> String {
    DEFAULT_VOICE.to_string()
}

/// Messages sent from a controller to its worker context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Load the backend's model
    Load {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<LoadOptions>,
    },
    /// Run a chat turn over the full history
    Generate { data: Vec<ChatMessage> },
    /// Run a transcription or synthesis
    Run { data: RunPayload },
    /// Cooperatively stop the current generation
    Interrupt,
    /// Clear backend memory (cached attention state)
    Reset,
    /// Release the model while keeping the context alive
    Unload,
}

impl ControlMessage {
    pub fn load(options: LoadOptions) -> Self {
        ControlMessage::Load {
            data: Some(options),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Load { .. } => "load",
            ControlMessage::Generate { .. } => "generate",
            ControlMessage::Run { .. } => "run",
            ControlMessage::Interrupt => "interrupt",
            ControlMessage::Reset => "reset",
            ControlMessage::Unload => "unload",
        }
    }

    /// Extract the inference request carried by `generate` or `run`.
    pub fn into_request(self) -> Option<InferenceRequest> {
        match self {
            ControlMessage::Generate { data } => Some(InferenceRequest::Chat { messages: data }),
            ControlMessage::Run {
                data: RunPayload::Audio { audio },
            } => Some(InferenceRequest::Transcribe { audio }),
            ControlMessage::Run {
                data: RunPayload::Speech { text, voice },
            } => Some(InferenceRequest::Synthesize { text, voice }),
            _ => None,
        }
    }

    /// Serialize message to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize message from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<InferenceRequest> for ControlMessage {
    fn from(request: InferenceRequest) -> Self {
        match request {
            InferenceRequest::Transcribe { audio } => ControlMessage::Run {
                data: RunPayload::Audio { audio },
            },
            InferenceRequest::Synthesize { text, voice } => ControlMessage::Run {
                data: RunPayload::Speech { text, voice },
            },
            InferenceRequest::Chat { messages } => ControlMessage::Generate { data: messages },
        }
    }
}

/// Body of a `progress` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub progress: f32,
}

/// Status events emitted by a worker context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Load phase message, optionally with a fraction
    Loading {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
    },
    /// Load progress fraction in [0, 1]
    Progress { data: ProgressData },
    /// Model loaded
    Ready,
    /// Streaming generation started
    Start,
    /// Incremental streamed output
    Update {
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tps: Option<f64>,
        #[serde(
            rename = "numTokens",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        num_tokens: Option<usize>,
    },
    /// Final result
    Complete {
        #[serde(flatten)]
        result: TaskResult,
        /// Inference time in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<f64>,
    },
    /// Load or inference failure
    Error { error: String },
}

/// Event status without its payload, used as the event bus key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Loading,
    Progress,
    Ready,
    Start,
    Update,
    Complete,
    Error,
}

impl WorkerEvent {
    pub fn loading(message: impl Into<String>, progress: Option<f32>) -> Self {
        WorkerEvent::Loading {
            data: message.into(),
            progress,
        }
    }

    pub fn progress(fraction: f32) -> Self {
        WorkerEvent::Progress {
            data: ProgressData { progress: fraction },
        }
    }

    pub fn complete(result: TaskResult, time: Option<f64>) -> Self {
        WorkerEvent::Complete { result, time }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WorkerEvent::Error {
            error: message.into(),
        }
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            WorkerEvent::Loading { .. } => StatusKind::Loading,
            WorkerEvent::Progress { .. } => StatusKind::Progress,
            WorkerEvent::Ready => StatusKind::Ready,
            WorkerEvent::Start => StatusKind::Start,
            WorkerEvent::Update { .. } => StatusKind::Update,
            WorkerEvent::Complete { .. } => StatusKind::Complete,
            WorkerEvent::Error { .. } => StatusKind::Error,
        }
    }

    /// Whether this event ends a `load`, `generate` or `run`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Ready | WorkerEvent::Complete { .. } | WorkerEvent::Error { .. }
        )
    }

    /// Load fraction carried by `loading` or `progress` events.
    pub fn fraction(&self) -> Option<f32> {
        match self {
            WorkerEvent::Loading { progress, .. } => *progress,
            WorkerEvent::Progress { data } => Some(data.progress),
            _ => None,
        }
    }

    /// Serialize event to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize event from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
