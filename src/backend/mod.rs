//! Model backends hosted inside worker contexts.

#[cfg(feature = "llm")]
pub mod qwen;
pub mod scripted;
pub mod sink;
#[cfg(feature = "whisper")]
pub mod whisper;

#[cfg(feature = "llm")]
pub use qwen::QwenBackend;
pub use scripted::{CallLog, ScriptedBackend};
pub use sink::{CancelFlag, EventSender, ProgressSink, TokenSink};
#[cfg(feature = "whisper")]
pub use whisper::WhisperBackend;

use crate::error::{ModelhostError, Result};
use crate::protocol::LoadOptions;
use crate::task::{InferenceRequest, Task, TaskResult};
use async_trait::async_trait;

/// A model that can be loaded once and then run repeatedly.
///
/// A backend instance lives inside exactly one worker context and is only
/// ever driven by that context, one operation at a time.
#[async_trait]
pub trait ModelBackend: Send {
    /// Task this backend serves.
    fn task(&self) -> Task;

    /// Model name for logs and status output.
    fn name(&self) -> &str;

    /// Load the model, reporting phases and fractions through `progress`.
    async fn load(&mut self, options: &LoadOptions, progress: &mut ProgressSink) -> Result<()>;

    /// Run one inference.
    ///
    /// Streaming backends push tokens through `tokens` and must stop at the
    /// next safe point once [`TokenSink::push`] returns `false`.
    async fn infer(&mut self, request: InferenceRequest, tokens: &mut TokenSink)
    -> Result<TaskResult>;

    /// Clear cross-turn memory such as cached attention state.
    fn reset(&mut self) {}

    /// Release the loaded model.
    async fn unload(&mut self) {}

    /// Whether the backend remains usable after `infer` returned an error.
    fn survives_inference_error(&self) -> bool {
        true
    }
}

/// Stand-in for a task with no native backend in this build.
///
/// Every load fails with a message naming the missing backend.
#[derive(Debug, Clone)]
pub struct UnavailableBackend {
    task: Task,
    reason: String,
}

impl UnavailableBackend {
    pub fn new(task: Task, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ModelBackend for UnavailableBackend {
    fn task(&self) -> Task {
        self.task
    }

    fn name(&self) -> &str {
        "unavailable"
    }

    async fn load(&mut self, _options: &LoadOptions, _progress: &mut ProgressSink) -> Result<()> {
        Err(ModelhostError::load(self.reason.clone()))
    }

    async fn infer(
        &mut self,
        _request: InferenceRequest,
        _tokens: &mut TokenSink,
    ) -> Result<TaskResult> {
        Err(ModelhostError::inference(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unavailable_backend_fails_to_load() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut backend = UnavailableBackend::new(Task::Chat, "no chat backend compiled in");
        let mut progress = ProgressSink::new(tx);

        let result = backend.load(&LoadOptions::default(), &mut progress).await;
        match result {
            Err(ModelhostError::Load { message }) => {
                assert_eq!(message, "no chat backend compiled in");
            }
            other => panic!("expected load error, got {other:?}"),
        }
        assert_eq!(backend.task(), Task::Chat);
    }

    #[test]
    fn test_backend_trait_is_object_safe() {
        let backend: Box<dyn ModelBackend> =
            Box::new(UnavailableBackend::new(Task::SpeechSynthesis, "missing"));
        assert_eq!(backend.name(), "unavailable");
        assert!(backend.survives_inference_error());
    }
}
