//! Deterministic backend with scripted load phases, outputs and failures.
//!
//! Used by tests and by the CLI's `--mock` mode.

use super::{ModelBackend, ProgressSink, TokenSink};
use crate::audio::encode_wav;
use crate::error::{ModelhostError, Result};
use crate::protocol::LoadOptions;
use crate::task::{ChatMessage, InferenceRequest, Role, Task, TaskResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Sample rate of scripted speech output.
pub const SCRIPTED_SPEECH_RATE: u32 = 24000;

/// Observes a scripted backend from outside its worker context.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<CallLogInner>,
}

#[derive(Debug, Default)]
struct CallLogInner {
    calls: Mutex<Vec<&'static str>>,
    drops: AtomicUsize,
    saw_cancel: AtomicBool,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend operations in the order they were invoked.
    pub fn calls(&self) -> Vec<&'static str> {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    /// Number of backend instances dropped.
    pub fn drops(&self) -> usize {
        self.inner.drops.load(Ordering::SeqCst)
    }

    /// Whether a token stream stopped because of cancellation.
    pub fn saw_cancel(&self) -> bool {
        self.inner.saw_cancel.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    task: Task,
    name: String,
    load_steps: Vec<(String, f32)>,
    step_delay: Duration,
    load_failure: Option<String>,
    panic_on_load: bool,
    transcript: String,
    tokens: Option<Vec<String>>,
    token_delay: Duration,
    infer_delay: Duration,
    inference_failure: Option<String>,
    stream_failure: Option<(usize, String)>,
    fatal_errors: bool,
    loaded: bool,
    log: CallLog,
}

impl ScriptedBackend {
    /// Create a scripted backend with default load phases for `task`.
    pub fn new(task: Task) -> Self {
        let load_steps = match task {
            Task::Transcription => vec![
                ("Loading weights".to_string(), 0.5),
                ("Warming up model...".to_string(), 0.9),
            ],
            Task::SpeechSynthesis => vec![
                ("Fetching voices".to_string(), 0.3),
                ("Loading weights".to_string(), 0.8),
            ],
            Task::Chat => vec![
                ("Loading tokenizer".to_string(), 0.2),
                ("Loading weights".to_string(), 0.7),
                ("Warming up model...".to_string(), 0.9),
            ],
        };

        Self {
            task,
            name: format!("scripted-{}", task.id()),
            load_steps,
            step_delay: Duration::ZERO,
            load_failure: None,
            panic_on_load: false,
            transcript: "scripted transcription".to_string(),
            tokens: None,
            token_delay: Duration::ZERO,
            infer_delay: Duration::ZERO,
            inference_failure: None,
            stream_failure: None,
            fatal_errors: false,
            loaded: false,
            log: CallLog::default(),
        }
    }

    /// Replace the load phases reported before `ready`.
    pub fn with_load_steps(mut self, steps: &[(&str, f32)]) -> Self {
        self.load_steps = steps.iter().map(|(m, f)| (m.to_string(), *f)).collect();
        self
    }

    /// Sleep before each load phase.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Fail every load after reporting the load phases.
    pub fn with_load_failure(mut self, message: &str) -> Self {
        self.load_failure = Some(message.to_string());
        self
    }

    /// Panic inside `load`.
    pub fn with_load_panic(mut self) -> Self {
        self.panic_on_load = true;
        self
    }

    /// Text returned for transcriptions.
    pub fn with_transcript(mut self, transcript: &str) -> Self {
        self.transcript = transcript.to_string();
        self
    }

    /// Tokens streamed for chat turns instead of the default echo.
    pub fn with_tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = Some(tokens.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Sleep before each streamed token.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Sleep before producing any output.
    pub fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    /// Fail every inference.
    pub fn with_inference_failure(mut self, message: &str) -> Self {
        self.inference_failure = Some(message.to_string());
        self
    }

    /// Fail chat turns after streaming `tokens` tokens.
    pub fn with_failure_after(mut self, tokens: usize, message: &str) -> Self {
        self.stream_failure = Some((tokens, message.to_string()));
        self
    }

    /// Report that the backend is unusable after an inference error.
    pub fn with_fatal_errors(mut self) -> Self {
        self.fatal_errors = true;
        self
    }

    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    async fn pause(delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn stream_reply(
        &mut self,
        messages: &[ChatMessage],
        sink: &mut TokenSink,
    ) -> Result<TaskResult> {
        let tokens = self
            .tokens
            .clone()
            .unwrap_or_else(|| echo_tokens(messages));

        let mut output = String::new();
        for (sent, token) in tokens.into_iter().enumerate() {
            if let Some((limit, message)) = &self.stream_failure
                && sent == *limit
            {
                return Err(ModelhostError::inference(message.clone()));
            }
            Self::pause(self.token_delay).await;
            if !sink.push(token.as_str()) {
                self.log.inner.saw_cancel.store(true, Ordering::SeqCst);
                break;
            }
            output.push_str(&token);
        }
        Ok(TaskResult::Reply(output))
    }
}

/// Default chat reply: echo the last user message word by word.
fn echo_tokens(messages: &[ChatMessage]) -> Vec<String> {
    let last = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or_default();

    std::iter::once("You said:".to_string())
        .chain(last.split_whitespace().map(|w| format!(" {w}")))
        .collect()
}

/// A short 220 Hz tone, 60 ms per character.
fn synthesize_tone(text: &str) -> Vec<f32> {
    let frames_per_char = SCRIPTED_SPEECH_RATE as usize * 60 / 1000;
    let frames = text.chars().count() * frames_per_char;
    let step = 2.0 * std::f32::consts::PI * 220.0 / SCRIPTED_SPEECH_RATE as f32;
    (0..frames).map(|i| 0.2 * (i as f32 * step).sin()).collect()
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn task(&self) -> Task {
        self.task
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&mut self, _options: &LoadOptions, progress: &mut ProgressSink) -> Result<()> {
        self.log.record("load");
        if self.panic_on_load {
            panic!("scripted backend panicked while loading");
        }

        for (message, fraction) in &self.load_steps {
            Self::pause(self.step_delay).await;
            progress.phase_at(message.as_str(), *fraction);
        }

        if let Some(message) = &self.load_failure {
            return Err(ModelhostError::load(message.clone()));
        }

        self.loaded = true;
        Ok(())
    }

    async fn infer(
        &mut self,
        request: InferenceRequest,
        tokens: &mut TokenSink,
    ) -> Result<TaskResult> {
        self.log.record("infer");
        if request.task() != self.task {
            return Err(ModelhostError::inference(format!(
                "{} backend cannot run a {} request",
                self.task,
                request.task()
            )));
        }
        if !self.loaded {
            return Err(ModelhostError::inference("model not loaded"));
        }

        Self::pause(self.infer_delay).await;
        if let Some(message) = &self.inference_failure {
            return Err(ModelhostError::inference(message.clone()));
        }

        match request {
            InferenceRequest::Transcribe { .. } => Ok(TaskResult::Transcript(self.transcript.clone())),
            InferenceRequest::Synthesize { text, .. } => {
                let wav = encode_wav(&synthesize_tone(&text), SCRIPTED_SPEECH_RATE)?;
                Ok(TaskResult::Audio(wav))
            }
            InferenceRequest::Chat { messages } => self.stream_reply(&messages, tokens).await,
        }
    }

    fn reset(&mut self) {
        self.log.record("reset");
    }

    async fn unload(&mut self) {
        self.log.record("unload");
        self.loaded = false;
    }

    fn survives_inference_error(&self) -> bool {
        !self.fatal_errors
    }
}

impl Drop for ScriptedBackend {
    fn drop(&mut self) {
        self.log.inner.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CancelFlag;
    use crate::protocol::WorkerEvent;
    use tokio::sync::mpsc;

    fn sinks() -> (
        ProgressSink,
        TokenSink,
        CancelFlag,
        mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelFlag::new();
        (
            ProgressSink::new(tx.clone()),
            TokenSink::new(tx, cancel.clone()),
            cancel,
            rx,
        )
    }

    #[tokio::test]
    async fn test_load_reports_steps_in_order() {
        let (mut progress, _tokens, _cancel, mut rx) = sinks();
        let mut backend =
            ScriptedBackend::new(Task::Chat).with_load_steps(&[("a", 0.25), ("b", 0.75)]);

        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(WorkerEvent::loading("a", Some(0.25))));
        assert_eq!(rx.recv().await, Some(WorkerEvent::loading("b", Some(0.75))));
    }

    #[tokio::test]
    async fn test_load_failure() {
        let (mut progress, _tokens, _cancel, _rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Transcription).with_load_failure("no weights");
        let result = backend.load(&LoadOptions::default(), &mut progress).await;
        assert!(matches!(result, Err(ModelhostError::Load { .. })));
    }

    #[tokio::test]
    async fn test_transcription_returns_configured_text() {
        let (mut progress, mut tokens, _cancel, _rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Transcription).with_transcript("hello world");
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();

        let result = backend
            .infer(
                InferenceRequest::Transcribe {
                    audio: vec![0.0; 160],
                },
                &mut tokens,
            )
            .await
            .unwrap();
        assert_eq!(result, TaskResult::Transcript("hello world".to_string()));
    }

    #[tokio::test]
    async fn test_synthesis_returns_wav_bytes() {
        let (mut progress, mut tokens, _cancel, _rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::SpeechSynthesis);
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();

        let result = backend
            .infer(
                InferenceRequest::Synthesize {
                    text: "Hello".to_string(),
                    voice: "af".to_string(),
                },
                &mut tokens,
            )
            .await
            .unwrap();
        let audio = crate::audio::decode_wav(result.audio().unwrap()).unwrap();
        assert_eq!(audio.sample_rate, SCRIPTED_SPEECH_RATE);
        assert_eq!(audio.frames(), 5 * 1440);
    }

    #[tokio::test]
    async fn test_chat_echoes_last_user_message() {
        let (mut progress, mut tokens, _cancel, mut rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Chat);
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        let result = backend
            .infer(
                InferenceRequest::Chat {
                    messages: vec![ChatMessage::user("good morning")],
                },
                &mut tokens,
            )
            .await
            .unwrap();
        assert_eq!(result, TaskResult::Reply("You said: good morning".to_string()));
        assert_eq!(tokens.token_count(), 3);
    }

    #[tokio::test]
    async fn test_chat_stops_when_cancelled() {
        let (mut progress, mut tokens, cancel, _rx) = sinks();
        let log = CallLog::new();
        let mut backend = ScriptedBackend::new(Task::Chat)
            .with_tokens(&["a", "b", "c"])
            .with_call_log(log.clone());
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();

        cancel.cancel();
        let result = backend
            .infer(
                InferenceRequest::Chat {
                    messages: vec![ChatMessage::user("go")],
                },
                &mut tokens,
            )
            .await
            .unwrap();
        assert_eq!(result, TaskResult::Reply(String::new()));
        assert!(log.saw_cancel());
    }

    #[tokio::test]
    async fn test_chat_fails_mid_stream() {
        let (mut progress, mut tokens, _cancel, mut rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Chat)
            .with_tokens(&["one", "two", "three"])
            .with_failure_after(2, "out of memory");
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();
        while rx.try_recv().is_ok() {}

        let result = backend
            .infer(
                InferenceRequest::Chat {
                    messages: vec![ChatMessage::user("count")],
                },
                &mut tokens,
            )
            .await;
        assert!(matches!(result, Err(ModelhostError::Inference { message }) if message == "out of memory"));
        assert_eq!(tokens.token_count(), 2);
    }

    #[tokio::test]
    async fn test_infer_before_load_fails() {
        let (_progress, mut tokens, _cancel, _rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Transcription);
        let result = backend
            .infer(InferenceRequest::Transcribe { audio: vec![0.0] }, &mut tokens)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_mismatched_request_is_rejected() {
        let (mut progress, mut tokens, _cancel, _rx) = sinks();
        let mut backend = ScriptedBackend::new(Task::Transcription);
        backend
            .load(&LoadOptions::default(), &mut progress)
            .await
            .unwrap();
        let result = backend
            .infer(
                InferenceRequest::Chat {
                    messages: vec![ChatMessage::user("hi")],
                },
                &mut tokens,
            )
            .await;
        assert!(matches!(result, Err(ModelhostError::Inference { .. })));
    }

    #[test]
    fn test_call_log_records_calls_and_drops() {
        let log = CallLog::new();
        let mut backend = ScriptedBackend::new(Task::Chat).with_call_log(log.clone());
        backend.reset();
        assert_eq!(log.calls(), vec!["reset"]);
        drop(backend);
        assert_eq!(log.drops(), 1);
    }

    #[test]
    fn test_fatal_errors_flag() {
        assert!(ScriptedBackend::new(Task::Chat).survives_inference_error());
        assert!(
            !ScriptedBackend::new(Task::Chat)
                .with_fatal_errors()
                .survives_inference_error()
        );
    }
}
