//! Composition root.
//!
//! The workbench owns one lifecycle controller per registered task, the
//! auto-load preferences, the chat history and the synthesized-audio store.
//! It is what a UI collaborator drives:
//! toggle → submit → observe → interrupt/reset → shutdown

use crate::audio::{PcmBuffer, to_model_input};
use crate::chat::ChatSession;
use crate::config::Config;
use crate::controller::{LifecycleController, LifecycleObserver, LogObserver};
use crate::error::{ModelhostError, Result};
use crate::output::AudioStore;
use crate::preferences::Preferences;
use crate::registry::TaskRegistry;
use crate::task::{InferenceRequest, Task, TaskResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Workbench {
    controllers: BTreeMap<Task, LifecycleController>,
    preferences: Preferences,
    chat: ChatSession,
    audio: AudioStore,
    default_voice: String,
}

impl std::fmt::Debug for Workbench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workbench")
            .field("controllers", &self.controllers)
            .field("preferences", &self.preferences)
            .field("chat_turns", &self.chat.turns())
            .finish()
    }
}

fn controller_in(
    controllers: &mut BTreeMap<Task, LifecycleController>,
    task: Task,
) -> Result<&mut LifecycleController> {
    controllers
        .get_mut(&task)
        .ok_or_else(|| ModelhostError::validation(format!("no backend registered for {task}")))
}

impl Workbench {
    /// Build a workbench reporting through [`LogObserver`].
    pub fn new(registry: &TaskRegistry, config: &Config, preferences: Preferences) -> Self {
        Self::with_observer(registry, config, preferences, Arc::new(LogObserver))
    }

    pub fn with_observer(
        registry: &TaskRegistry,
        config: &Config,
        preferences: Preferences,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Self {
        let controllers = registry
            .tasks()
            .into_iter()
            .filter_map(|task| {
                let controller = registry
                    .controller(task)?
                    .with_load_options(config.load_options(task))
                    .with_observer(Arc::clone(&observer))
                    .with_join_timeout(config.worker.join_timeout());
                Some((task, controller))
            })
            .collect();

        let chat = match &config.chat.system_prompt {
            Some(prompt) => ChatSession::new().with_system_prompt(prompt.as_str()),
            None => ChatSession::new(),
        };
        let audio = match &config.worker.output_dir {
            Some(dir) => AudioStore::new(dir),
            None => AudioStore::in_temp_dir(),
        };

        Self {
            controllers,
            preferences,
            chat,
            audio,
            default_voice: config.tts.voice.clone(),
        }
    }

    /// Start loading every task whose preference says so.
    ///
    /// Returns the tasks whose load was dispatched.
    pub fn autoload(&mut self) -> Result<Vec<Task>> {
        let mut started = Vec::new();
        for task in self.preferences.autoload_tasks() {
            let Some(controller) = self.controllers.get_mut(&task) else {
                warn!(%task, "auto-load requested for a task without a backend");
                continue;
            };
            if controller.state().is_ready() || controller.state().is_loading() {
                continue;
            }
            controller.toggle_model()?;
            started.push(task);
        }
        if !started.is_empty() {
            info!(tasks = ?started, "auto-loading models");
        }
        Ok(started)
    }

    pub fn controller(&self, task: Task) -> Result<&LifecycleController> {
        self.controllers
            .get(&task)
            .ok_or_else(|| ModelhostError::validation(format!("no backend registered for {task}")))
    }

    pub fn controller_mut(&mut self, task: Task) -> Result<&mut LifecycleController> {
        controller_in(&mut self.controllers, task)
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn chat_session(&self) -> &ChatSession {
        &self.chat
    }

    /// Path of the latest synthesized audio, if any.
    pub fn speech_output(&self) -> Option<PathBuf> {
        self.audio.current().map(PathBuf::from)
    }

    /// Preprocess `audio` to 16 kHz mono and transcribe it.
    pub async fn transcribe(&mut self, audio: &PcmBuffer) -> Result<String> {
        let samples = to_model_input(audio)?;
        let controller = controller_in(&mut self.controllers, Task::Transcription)?;
        let result = controller
            .run(InferenceRequest::Transcribe { audio: samples })
            .await?;
        expect_text(result)
    }

    /// Synthesize `text` and store it as the current speech artifact.
    ///
    /// Uses the configured voice when `voice` is `None`.
    pub async fn speak(&mut self, text: &str, voice: Option<&str>) -> Result<PathBuf> {
        let voice = voice.unwrap_or(&self.default_voice).to_string();
        let controller = controller_in(&mut self.controllers, Task::SpeechSynthesis)?;
        let result = controller
            .run(InferenceRequest::Synthesize {
                text: text.to_string(),
                voice,
            })
            .await?;

        match result {
            TaskResult::Audio(wav) => self.audio.store(&wav),
            other => Err(ModelhostError::ProtocolViolation {
                message: format!("speech synthesis returned {other:?}"),
            }),
        }
    }

    /// Send one chat turn with the full history and record the reply.
    pub async fn chat(&mut self, input: &str) -> Result<String> {
        self.chat_until(input, std::future::pending()).await
    }

    /// Like [`chat`](Self::chat), but interrupts generation once `stop`
    /// resolves. The partial reply is recorded and returned.
    pub async fn chat_until<F>(&mut self, input: &str, stop: F) -> Result<String>
    where
        F: Future<Output = ()>,
    {
        let controller = controller_in(&mut self.controllers, Task::Chat)?;
        let request = self.chat.user_turn(input)?;

        match controller.run_until(request, stop).await.and_then(expect_text) {
            Ok(reply) => {
                self.chat.record_reply(reply.clone());
                Ok(reply)
            }
            Err(e) => {
                self.chat.abandon_turn();
                Err(e)
            }
        }
    }

    /// Ask the running request of `task` to stop. Returns `false` when
    /// nothing runs.
    pub fn interrupt(&self, task: Task) -> bool {
        self.controllers
            .get(&task)
            .is_some_and(LifecycleController::interrupt)
    }

    /// Start a new chat: clear the history and the worker's cached state.
    pub fn new_chat(&mut self) -> Result<()> {
        self.chat.clear();
        controller_in(&mut self.controllers, Task::Chat)?.reset()
    }

    /// Terminate every worker context and release the speech artifact.
    pub async fn shutdown(&mut self) {
        for controller in self.controllers.values_mut() {
            controller.shutdown().await;
        }
        self.audio.release();
    }
}

fn expect_text(result: TaskResult) -> Result<String> {
    match result {
        TaskResult::Transcript(text) | TaskResult::Reply(text) => Ok(text),
        TaskResult::Audio(_) => Err(ModelhostError::ProtocolViolation {
            message: "expected text, got audio".to_string(),
        }),
    }
}
