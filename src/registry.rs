//! Explicit task → backend factory map, built once at startup.

use crate::backend::{ModelBackend, ScriptedBackend, UnavailableBackend};
use crate::config::Config;
use crate::controller::{BackendFactory, LifecycleController};
use crate::task::Task;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<Task, BackendFactory>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.tasks())
            .finish()
    }
}

/// Wrap a cloneable backend as a factory producing fresh copies.
pub fn factory_from<B>(template: B) -> BackendFactory
where
    B: ModelBackend + Clone + Send + Sync + 'static,
{
    Arc::new(move || Box::new(template.clone()) as Box<dyn ModelBackend>)
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `task`.
    pub fn register(&mut self, task: Task, factory: BackendFactory) {
        self.factories.insert(task, factory);
    }

    pub fn with(mut self, task: Task, factory: BackendFactory) -> Self {
        self.register(task, factory);
        self
    }

    pub fn get(&self, task: Task) -> Option<&BackendFactory> {
        self.factories.get(&task)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.factories.keys().copied().collect()
    }

    /// Build a controller for `task`, or `None` if nothing is registered.
    pub fn controller(&self, task: Task) -> Option<LifecycleController> {
        self.get(task)
            .map(|factory| LifecycleController::new(task, Arc::clone(factory)))
    }
}

/// Registry with the native backends compiled into this build.
///
/// Tasks without a native backend get a stand-in whose load fails with an
/// explanatory message.
pub fn default_registry(config: &Config) -> TaskRegistry {
    TaskRegistry::new()
        .with(Task::Transcription, transcription_factory(config))
        .with(
            Task::SpeechSynthesis,
            factory_from(UnavailableBackend::new(
                Task::SpeechSynthesis,
                format!(
                    "no speech synthesis runtime for '{}' in this build",
                    config.tts.model
                ),
            )),
        )
        .with(Task::Chat, chat_factory(config))
}

#[cfg(feature = "whisper")]
fn transcription_factory(config: &Config) -> BackendFactory {
    use crate::backend::whisper::{WhisperBackend, WhisperConfig};

    let whisper = WhisperConfig {
        model: config.asr.model.clone(),
        language: config.asr.language.clone(),
        threads: config.asr.threads,
    };
    Arc::new(move || Box::new(WhisperBackend::new(whisper.clone())) as Box<dyn ModelBackend>)
}

#[cfg(not(feature = "whisper"))]
fn transcription_factory(_config: &Config) -> BackendFactory {
    factory_from(UnavailableBackend::new(
        Task::Transcription,
        "built without the `whisper` feature",
    ))
}

#[cfg(feature = "llm")]
fn chat_factory(config: &Config) -> BackendFactory {
    use crate::backend::qwen::{QwenBackend, QwenConfig};

    let qwen = QwenConfig {
        model: config.chat.model.clone(),
        max_new_tokens: config.chat.max_new_tokens,
    };
    Arc::new(move || Box::new(QwenBackend::new(qwen.clone())) as Box<dyn ModelBackend>)
}

#[cfg(not(feature = "llm"))]
fn chat_factory(config: &Config) -> BackendFactory {
    factory_from(UnavailableBackend::new(
        Task::Chat,
        format!("no chat runtime for '{}' in this build", config.chat.model),
    ))
}

/// Registry of scripted backends for every task.
pub fn scripted_registry() -> TaskRegistry {
    Task::ALL.into_iter().fold(TaskRegistry::new(), |registry, task| {
        registry.with(task, factory_from(ScriptedBackend::new(task)))
    })
}
