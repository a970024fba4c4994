//! Whisper-based speech-to-text backend.
//!
//! Requires the `whisper` feature (and cmake to build whisper.cpp).

use super::{ModelBackend, ProgressSink, TokenSink};
use crate::defaults;
use crate::error::{ModelhostError, Result};
use crate::models;
use crate::protocol::LoadOptions;
use crate::task::{InferenceRequest, Task, TaskResult};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use tracing::{debug, info};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Share of the load progress bar taken by the model download.
const DOWNLOAD_SHARE: f32 = 0.8;

/// Configuration for the Whisper backend.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Catalog name, URL or file path of the ggml model
    pub model: String,
    /// Language code (e.g., "en", "es"), or "auto"
    pub language: String,
    /// Number of threads for inference (None = whisper.cpp default)
    pub threads: Option<usize>,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_ASR_MODEL.to_string(),
            language: defaults::DEFAULT_LANGUAGE.to_string(),
            threads: None,
        }
    }
}

/// Transcription backend running whisper.cpp on a blocking thread.
pub struct WhisperBackend {
    config: WhisperConfig,
    context: Option<Arc<Mutex<WhisperContext>>>,
}

impl std::fmt::Debug for WhisperBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperBackend")
            .field("config", &self.config)
            .field("loaded", &self.context.is_some())
            .finish()
    }
}

impl WhisperBackend {
    pub fn new(config: WhisperConfig) -> Self {
        Self {
            config,
            context: None,
        }
    }

    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }

    fn open_context(path: &Path) -> Result<WhisperContext> {
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        let mut context_params = WhisperContextParameters::default();
        context_params.flash_attn(true);
        WhisperContext::new_with_params(
            path.to_str()
                .ok_or_else(|| ModelhostError::load("Invalid UTF-8 in model path"))?,
            context_params,
        )
        .map_err(|e| ModelhostError::load(format!("Failed to load Whisper model: {}", e)))
    }

    async fn transcribe(
        context: Arc<Mutex<WhisperContext>>,
        audio: Vec<f32>,
        language: String,
        threads: Option<usize>,
    ) -> Result<String> {
        tokio::task::spawn_blocking(move || run_full(&context, &audio, &language, threads))
            .await
            .map_err(|e| ModelhostError::inference(format!("Whisper task failed: {}", e)))?
    }
}

fn run_full(
    context: &Mutex<WhisperContext>,
    audio: &[f32],
    language: &str,
    threads: Option<usize>,
) -> Result<String> {
    let context = context
        .lock()
        .map_err(|e| ModelhostError::inference(format!("Failed to acquire context lock: {}", e)))?;

    let mut state = context
        .create_state()
        .map_err(|e| ModelhostError::inference(format!("Failed to create Whisper state: {}", e)))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    if language == defaults::AUTO_LANGUAGE {
        params.set_language(None);
    } else {
        params.set_language(Some(language));
    }
    if let Some(threads) = threads {
        params.set_n_threads(threads as i32);
    }
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    state
        .full(params, audio)
        .map_err(|e| ModelhostError::inference(format!("Whisper inference failed: {}", e)))?;

    let mut transcription = String::new();
    for segment in state.as_iter() {
        transcription.push_str(&segment.to_string());
    }
    Ok(transcription.trim().to_string())
}

#[async_trait]
impl ModelBackend for WhisperBackend {
    fn task(&self) -> Task {
        Task::Transcription
    }

    fn name(&self) -> &str {
        &self.config.model
    }

    async fn load(&mut self, options: &LoadOptions, progress: &mut ProgressSink) -> Result<()> {
        let spec = options
            .model_url
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        if let Some(language) = options.param_str("language") {
            self.config.language = language.to_string();
        }

        let path = models::acquire(&spec, &mut |fraction| {
            progress.report(fraction * DOWNLOAD_SHARE)
        })
        .await?;

        progress.phase_at("Loading weights", DOWNLOAD_SHARE);
        let context = tokio::task::spawn_blocking(move || Self::open_context(&path))
            .await
            .map_err(|e| ModelhostError::load(format!("Whisper loader failed: {}", e)))??;
        let context = Arc::new(Mutex::new(context));

        progress.phase_at("Warming up model...", defaults::WARMUP_PROGRESS);
        let silence = vec![0.0f32; defaults::WARMUP_SAMPLES];
        Self::transcribe(
            Arc::clone(&context),
            silence,
            self.config.language.clone(),
            self.config.threads,
        )
        .await
        .map_err(|e| ModelhostError::load(format!("Warm-up failed: {}", e)))?;

        info!(model = %spec, "whisper model loaded");
        self.context = Some(context);
        Ok(())
    }

    async fn infer(
        &mut self,
        request: InferenceRequest,
        _tokens: &mut TokenSink,
    ) -> Result<TaskResult> {
        let InferenceRequest::Transcribe { audio } = request else {
            return Err(ModelhostError::inference(
                "Whisper backend only handles transcription",
            ));
        };
        let context = self
            .context
            .clone()
            .ok_or_else(|| ModelhostError::inference("model not loaded"))?;

        debug!(samples = audio.len(), "transcribing");
        let text = Self::transcribe(
            context,
            audio,
            self.config.language.clone(),
            self.config.threads,
        )
        .await?;
        Ok(TaskResult::Transcript(text))
    }

    async fn unload(&mut self) {
        self.context = None;
    }
}
