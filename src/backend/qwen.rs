//! Qwen2.5 chat backend running a quantized GGUF model through candle.
//!
//! Weights and tokenizer come from the HuggingFace hub on first use. A
//! local `.gguf` file works too, with `tokenizer.json` read from the same
//! directory when present.

use super::{ModelBackend, ProgressSink, TokenSink};
use crate::defaults;
use crate::error::{ModelhostError, Result};
use crate::protocol::LoadOptions;
use crate::task::{ChatMessage, InferenceRequest, Role, Task, TaskResult};
use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{D, Device, Tensor};
use candle_transformers::models::quantized_qwen2::ModelWeights;
use hf_hub::api::sync::ApiBuilder;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

const GGUF_REPO: &str = "Qwen/Qwen2.5-0.5B-Instruct-GGUF";
const GGUF_FILENAME: &str = "qwen2.5-0.5b-instruct-q4_k_m.gguf";
const TOKENIZER_REPO: &str = "Qwen/Qwen2.5-0.5B-Instruct";
const TOKENIZER_FILENAME: &str = "tokenizer.json";

/// System turn used when the history carries none.
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Qwen, created by Alibaba Cloud. You are a helpful assistant.";

const END_OF_TURN: &str = "<|im_end|>";
const END_OF_TEXT: &str = "<|endoftext|>";

/// Configuration for the Qwen backend.
#[derive(Debug, Clone)]
pub struct QwenConfig {
    /// Model name (any Qwen2.5-0.5B identifier) or path to a `.gguf` file
    pub model: String,
    /// Upper bound on generated tokens per turn
    pub max_new_tokens: usize,
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            model: defaults::DEFAULT_CHAT_MODEL.to_string(),
            max_new_tokens: defaults::MAX_NEW_TOKENS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WeightsSource {
    Local(PathBuf),
    Hub,
}

fn weights_source(spec: &str) -> Result<WeightsSource> {
    if spec.ends_with(".gguf") {
        return Ok(WeightsSource::Local(PathBuf::from(spec)));
    }
    if spec.to_ascii_lowercase().contains("qwen2.5-0.5b") {
        return Ok(WeightsSource::Hub);
    }
    Err(ModelhostError::load(format!(
        "Unsupported chat model '{spec}': expected a Qwen2.5-0.5B model or a .gguf file"
    )))
}

/// Resolve weight and tokenizer paths, downloading into the hub cache.
fn fetch(source: &WeightsSource) -> Result<(PathBuf, PathBuf)> {
    if let WeightsSource::Local(path) = source
        && !path.exists()
    {
        return Err(ModelhostError::ModelNotFound {
            path: path.display().to_string(),
        });
    }

    let api = ApiBuilder::new()
        .with_progress(false)
        .build()
        .map_err(|e| ModelhostError::load(format!("HF Hub API init: {e}")))?;

    let weights = match source {
        WeightsSource::Local(path) => path.clone(),
        WeightsSource::Hub => api
            .model(GGUF_REPO.to_string())
            .get(GGUF_FILENAME)
            .map_err(|e| ModelhostError::load(format!("Download model {GGUF_FILENAME}: {e}")))?,
    };

    let sibling = weights.with_file_name(TOKENIZER_FILENAME);
    let tokenizer = if matches!(source, WeightsSource::Local(_)) && sibling.exists() {
        sibling
    } else {
        api.model(TOKENIZER_REPO.to_string())
            .get(TOKENIZER_FILENAME)
            .map_err(|e| ModelhostError::load(format!("Download tokenizer: {e}")))?
    };
    Ok((weights, tokenizer))
}

/// Render a chat history in the ChatML template, ending with an open
/// assistant turn.
pub fn chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    if messages.first().is_none_or(|m| m.role != Role::System) {
        push_turn(&mut prompt, "system", DEFAULT_SYSTEM_PROMPT);
    }
    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        push_turn(&mut prompt, role, &message.content);
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn push_turn(prompt: &mut String, role: &str, content: &str) {
    prompt.push_str("<|im_start|>");
    prompt.push_str(role);
    prompt.push('\n');
    prompt.push_str(content);
    prompt.push_str(END_OF_TURN);
    prompt.push('\n');
}

/// A loaded model with its tokenizer.
#[derive(Clone)]
struct Loaded {
    model: Arc<Mutex<ModelWeights>>,
    tokenizer: Arc<Tokenizer>,
    device: Device,
    eos: Vec<u32>,
}

impl Loaded {
    fn open(weights: &Path, tokenizer: &Path, device: Device) -> Result<Self> {
        let mut file = std::fs::File::open(weights)
            .map_err(|e| ModelhostError::load(format!("Open {}: {e}", weights.display())))?;
        let content = gguf_file::Content::read(&mut file).map_err(|e| {
            ModelhostError::load(format!("Read GGUF model {}: {e}", weights.display()))
        })?;
        let model = ModelWeights::from_gguf(content, &mut file, &device)
            .map_err(|e| ModelhostError::load(format!("Init Qwen2 model: {e}")))?;

        let tokenizer = Tokenizer::from_file(tokenizer).map_err(|e| {
            ModelhostError::load(format!("Load tokenizer {}: {e}", tokenizer.display()))
        })?;
        let eos: Vec<u32> = [END_OF_TURN, END_OF_TEXT]
            .into_iter()
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        if eos.is_empty() {
            return Err(ModelhostError::load("Tokenizer has no end-of-turn token"));
        }

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            device,
            eos,
        })
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| ModelhostError::inference(format!("Tokenize: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| ModelhostError::inference(format!("Detokenize: {e}")))
    }

    /// Run `tokens` through the model at `index_pos` and pick the next token.
    async fn step(&self, tokens: Vec<u32>, index_pos: usize) -> Result<u32> {
        let model = Arc::clone(&self.model);
        let device = self.device.clone();
        tokio::task::spawn_blocking(move || next_token(&model, &device, &tokens, index_pos))
            .await
            .map_err(|e| ModelhostError::inference(format!("Decoder task failed: {e}")))?
    }
}

/// Greedy decoding step.
///
/// Position 0 replaces whatever the model has cached.
fn next_token(
    model: &Mutex<ModelWeights>,
    device: &Device,
    tokens: &[u32],
    index_pos: usize,
) -> Result<u32> {
    let mut model = model
        .lock()
        .map_err(|e| ModelhostError::inference(format!("Failed to acquire model lock: {e}")))?;

    let input = Tensor::new(tokens, device)
        .and_then(|t| t.unsqueeze(0))
        .map_err(|e| ModelhostError::inference(format!("Create input tensor: {e}")))?;
    let logits = model
        .forward(&input, index_pos)
        .map_err(|e| ModelhostError::inference(format!("Decoder forward: {e}")))?;
    logits
        .flatten_all()
        .and_then(|l| l.argmax(D::Minus1))
        .and_then(|t| t.to_scalar::<u32>())
        .map_err(|e| ModelhostError::inference(format!("Argmax: {e}")))
}

/// Chat backend generating greedily with a quantized Qwen2.5 model.
///
/// The attention cache is kept between turns: when the new prompt extends
/// the tokens already fed, only the suffix is run. `reset` forgets the fed
/// tokens so the next turn starts from position 0.
pub struct QwenBackend {
    config: QwenConfig,
    loaded: Option<Loaded>,
    /// Tokens whose keys and values are in the model's cache.
    fed: Vec<u32>,
}

impl std::fmt::Debug for QwenBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QwenBackend")
            .field("config", &self.config)
            .field("loaded", &self.loaded.is_some())
            .field("cached_tokens", &self.fed.len())
            .finish()
    }
}

impl QwenBackend {
    pub fn new(config: QwenConfig) -> Self {
        Self {
            config,
            loaded: None,
            fed: Vec::new(),
        }
    }

    pub fn config(&self) -> &QwenConfig {
        &self.config
    }

    /// Feed `tokens` after the cached ones and return the predicted next token.
    async fn feed(&mut self, loaded: &Loaded, tokens: &[u32]) -> Result<u32> {
        if self.fed.is_empty() {
            let next = loaded.step(tokens.to_vec(), 0).await?;
            self.fed.extend_from_slice(tokens);
            return Ok(next);
        }

        // Multi-token input is only masked correctly at position 0.
        let mut next = None;
        for &token in tokens {
            next = Some(loaded.step(vec![token], self.fed.len()).await?);
            self.fed.push(token);
        }
        next.ok_or_else(|| ModelhostError::inference("Nothing to feed"))
    }

    async fn generate(&mut self, prompt: Vec<u32>, sink: &mut TokenSink) -> Result<String> {
        let loaded = self
            .loaded
            .clone()
            .ok_or_else(|| ModelhostError::inference("model not loaded"))?;

        let start = if self.fed.len() < prompt.len() && prompt.starts_with(&self.fed) {
            self.fed.len()
        } else {
            self.fed.clear();
            0
        };
        debug!(cached = start, prompt = prompt.len(), "prefill");
        let mut next = self.feed(&loaded, &prompt[start..]).await?;

        let mut generated = Vec::new();
        let mut reply = String::new();
        for _ in 0..self.config.max_new_tokens {
            if loaded.eos.contains(&next) {
                break;
            }
            generated.push(next);

            let decoded = loaded.decode(&generated)?;
            if let Some(fresh) = decoded.get(reply.len()..)
                && !fresh.is_empty()
                && !fresh.ends_with('\u{fffd}')
            {
                if !sink.push(fresh) {
                    debug!(tokens = generated.len(), "generation interrupted");
                    break;
                }
                reply.push_str(fresh);
            }

            next = self.feed(&loaded, &[next]).await?;
        }
        Ok(reply)
    }
}

#[async_trait]
impl ModelBackend for QwenBackend {
    fn task(&self) -> Task {
        Task::Chat
    }

    fn name(&self) -> &str {
        &self.config.model
    }

    async fn load(&mut self, options: &LoadOptions, progress: &mut ProgressSink) -> Result<()> {
        let spec = options
            .model_url
            .clone()
            .unwrap_or_else(|| self.config.model.clone());
        if let Some(limit) = options.param_u64("max_new_tokens") {
            self.config.max_new_tokens = usize::try_from(limit).unwrap_or(usize::MAX);
        }
        if let Some(device) = options.device.as_deref()
            && device != defaults::DEFAULT_DEVICE
        {
            warn!(device, "chat backend only runs on the cpu");
        }
        let source = weights_source(&spec)?;

        progress.phase_at("Fetching model files", 0.0);
        let (weights, tokenizer) = tokio::task::spawn_blocking(move || fetch(&source))
            .await
            .map_err(|e| ModelhostError::load(format!("Model fetch failed: {e}")))??;

        progress.phase_at("Loading weights", 0.5);
        let loaded =
            tokio::task::spawn_blocking(move || Loaded::open(&weights, &tokenizer, Device::Cpu))
                .await
                .map_err(|e| ModelhostError::load(format!("Qwen loader failed: {e}")))??;

        progress.phase_at("Warming up model...", defaults::WARMUP_PROGRESS);
        let warmup = loaded
            .encode("Hello")
            .map_err(|e| ModelhostError::load(format!("Warm-up failed: {e}")))?;
        if !warmup.is_empty() {
            loaded
                .step(warmup, 0)
                .await
                .map_err(|e| ModelhostError::load(format!("Warm-up failed: {e}")))?;
        }

        info!(model = %spec, "chat model loaded");
        self.fed.clear();
        self.loaded = Some(loaded);
        Ok(())
    }

    async fn infer(
        &mut self,
        request: InferenceRequest,
        tokens: &mut TokenSink,
    ) -> Result<TaskResult> {
        let InferenceRequest::Chat { messages } = request else {
            return Err(ModelhostError::inference("Qwen backend only handles chat"));
        };
        let prompt = match &self.loaded {
            Some(loaded) => loaded.encode(&chat_prompt(&messages))?,
            None => return Err(ModelhostError::inference("model not loaded")),
        };

        let result = self.generate(prompt, tokens).await;
        if result.is_err() {
            self.fed.clear();
        }
        result.map(TaskResult::Reply)
    }

    fn reset(&mut self) {
        self.fed.clear();
    }

    async fn unload(&mut self) {
        self.loaded = None;
        self.fed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CancelFlag;
    use tokio::sync::mpsc;

    #[test]
    fn qwen_backend_is_send() {
        fn assert_send<T: Send + 'static>() {}
        assert_send::<QwenBackend>();
    }

    #[test]
    fn test_prompt_adds_default_system_turn() {
        let prompt = chat_prompt(&[ChatMessage::user("Hi")]);
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are Qwen, created by Alibaba Cloud. You are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_prompt_keeps_given_system_turn_and_history() {
        let prompt = chat_prompt(&[
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello."),
            ChatMessage::user("Bye"),
        ]);
        assert!(prompt.starts_with("<|im_start|>system\nBe brief.<|im_end|>\n"));
        assert!(!prompt.contains("Alibaba"));
        assert!(prompt.contains("<|im_start|>assistant\nHello.<|im_end|>\n<|im_start|>user\nBye"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_weights_source() {
        assert_eq!(
            weights_source(defaults::DEFAULT_CHAT_MODEL).unwrap(),
            WeightsSource::Hub
        );
        assert_eq!(
            weights_source("/models/chat.gguf").unwrap(),
            WeightsSource::Local(PathBuf::from("/models/chat.gguf"))
        );
        assert!(matches!(
            weights_source("meta-llama/Llama-3.2-1B"),
            Err(ModelhostError::Load { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut progress = ProgressSink::new(tx);
        let mut backend = QwenBackend::new(QwenConfig {
            model: "/nonexistent/modelhost/chat.gguf".to_string(),
            ..Default::default()
        });

        let result = backend.load(&LoadOptions::default(), &mut progress).await;
        assert!(matches!(result, Err(ModelhostError::ModelNotFound { .. })));
    }

    #[tokio::test]
    async fn test_invalid_gguf_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("chat.gguf");
        std::fs::write(&weights, b"not a gguf file").unwrap();
        std::fs::write(dir.path().join(TOKENIZER_FILENAME), b"{}").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut progress = ProgressSink::new(tx);
        let mut backend = QwenBackend::new(QwenConfig::default());
        let options = LoadOptions {
            model_url: Some(weights.display().to_string()),
            params: Some(serde_json::json!({ "max_new_tokens": 64 })),
            ..LoadOptions::default()
        };

        let result = backend.load(&options, &mut progress).await;
        assert!(matches!(result, Err(ModelhostError::Load { .. })));
        assert_eq!(backend.config().max_new_tokens, 64);
    }

    #[tokio::test]
    async fn test_infer_before_load_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut tokens = TokenSink::new(tx, CancelFlag::new());
        let mut backend = QwenBackend::new(QwenConfig::default());
        let result = backend
            .infer(
                InferenceRequest::Chat {
                    messages: vec![ChatMessage::user("Hi")],
                },
                &mut tokens,
            )
            .await;
        assert!(matches!(result, Err(ModelhostError::Inference { .. })));
    }
}
