#![cfg(feature = "whisper")]

use modelhost::ModelBackend;
use modelhost::backend::whisper::{WhisperBackend, WhisperConfig};
use modelhost::controller::{BackendFactory, LifecycleController};
use modelhost::defaults;
use modelhost::models::{self, catalog::list_models};
use modelhost::task::{InferenceRequest, ModelLoadState, Task, TaskResult};
use std::sync::Arc;
use std::time::Duration;

/// Smallest catalog model already in the cache, so tests never download.
fn find_installed_model() -> Option<&'static str> {
    let found = list_models()
        .iter()
        .find(|m| models::resolve(m.name).path().exists())
        .map(|m| m.name);
    if found.is_none() {
        eprintln!("\n╔══════════════════════════════════════════════════════════════╗");
        eprintln!("║  NO WHISPER MODEL FOUND, SKIPPING BACKEND TESTS              ║");
        eprintln!("║                                                              ║");
        eprintln!("║  Install a model with:                                       ║");
        eprintln!("║    cargo run -- models install tiny.en                       ║");
        eprintln!("╚══════════════════════════════════════════════════════════════╝\n");
    }
    found
}

fn language_for_model(name: &str) -> &'static str {
    if name.ends_with(".en") { "en" } else { "auto" }
}

fn whisper_factory(config: WhisperConfig) -> BackendFactory {
    Arc::new(move || Box::new(WhisperBackend::new(config.clone())) as Box<dyn ModelBackend>)
}

#[tokio::test]
async fn test_whisper_loads_and_transcribes_silence() {
    let Some(name) = find_installed_model() else {
        return;
    };
    eprintln!("Backend: {}, Model: {}", defaults::gpu_backend(), name);

    let mut controller = LifecycleController::new(
        Task::Transcription,
        whisper_factory(WhisperConfig {
            model: name.to_string(),
            language: language_for_model(name).to_string(),
            threads: Some(4),
        }),
    );

    let result = tokio::time::timeout(
        Duration::from_secs(120),
        controller.run(InferenceRequest::Transcribe {
            audio: vec![0.0; defaults::TARGET_SAMPLE_RATE as usize * 2],
        }),
    )
    .await
    .expect("transcription timed out");

    match result {
        Ok(TaskResult::Transcript(text)) => eprintln!("Transcription of silence: {text:?}"),
        other => panic!("expected transcript, got {other:?}"),
    }
    assert_eq!(controller.state(), ModelLoadState::Ready);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_missing_model_file_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("ggml-missing.bin");
    let mut controller = LifecycleController::new(
        Task::Transcription,
        whisper_factory(WhisperConfig {
            model: missing.display().to_string(),
            ..WhisperConfig::default()
        }),
    );

    let result = controller
        .run(InferenceRequest::Transcribe { audio: vec![0.0; 160] })
        .await;

    assert!(matches!(
        result,
        Err(modelhost::ModelhostError::Load { .. })
    ));
    assert_eq!(controller.state(), ModelLoadState::Unloaded);
}
