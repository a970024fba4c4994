//! Default configuration constants for modelhost.
//!
//! Shared constants used across configuration types, backends and the CLI.

/// Sample rate every speech model in this crate consumes, in Hz.
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Default whisper.cpp model name for transcription.
pub const DEFAULT_ASR_MODEL: &str = "base";

/// Default language code for transcription.
///
/// "auto" lets Whisper detect the spoken language.
pub const DEFAULT_LANGUAGE: &str = "auto";

/// Language value that triggers automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Default inference device requested on `load`.
pub const DEFAULT_DEVICE: &str = "cpu";

/// Default speech-synthesis model identifier.
pub const DEFAULT_TTS_MODEL: &str = "onnx-community/Kokoro-82M-ONNX";

/// Default chat model identifier.
pub const DEFAULT_CHAT_MODEL: &str = "Mozilla/Qwen2.5-0.5B-Instruct";

/// Default synthesis voice.
pub const DEFAULT_VOICE: &str = "af";

/// Voices the speech-synthesis task accepts.
pub const VOICES: &[(&str, &str)] = &[
    ("af", "Default (American Female)"),
    ("af_bella", "Bella (American Female)"),
    ("am_adam", "Adam (American Male)"),
    ("bf_emma", "Emma (British Female)"),
    ("bm_george", "George (British Male)"),
];

/// Upper bound on tokens produced by a single chat turn.
pub const MAX_NEW_TOKENS: usize = 2048;

/// Progress fraction reported when warm-up starts.
pub const WARMUP_PROGRESS: f32 = 0.9;

/// Length of the silent clip used to warm up speech models, in samples.
pub const WARMUP_SAMPLES: usize = TARGET_SAMPLE_RATE as usize;

/// Capacity of each controller's status event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// How long `terminate` waits for a worker thread before detaching it, in milliseconds.
pub const WORKER_JOIN_TIMEOUT_MS: u64 = 1000;

/// Returns true if `voice` is one of the known synthesis voices.
pub fn is_known_voice(voice: &str) -> bool {
    VOICES.iter().any(|(id, _)| *id == voice)
}

/// Report the GPU backend compiled into this build.
pub fn gpu_backend() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else {
        "CPU"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_voice_is_known() {
        assert!(is_known_voice(DEFAULT_VOICE));
        assert!(!is_known_voice("zz_nobody"));
    }

    #[test]
    fn warmup_clip_is_one_second() {
        assert_eq!(WARMUP_SAMPLES, 16000);
    }

    #[test]
    fn gpu_backend_matches_compiled_feature() {
        let expected = if cfg!(feature = "cuda") {
            "CUDA"
        } else if cfg!(feature = "vulkan") {
            "Vulkan"
        } else {
            "CPU"
        };
        assert_eq!(gpu_backend(), expected);
    }
}
