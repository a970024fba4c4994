//! Command-line interface for modelhost
//!
//! Argument parsing with clap derive macros, plus the terminal observer that
//! renders load progress and streamed output.

use crate::controller::LifecycleObserver;
use crate::task::{ModelLoadState, Task, TaskResult};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

/// Local speech-to-text, text-to-speech and chat with isolated model workers
#[derive(Parser, Debug)]
#[command(name = "modelhost", version, about)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the auto-load preferences file
    #[arg(long, global = true, value_name = "PATH")]
    pub preferences: Option<PathBuf>,

    /// Use scripted backends instead of real models
    #[arg(long, global = true)]
    pub mock: bool,

    /// Suppress status output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transcribe a WAV file
    Transcribe {
        /// WAV file (any sample rate, mono or stereo)
        file: PathBuf,

        /// Whisper model: catalog name, URL or file path
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Language code (default: auto-detect). Examples: auto, en, de
        #[arg(long, value_name = "LANG")]
        language: Option<String>,
    },

    /// Synthesize speech into a WAV file
    Speak {
        /// Text to speak
        text: String,

        /// Voice (af, af_bella, am_adam, bf_emma, bm_george)
        #[arg(long, value_name = "VOICE")]
        voice: Option<String>,

        /// Where to write the WAV file
        #[arg(long, short = 'o', value_name = "FILE", default_value = "speech.wav")]
        output: PathBuf,
    },

    /// Chat with the language model (interactive without a prompt)
    Chat {
        /// Single prompt to answer
        prompt: Option<String>,
    },

    /// Convert a WAV file to 16 kHz mono
    Convert {
        /// Input WAV file
        input: PathBuf,
        /// Output WAV file
        output: PathBuf,
    },

    /// Speak the JSON line worker protocol over stdin/stdout
    Serve {
        /// Task to serve (whisper, tts, llm)
        #[arg(long, value_name = "TASK")]
        task: Task,
    },

    /// Manage Whisper models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// View and modify auto-load preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Model management actions
#[derive(Subcommand, Debug)]
pub enum ModelsAction {
    /// List available models
    List,
    /// Download a model into the cache
    Install {
        /// Model name (e.g., base.en, small)
        name: String,
    },
}

/// Preference actions
#[derive(Subcommand, Debug)]
pub enum PrefsAction {
    /// Show which tasks load on startup
    Show,
    /// Set whether a task loads on startup
    Set {
        /// Task (whisper, tts, llm)
        task: Task,
        /// true or false
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration, or one dotted key (e.g. asr.model)
    Show {
        key: Option<String>,
    },
    /// Print the configuration file path
    Path,
}

/// Renders controller callbacks on the terminal.
///
/// Load progress goes to a progress bar on stderr; streamed chat tokens are
/// written to stdout as they arrive.
#[derive(Debug, Default)]
pub struct TerminalObserver {
    quiet: bool,
    bar: Mutex<Option<ProgressBar>>,
    /// Latest generation rate of the streaming request.
    rate: Mutex<Option<f64>>,
}

impl TerminalObserver {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            bar: Mutex::new(None),
            rate: Mutex::new(None),
        }
    }

    fn take_rate(&self) -> Option<f64> {
        self.rate.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn with_bar(&self, f: impl FnOnce(&mut Option<ProgressBar>)) {
        let mut bar = self.bar.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut bar);
    }

    fn new_bar(task: Task) -> ProgressBar {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::with_template("{prefix:.bold} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_prefix(task.label());
        bar
    }
}

impl LifecycleObserver for TerminalObserver {
    fn on_state_change(&self, task: Task, state: &ModelLoadState) {
        if self.quiet {
            return;
        }
        match state {
            ModelLoadState::Loading { .. } => self.with_bar(|bar| {
                if let Some(old) = bar.replace(Self::new_bar(task)) {
                    old.finish_and_clear();
                }
            }),
            ModelLoadState::Ready => self.with_bar(|bar| {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
                eprintln!("{} {}", "✓".green(), format!("{} ready", task.label()).dimmed());
            }),
            ModelLoadState::Failed { reason } => self.with_bar(|bar| {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                eprintln!("{} {}: {}", "✗".red(), task.label(), reason.red());
            }),
            ModelLoadState::Unloaded => self.with_bar(|bar| {
                if let Some(bar) = bar.take() {
                    bar.finish_and_clear();
                }
            }),
        }
    }

    fn on_progress(&self, _task: Task, fraction: f32, message: &str) {
        if self.quiet {
            return;
        }
        self.with_bar(|bar| {
            if let Some(bar) = bar.as_ref() {
                bar.set_position((fraction * 100.0).round() as u64);
                bar.set_message(message.to_string());
            }
        });
    }

    fn on_update(&self, _task: Task, output: &str, tps: Option<f64>) {
        if let Some(tps) = tps {
            *self.rate.lock().unwrap_or_else(PoisonError::into_inner) = Some(tps);
        }
        let mut stdout = std::io::stdout().lock();
        if write!(stdout, "{output}").and_then(|_| stdout.flush()).is_err() {
            tracing::debug!("stdout closed while streaming");
        }
    }

    fn on_complete(&self, task: Task, result: &TaskResult) {
        if task.is_streaming() {
            println!();
            if let Some(tps) = self.take_rate()
                && !self.quiet
            {
                eprintln!("{}", format_rate(tps).dimmed());
            }
        }
        if !self.quiet
            && let TaskResult::Audio(bytes) = result
        {
            eprintln!("{}", format!("{} bytes of audio", bytes.len()).dimmed());
        }
    }

    fn on_error(&self, task: Task, error: &str) {
        self.take_rate();
        eprintln!("{} {}: {}", "error".red().bold(), task.label(), error);
    }
}

fn format_rate(tps: f64) -> String {
    format!("{tps:.1} tokens/s")
}
