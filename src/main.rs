use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use modelhost::app::Workbench;
use modelhost::audio::{encode_wav, read_wav_file, to_model_input};
use modelhost::cli::{Cli, Commands, ConfigAction, ModelsAction, PrefsAction, TerminalObserver};
use modelhost::config::Config;
use modelhost::defaults::TARGET_SAMPLE_RATE;
use modelhost::error::ModelhostError;
use modelhost::models::{self, catalog::list_models};
use modelhost::preferences::Preferences;
use modelhost::registry::{TaskRegistry, default_registry, scripted_registry};
use modelhost::task::Task;
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    tracing::debug!(version = %modelhost::version_string(), "starting");

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let prefs_path = cli
        .preferences
        .clone()
        .unwrap_or_else(Preferences::default_path);

    match cli.command {
        Commands::Transcribe {
            file,
            model,
            language,
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(model) = model {
                config.asr.model = model;
            }
            if let Some(language) = language {
                config.asr.language = language;
            }
            let audio = read_wav_file(&file)?;
            let mut bench = workbench(&config, &prefs_path, cli.mock, cli.quiet);
            let result = bench.transcribe(&audio).await;
            bench.shutdown().await;
            println!("{}", result?);
        }
        Commands::Speak {
            text,
            voice,
            output,
        } => {
            let config = load_config(&config_path)?;
            let mut bench = workbench(&config, &prefs_path, cli.mock, cli.quiet);
            let result = bench.speak(&text, voice.as_deref()).await.and_then(|path| {
                std::fs::copy(&path, &output)?;
                Ok(())
            });
            bench.shutdown().await;
            result?;
            if !cli.quiet {
                eprintln!("{} {}", "Wrote".green(), output.display());
            }
        }
        Commands::Chat { prompt } => {
            let config = load_config(&config_path)?;
            let mut bench = workbench(&config, &prefs_path, cli.mock, cli.quiet);
            let result = match prompt {
                Some(prompt) => bench.chat(&prompt).await.map(|_| ()).map_err(Into::into),
                None => run_chat_repl(&mut bench, cli.quiet).await,
            };
            bench.shutdown().await;
            result?;
        }
        Commands::Convert { input, output } => {
            convert(&input, &output)?;
            if !cli.quiet {
                eprintln!(
                    "{} {} ({} Hz mono)",
                    "Wrote".green(),
                    output.display(),
                    TARGET_SAMPLE_RATE
                );
            }
        }
        Commands::Serve { task } => {
            let config = load_config(&config_path)?;
            let registry = registry(&config, cli.mock);
            let factory = registry
                .get(task)
                .with_context(|| format!("no backend registered for {task}"))?;
            modelhost::serve::serve(
                task,
                factory(),
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                config.worker.join_timeout(),
            )
            .await?;
        }
        Commands::Models { action } => handle_models_command(action, cli.quiet).await?,
        Commands::Prefs { action } => handle_prefs_command(action, &prefs_path)?,
        Commands::Config { action } => handle_config_command(action, &config_path)?,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "modelhost", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Install the tracing subscriber on stderr.
///
/// `MODELHOST_LOG` wins over `RUST_LOG`; otherwise the level follows
/// `-q`/`-v`.
fn init_logging(quiet: bool, verbose: u8) {
    let default = match (quiet, verbose) {
        (true, _) => "modelhost=warn",
        (false, 0) => "modelhost=info",
        (false, 1) => "modelhost=debug",
        (false, _) => "modelhost=trace",
    };
    let filter = EnvFilter::try_from_env("MODELHOST_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load configuration from file or use defaults, then apply environment
/// variable overrides.
fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    Ok(config.with_env_overrides())
}

fn registry(config: &Config, mock: bool) -> TaskRegistry {
    if mock {
        scripted_registry()
    } else {
        default_registry(config)
    }
}

fn workbench(config: &Config, prefs_path: &Path, mock: bool, quiet: bool) -> Workbench {
    Workbench::with_observer(
        &registry(config, mock),
        config,
        Preferences::load(prefs_path),
        Arc::new(TerminalObserver::new(quiet)),
    )
}

/// Interactive chat: one turn per line, `/new` starts over, `/quit` exits.
async fn run_chat_repl(bench: &mut Workbench, quiet: bool) -> Result<()> {
    let started = bench.autoload()?;
    if !quiet {
        if !started.is_empty() {
            eprintln!("{}", "Auto-loading models from preferences".dimmed());
        }
        eprintln!("{}", "Type a message, /new for a new chat, /quit to exit. Ctrl-C stops a reply.".dimmed());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => {
                bench.new_chat()?;
                if !quiet {
                    eprintln!("{}", "New chat".dimmed());
                }
            }
            input => {
                // Worker errors are reported by the observer; keep the session going.
                let stop = async {
                    if tokio::signal::ctrl_c().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                };
                match bench.chat_until(input, stop).await {
                    Ok(_) => {}
                    Err(e @ (ModelhostError::Validation { .. } | ModelhostError::Busy { .. })) => {
                        eprintln!("{} {e}", "error".red().bold());
                    }
                    Err(e) => tracing::debug!(error = %e, "chat turn failed"),
                }
            }
        }
    }
    Ok(())
}

/// Run the preprocessor over a WAV file.
fn convert(input: &Path, output: &Path) -> Result<()> {
    let audio = read_wav_file(input)?;
    let samples = to_model_input(&audio)?;
    let wav = encode_wav(&samples, TARGET_SAMPLE_RATE)?;
    std::fs::write(output, wav).with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

/// Handle model management commands.
async fn handle_models_command(action: ModelsAction, quiet: bool) -> Result<()> {
    match action {
        ModelsAction::List => {
            println!("Available models:");
            for model in list_models() {
                let installed = models::resolve(model.name).path().exists();
                let marker = if installed {
                    "installed".green().to_string()
                } else {
                    String::new()
                };
                println!("  {:<10} {:>5} MB  {}", model.name, model.size_mb, marker);
            }
        }
        ModelsAction::Install { name } => {
            let bar = if quiet {
                indicatif::ProgressBar::hidden()
            } else {
                indicatif::ProgressBar::new(100)
            };
            let path = models::acquire(&name, &mut |fraction: f32| {
                bar.set_position((fraction * 100.0).round() as u64);
            })
            .await;
            bar.finish_and_clear();
            let path: PathBuf = path?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn handle_prefs_command(action: PrefsAction, path: &Path) -> Result<()> {
    let mut prefs = Preferences::load(path);
    match action {
        PrefsAction::Show => {
            for task in Task::ALL {
                let state = if prefs.autoload(task) {
                    "auto-load".green().to_string()
                } else {
                    "manual".dimmed().to_string()
                };
                println!("  {:<8} {:<16} {}", task.id(), task.label(), state);
            }
        }
        PrefsAction::Set { task, enabled } => {
            prefs.set_autoload(task, enabled);
            prefs
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Set {} = {}", task.id(), enabled);
        }
    }
    Ok(())
}

fn handle_config_command(action: ConfigAction, path: &Path) -> Result<()> {
    match action {
        ConfigAction::Show { key } => {
            let config = load_config(path)?;
            match key {
                Some(key) => println!("{}", config.get_value_by_path(&key)?),
                None => print!("{}", config.to_toml()?),
            }
        }
        ConfigAction::Path => println!("{}", path.display()),
    }
    Ok(())
}
