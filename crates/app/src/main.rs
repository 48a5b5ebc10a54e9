//! fluxdeck command-line entry point.
//!
//! Thin shell over the session, history, and settings crates: parses a
//! subcommand, wires up the backend clients from the environment, and
//! prints lifecycle events as they arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fluxdeck_comfyui::{ComfyUIApi, ComfyUIClient};
use fluxdeck_core::config::BackendConfig;
use fluxdeck_core::types::{
    GenerationParams, LoraSetting, WorkflowMode, DEFAULT_CREATE_GUIDANCE, DEFAULT_EDIT_GUIDANCE,
    DEFAULT_HEIGHT, DEFAULT_STEPS, DEFAULT_WIDTH,
};
use fluxdeck_history::local::{HistoryFile, SettingsFile};
use fluxdeck_history::{HistoryStore, LoraRegistry};
use fluxdeck_session::{Orchestrator, SessionConfig, SessionEvent, SourceImage};

#[derive(Parser)]
#[command(name = "fluxdeck", about = "Control panel for a ComfyUI image generation backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an image from a text prompt.
    Generate {
        prompt: String,
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: u32,
        /// Sampler seed; random when omitted.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_CREATE_GUIDANCE)]
        guidance: f64,
        #[arg(long, default_value_t = DEFAULT_WIDTH)]
        width: u32,
        #[arg(long, default_value_t = DEFAULT_HEIGHT)]
        height: u32,
        /// Skip the configured LoRA chain for this job.
        #[arg(long)]
        no_loras: bool,
    },

    /// Edit an existing image with a text instruction.
    Edit {
        prompt: String,
        /// Path to the source image.
        #[arg(long)]
        image: PathBuf,
        #[arg(long, default_value_t = DEFAULT_STEPS)]
        steps: u32,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_EDIT_GUIDANCE)]
        guidance: f64,
    },

    /// Inspect or manage the result history.
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
    },

    /// Inspect or manage LoRA adapters.
    Loras {
        #[command(subcommand)]
        action: Option<LoraAction>,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print the current history (default).
    List,
    /// Resynchronize the history from the backend.
    Sync,
    /// Remove one entry by its display URL.
    Remove { url: String },
    /// Drop all entries.
    Clear,
}

#[derive(Subcommand)]
enum LoraAction {
    /// Print known adapters and their settings (default).
    List,
    /// Refresh the adapter list from the backend.
    Refresh,
    /// Update one adapter's settings.
    Set {
        name: String,
        #[arg(long)]
        enabled: bool,
        #[arg(long, default_value_t = 0.5)]
        model_strength: f64,
        #[arg(long, default_value_t = 0.45)]
        clip_strength: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fluxdeck=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = BackendConfig::from_env();
    tracing::debug!(api_url = %config.api_url, ws_url = %config.ws_url, "Resolved backend config");
    let api = Arc::new(ComfyUIApi::new(config.api_url.clone()));
    let history = Arc::new(HistoryStore::open(HistoryFile::new(config.history_path())));
    let registry = LoraRegistry::open(SettingsFile::new(config.lora_settings_path()));

    match cli.command {
        Command::Generate {
            prompt,
            steps,
            seed,
            guidance,
            width,
            height,
            no_loras,
        } => {
            let loras = if no_loras {
                Vec::new()
            } else {
                registry.enabled_chain()
            };
            let params = GenerationParams {
                mode: WorkflowMode::Create,
                prompt,
                steps,
                seed: seed.unwrap_or_else(random_seed),
                cfg: 1.0,
                guidance,
                width,
                height,
                loras,
            };
            run_session(&config, api, history, params, None).await
        }

        Command::Edit {
            prompt,
            image,
            steps,
            seed,
            guidance,
        } => {
            let bytes = std::fs::read(&image)
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let filename = image
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("source.png")
                .to_string();
            let params = GenerationParams {
                mode: WorkflowMode::Edit,
                prompt,
                steps,
                seed: seed.unwrap_or_else(random_seed),
                cfg: 1.0,
                guidance,
                width: DEFAULT_WIDTH,
                height: DEFAULT_HEIGHT,
                loras: Vec::new(),
            };
            let source = SourceImage { filename, bytes };
            run_session(&config, api, history, params, Some(source)).await
        }

        Command::History { action } => match action.unwrap_or(HistoryAction::List) {
            HistoryAction::List => {
                print_history(&history);
                Ok(())
            }
            HistoryAction::Sync => {
                history.reload_from_backend(&api).await;
                print_history(&history);
                Ok(())
            }
            HistoryAction::Remove { url } => {
                history.remove(&url);
                Ok(())
            }
            HistoryAction::Clear => {
                history.clear();
                Ok(())
            }
        },

        Command::Loras { action } => match action.unwrap_or(LoraAction::List) {
            LoraAction::List => {
                print_loras(&registry);
                Ok(())
            }
            LoraAction::Refresh => {
                registry
                    .refresh(&api)
                    .await
                    .context("Failed to refresh LoRA list")?;
                print_loras(&registry);
                Ok(())
            }
            LoraAction::Set {
                name,
                enabled,
                model_strength,
                clip_strength,
            } => {
                registry.set(
                    &name,
                    LoraSetting {
                        enabled,
                        model_strength,
                        clip_strength,
                    },
                );
                print_loras(&registry);
                Ok(())
            }
        },
    }
}

/// Run one job to its terminal event, printing progress along the way.
async fn run_session(
    config: &BackendConfig,
    api: Arc<ComfyUIApi>,
    history: Arc<HistoryStore>,
    params: GenerationParams,
    source: Option<SourceImage>,
) -> anyhow::Result<()> {
    let client = ComfyUIClient::new(config.ws_url.clone());
    let orchestrator = Orchestrator::new(api, client, history, SessionConfig::default());

    let mut events = orchestrator.events();
    let prompt_id = orchestrator.submit(params, source).await?;
    println!("Submitted as {prompt_id}");

    loop {
        let event = events.recv().await.context("Event channel closed")?;
        match event {
            SessionEvent::Uploaded { name } => println!("Uploaded source image as {name}"),
            SessionEvent::Submitted { .. } => {}
            SessionEvent::Progress { value, max, fraction } => {
                println!("Progress: {value}/{max} ({:.0}%)", fraction * 100.0);
            }
            SessionEvent::Completed { entries } => {
                for entry in &entries {
                    println!("Done: {}", entry.url);
                }
                return Ok(());
            }
            SessionEvent::Failed { reason } => anyhow::bail!("Generation failed: {reason}"),
            SessionEvent::TimedOut => anyhow::bail!("Generation timed out"),
            SessionEvent::Cancelled => {
                println!("Cancelled");
                return Ok(());
            }
        }
    }
}

fn print_history(history: &HistoryStore) {
    let entries = history.entries();
    if entries.is_empty() {
        println!("History is empty");
        return;
    }
    for entry in entries {
        println!(
            "{}  [{}] seed={} steps={} {}x{}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.mode.as_str(),
            entry.seed,
            entry.steps,
            entry.width,
            entry.height,
            entry.prompt
        );
        println!("    {}", entry.url);
    }
}

fn print_loras(registry: &LoraRegistry) {
    let settings = registry.all();
    if settings.is_empty() {
        println!("No LoRA adapters known; run `fluxdeck loras refresh`");
        return;
    }
    for (name, setting) in settings {
        println!(
            "{}  {}  model={:.2} clip={:.2}",
            if setting.enabled { "[x]" } else { "[ ]" },
            name,
            setting.model_strength,
            setting.clip_strength
        );
    }
}

/// Clock-derived seed for jobs that don't pin one.
fn random_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
