//! layercast - generative collection command-line tool
//!
//! Subcommands:
//! - `generate`: full session against the filesystem storage, prints the result
//! - `preview`: rarity preview for a layer directory and configuration
//! - `validate`: layer and configuration problems, without generating
//! - `resume`: finish sessions whose process stopped mid-run

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use layercast_common::config::{load_or_default, resolve_root_folder, TomlConfig};
use layercast_common::events::{EventBus, GenerationEvent, GenerationStatus};
use layercast_engine::combination::total_possible_combinations;
use layercast_engine::config::validate_request;
use layercast_engine::layers::LayerLimits;
use layercast_engine::persistence::SessionStore;
use layercast_engine::rarity::{self, LayerRarity, LayerWeights, RarityPreview, WeightTable};
use layercast_engine::{FileStorage, GenerationRequest, LayerStore, SessionManager};

/// Command-line arguments for layercast
#[derive(Parser, Debug)]
#[command(name = "layercast")]
#[command(about = "Generative collection engine")]
#[command(version)]
struct Cli {
    /// Bootstrap TOML configuration
    #[arg(long, global = true, env = "LAYERCAST_SETTINGS")]
    settings: Option<PathBuf>,

    /// Root folder for session snapshots and default output
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a collection and print the result as JSON
    Generate(GenerateArgs),
    /// Print the rarity preview as JSON
    Preview(PreviewArgs),
    /// Print layer and configuration problems
    Validate(ValidateArgs),
    /// Finish interrupted sessions from their snapshots and print the results
    Resume(OutputArgs),
}

#[derive(Args, Debug)]
struct SourceArgs {
    /// Directory with one sub-directory per layer
    #[arg(long)]
    layers: PathBuf,
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Output directory (defaults to storage.output_dir, then <root>/storage)
    #[arg(long)]
    output: Option<PathBuf>,

    /// URI prefix for stored objects
    #[arg(long)]
    base_uri: Option<String>,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Generation request (JSON)
    #[arg(long)]
    config: PathBuf,

    #[command(flatten)]
    output: OutputArgs,

    /// RNG seed, overrides the request
    #[arg(long)]
    seed: Option<u64>,

    /// Keep the session snapshot under <root>/sessions after success
    #[arg(long)]
    keep_session: bool,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Generation request (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Number of sampled combinations
    #[arg(long, default_value = "1000")]
    samples: usize,

    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Generation request (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let toml = load_or_default(cli.settings.as_deref()).context("Failed to load settings")?;
    init_tracing(&toml)?;

    let root_folder = resolve_root_folder(cli.root_folder.as_deref(), &toml);
    info!(root_folder = %root_folder.display(), "Starting layercast {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Generate(args) => generate(args, &toml, &root_folder).await,
        Command::Preview(args) => preview(args),
        Command::Validate(args) => validate(args, &toml),
        Command::Resume(args) => resume(args, &toml, &root_folder).await,
    }
}

/// stderr logging (stdout carries JSON output), plus an optional log file
fn init_tracing(toml: &TomlConfig) -> Result<()> {
    let level = &toml.logging.level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("layercast_engine={level},layercast={level},layercast_common={level}").into()
    });

    let file_layer = match &toml.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

async fn generate(args: GenerateArgs, toml: &TomlConfig, root_folder: &Path) -> Result<()> {
    let layers = load_layers(&args.source.layers)?;
    let mut request = load_request(&args.config)?;
    if args.seed.is_some() {
        request.seed = args.seed;
    }

    let event_bus = EventBus::new(256);
    let manager = session_manager(&args.output, toml, root_folder, &event_bus);
    let reporter = spawn_reporter(&event_bus);

    let id = manager
        .create_session(layers)
        .await
        .context("Layers rejected")?;
    let outcome = manager
        .configure(id, request)
        .await
        .context("Configuration rejected")?;
    for warning in &outcome.warnings {
        warn!("{}", warning);
    }

    let result = manager
        .run_generation(id)
        .await
        .context("Generation failed")?;
    reporter.abort();

    println!("{}", serde_json::to_string_pretty(&*result)?);
    if !args.keep_session {
        manager.remove_session(id).await?;
    }
    Ok(())
}

/// Recover every stored session, run the configured ones still pending and
/// print each result; finished and unusable snapshots are deleted
async fn resume(args: OutputArgs, toml: &TomlConfig, root_folder: &Path) -> Result<()> {
    let event_bus = EventBus::new(256);
    let manager = session_manager(&args, toml, root_folder, &event_bus);
    let reporter = spawn_reporter(&event_bus);

    let recovered = manager.recover().await.context("Failed to read session snapshots")?;
    info!(sessions = recovered, "Resuming sessions");

    let mut failed = 0;
    for id in manager.session_ids().await {
        let session = manager.get_session(id).await?;
        let result = match (session.status, session.config.is_some()) {
            (GenerationStatus::Pending, true) => match manager.run_generation(id).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Resumed session failed");
                    failed += 1;
                    None
                }
            },
            (GenerationStatus::Completed, _) => manager.get_result(id).await?,
            _ => {
                warn!(session_id = %id, status = %session.status, "Session was never configured");
                None
            }
        };
        if let Some(result) = result {
            println!("{}", serde_json::to_string_pretty(&*result)?);
        }
        manager.remove_session(id).await?;
    }
    reporter.abort();

    if failed > 0 {
        bail!("{} resumed session(s) failed", failed);
    }
    Ok(())
}

/// Filesystem storage plus session snapshots under `root_folder`
fn session_manager(
    args: &OutputArgs,
    toml: &TomlConfig,
    root_folder: &Path,
    event_bus: &EventBus,
) -> SessionManager {
    let output = args
        .output
        .clone()
        .or_else(|| toml.storage.output_dir.clone())
        .unwrap_or_else(|| root_folder.join("storage"));
    let base_uri = args
        .base_uri
        .clone()
        .unwrap_or_else(|| toml.storage.base_uri.clone());
    info!(output = %output.display(), "Writing artifacts");

    SessionManager::new(
        Arc::new(FileStorage::new(&output, base_uri)),
        toml.generation.clone(),
        event_bus.clone(),
    )
    .with_store(SessionStore::new(root_folder))
}

/// Log every progress snapshot
fn spawn_reporter(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut events = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let GenerationEvent::ProgressUpdated { snapshot } = event {
                info!(
                    session_id = %snapshot.session_id,
                    status = %snapshot.status,
                    percentage = format!("{:.1}", snapshot.percentage),
                    current = snapshot.current,
                    total = snapshot.total,
                    "{}",
                    snapshot.message
                );
            }
        }
    })
}

/// Written with the streaming serializer, which handles `u128`
#[derive(Serialize)]
struct PreviewReport {
    total_possible_combinations: u128,
    layers: Vec<LayerRarity>,
    preview: RarityPreview,
}

fn preview(args: PreviewArgs) -> Result<()> {
    let layers = load_layers(&args.source.layers)?;
    let request = load_request(&args.config)?;
    let table = effective_weights(&request, &layers);

    let mut rng = match args.seed.or(request.seed) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let preview = rarity::preview(&table, args.samples, &mut rng);

    let report = PreviewReport {
        total_possible_combinations: total_possible_combinations(&request.layer_order, &layers),
        layers: rarity::all_rarity(&table),
        preview,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn validate(args: ValidateArgs, toml: &TomlConfig) -> Result<()> {
    let layers = load_layers(&args.source.layers)?;
    let layer_errors = layers.validate(&LayerLimits::from(&toml.generation));

    let (config_errors, warnings) = match &args.config {
        Some(path) => {
            let request = load_request(path)?;
            match validate_request(&request, &layers, &toml.generation) {
                Ok(outcome) => (Vec::new(), outcome.warnings),
                Err(errors) => (errors, Vec::new()),
            }
        }
        None => (Vec::new(), Vec::new()),
    };

    let valid = layer_errors.is_empty() && config_errors.is_empty();
    let report = json!({
        "valid": valid,
        "layers": layers.summary(),
        "layer_errors": layer_errors,
        "config_errors": config_errors,
        "warnings": warnings,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !valid {
        bail!("Validation failed");
    }
    Ok(())
}

fn load_layers(dir: &Path) -> Result<LayerStore> {
    LayerStore::load_dir(dir).with_context(|| format!("Failed to load layers from {}", dir.display()))
}

fn load_request(path: &Path) -> Result<GenerationRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Weight table covering every ordered layer; unweighted layers are uniform
fn effective_weights(request: &GenerationRequest, layers: &LayerStore) -> WeightTable {
    request
        .layer_order
        .iter()
        .filter_map(|name| {
            let layer = layers.get(name)?;
            let weights: LayerWeights = match request.weights.layer(name) {
                Some(w) if !w.is_empty() => w.clone(),
                _ => layer.traits().iter().map(|t| (t.clone(), 1.0)).collect(),
            };
            Some((name.clone(), weights))
        })
        .collect()
}
