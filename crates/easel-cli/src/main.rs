mod config;
mod logging;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::events::GenerationEvent;
use easel_contracts::history::{HistoryStore, SqliteHistoryStore};
use easel_engine::{StartRequest, DEFAULT_COUNT, DEFAULT_HEIGHT, DEFAULT_WIDTH};

use crate::config::{preset_prompts, DataLayout, EngineArgs};
use crate::server::AppState;

const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Prompt-expanding image generation server")]
struct Cli {
    /// Tracing filter, e.g. `info` or `easel_engine=debug`.
    #[arg(long, env = "EASEL_LOG", global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and the event WebSocket.
    Serve(ServeArgs),
    /// Generate images for one prompt in the foreground, then exit.
    Run(RunArgs),
    /// Import a legacy `history.json` into the SQLite history database.
    Migrate(MigrateArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, env = "EASEL_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "EASEL_PORT", default_value_t = 5000)]
    port: u16,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = DEFAULT_COUNT)]
    count: u64,
    #[arg(long, default_value_t = DEFAULT_WIDTH)]
    width: u32,
    #[arg(long, default_value_t = DEFAULT_HEIGHT)]
    height: u32,
    /// Reference image handed to the synthesizer.
    #[arg(long)]
    image: Option<PathBuf>,
    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Debug, Parser)]
struct MigrateArgs {
    #[arg(long, env = "EASEL_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    /// Legacy file to import; defaults to `<data-dir>/history.json`.
    #[arg(long)]
    from: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref());
    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Run(args) => run_foreground(args),
        Command::Migrate(args) => run_migrate(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    let layout = args.engine.layout();
    // Collaborators hold blocking HTTP clients; build them before the runtime.
    let controller = args.engine.build_controller(&layout)?;
    let presets = preset_prompts();
    tracing::info!(presets = presets.len(), "preset prompts loaded");
    let state = AppState::new(controller.clone(), layout, presets);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("easel-http")
        .build()
        .context("failed to build tokio runtime")?;
    let host = args.host.clone();
    let port = args.port;
    let served = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind((host.as_str(), port))
            .await
            .with_context(|| format!("failed to bind {host}:{port}"))?;
        let addr: SocketAddr = listener.local_addr()?;
        tracing::info!(%addr, "listening");
        server::serve(listener, state, server::shutdown_signal()).await
    });

    tracing::info!("stopping generation");
    controller.shutdown()?;
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    served?;
    Ok(0)
}

fn run_foreground(args: RunArgs) -> Result<i32> {
    let layout = args.engine.layout();
    let controller = args.engine.build_controller(&layout)?;
    let events = controller.subscribe();
    let reference_image = match &args.image {
        Some(path) if !path.is_file() => bail!("reference image {} not found", path.display()),
        other => other.clone(),
    };

    controller.start(StartRequest {
        prompt: Some(args.prompt.clone()),
        count: args.count,
        width: args.width,
        height: args.height,
        reference_image,
    })?;

    let outcome = loop {
        let Some(event) = events.recv() else {
            bail!("event hub closed before generation finished");
        };
        match event {
            GenerationEvent::NewImage {
                path,
                current,
                total,
            } => {
                println!("[{current}/{total}] {}", layout.generated.join(&path).display());
            }
            GenerationEvent::Progress {
                current,
                total,
                status,
            } => {
                tracing::debug!(current, total, ?status, "progress");
            }
            GenerationEvent::Log { message } => {
                tracing::trace!(chunk = %message, "expander output");
            }
            GenerationEvent::GenerationComplete { total } => {
                println!("Generated {total} image(s) for \"{}\"", args.prompt.trim());
                break 0;
            }
            GenerationEvent::Error { message } => {
                eprintln!("generation failed: {message}");
                break 1;
            }
        }
    };
    controller.shutdown()?;
    Ok(outcome)
}

fn run_migrate(args: MigrateArgs) -> Result<i32> {
    let layout = DataLayout::new(&args.data_dir);
    let source = args.from.unwrap_or_else(|| layout.legacy_history.clone());
    if !source.is_file() {
        println!("No legacy history at {}; nothing to migrate", source.display());
        return Ok(0);
    }

    let mut backup = source.clone().into_os_string();
    backup.push(".backup");
    let backup = PathBuf::from(backup);
    std::fs::copy(&source, &backup)
        .with_context(|| format!("failed to back up {}", source.display()))?;
    tracing::info!(backup = %backup.display(), "legacy history backed up");

    let store = SqliteHistoryStore::open(&layout.history)?;
    let summary = store.import_legacy_json(&source)?;
    let stats = store.stats()?;
    println!(
        "Imported {} record(s) with {} image(s) into {}; skipped {}",
        summary.imported,
        summary.images,
        layout.history.display(),
        summary.skipped
    );
    println!(
        "Database now holds {} prompt(s) and {} image(s); original kept at {}",
        stats.total_prompts,
        stats.total_images,
        backup.display()
    );
    Ok(0)
}
