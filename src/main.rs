//! RetailLens - camera-based retail product recognition
//!
//! Command-line front end: one-shot detection, replayed scanning sessions,
//! accuracy validation, and config scaffolding.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use retail_lens::analysis::validate_dataset;
use retail_lens::capture::{DirectoryFrameSource, Frame};
use retail_lens::config::{self, AppConfig};
use retail_lens::storage::{self, products};
use retail_lens::vision::{decode_image, ocr, DetectionMethod};
use retail_lens::{DetectionOrchestrator, ScanEvent, ScanSession};

/// RetailLens - multi-method product detection
#[derive(Parser, Debug)]
#[command(name = "retail-lens")]
#[command(about = "Recognize retail products in camera frames")]
struct Args {
    /// Configuration file (defaults to the per-user config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging for the engine
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one detection cycle on an image and print the decision
    Detect {
        image: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        method: Option<DetectionMethod>,
    },
    /// Replay a directory of frames through a scanning session
    Scan {
        dir: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
        /// Restart from the first frame when the directory is exhausted
        #[arg(long = "loop")]
        looping: bool,
        #[arg(long)]
        method: Option<DetectionMethod>,
    },
    /// Measure accuracy over `<dir>/<product_id>/*.png`
    Validate {
        dir: PathBuf,
        #[arg(long)]
        catalog: Option<PathBuf>,
        #[arg(long)]
        method: Option<DetectionMethod>,
    },
    /// Write the default configuration
    InitConfig { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "info,retail_lens=debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = match &args.command {
        Command::InitConfig { .. } => AppConfig::default(),
        _ => load_or_default_config(args.config.as_deref())?,
    };

    match args.command {
        Command::Detect { image, catalog, method } => {
            let orchestrator = build_orchestrator(&config, catalog, method)?;
            let frame = Frame::from_image(decode_image(&image)?);
            let decision = orchestrator.detect(Arc::new(frame)).await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        Command::Scan {
            dir,
            catalog,
            looping,
            method,
        } => {
            let orchestrator = build_orchestrator(&config, catalog, method)?;
            run_scan(orchestrator, &dir, looping, Duration::from_millis(config.detection.interval_ms)).await?;
        }
        Command::Validate { dir, catalog, method } => {
            let orchestrator = build_orchestrator(&config, catalog, method)?;
            let report = validate_dataset(&orchestrator, &dir).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::InitConfig { path } => {
            let path = match path {
                Some(path) => path,
                None => storage::get_config_dir()?.join("config.toml"),
            };
            config::save_config(&config, &path)?;
            info!("Wrote default configuration to {:?}", path);
        }
    }

    Ok(())
}

/// Load configuration from `--config`, the per-user file, or defaults
fn load_or_default_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = config::load_config(path)
            .with_context(|| format!("Failed to load configuration: {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(config_dir) = storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match config::load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return Ok(config);
                }
                Err(e) => warn!("Ignoring unreadable configuration {:?}: {:#}", config_path, e),
            }
        }
    }
    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn build_orchestrator(
    config: &AppConfig,
    catalog: Option<PathBuf>,
    method: Option<DetectionMethod>,
) -> Result<DetectionOrchestrator> {
    let catalog_path = catalog
        .or_else(|| config.detection.catalog_path.clone())
        .context("No product catalog given (use --catalog or detection.catalog_path)")?;

    let mut orchestrator = DetectionOrchestrator::new(config, ocr::recognizer_for(&config.text))?;
    if let Some(method) = method {
        orchestrator.set_method(method);
    }

    let catalog = products::load_catalog(&catalog_path)?;
    let summaries = orchestrator.register_catalog(&catalog)?;
    info!(
        "Loaded {} products from {:?} ({} method)",
        summaries.len(),
        catalog_path,
        orchestrator.method()
    );
    Ok(orchestrator)
}

async fn run_scan(orchestrator: DetectionOrchestrator, dir: &Path, looping: bool, interval: Duration) -> Result<()> {
    let events = orchestrator.subscribe();
    let source = DirectoryFrameSource::new(dir, looping)?;
    let orchestrator = Arc::new(AsyncMutex::new(orchestrator));

    let mut session = ScanSession::start(orchestrator, Box::new(source), interval);

    let token = session.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping scan");
            token.cancel();
        }
    });

    let printer = std::thread::spawn(move || {
        for event in events.iter() {
            match event {
                ScanEvent::Confirmed { product_id, confidence } => {
                    println!("confirmed {} ({:.2})", product_id, confidence)
                }
                ScanEvent::Cleared { product_id } => println!("cleared {}", product_id),
                ScanEvent::Started { session_id } => info!("Session {} started", session_id),
                ScanEvent::Stopped { session_id } => {
                    info!("Session {} stopped", session_id);
                    break;
                }
            }
        }
    });

    session.wait().await;
    let state = session.state();
    drop(session);
    if printer.join().is_err() {
        warn!("Event printer thread panicked");
    }

    info!(
        "Processed {} frames, {} ticks skipped, {} capture errors",
        state.frames_processed, state.ticks_skipped, state.capture_errors
    );
    Ok(())
}
