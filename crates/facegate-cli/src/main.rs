use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{EmbeddingProvider, FsImageFetcher, OnnxEmbedder, ReferenceLoader};
use facegate_hw::V4l2CameraSource;
use facegate_session::{
    Config, FileLabelStore, LabelStore, SessionController, SessionDeps, SessionObserver, SessionState,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate", about = "Face verification gate", version)]
struct Cli {
    /// TOML configuration file (defaults plus FACEGATE_* overrides when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify the face in front of the camera against the reference faces
    Verify,
    /// Load the model and reference faces, and report what was enrolled
    Enroll,
    /// Show configuration and the stored verification as JSON
    Status,
    /// Remove the stored verification
    Clear,
    /// List V4L2 capture devices
    Devices,
}

/// Prints session status lines to stdout.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn status(&self, text: &str) {
        println!("{text}");
    }

    fn state_changed(&self, state: SessionState) {
        tracing::debug!(%state, "session state");
    }

    fn navigate(&self, destination: &str) {
        println!("continue to {destination}");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Devices = cli.command {
        return devices();
    }

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    match cli.command {
        Commands::Verify => verify(config).await,
        Commands::Enroll => enroll(config).await,
        Commands::Status => status(&config),
        Commands::Clear => {
            FileLabelStore::new(&config.store_path).clear()?;
            println!("verification cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Devices => devices(),
    }
}

fn embedder(config: &Config) -> Arc<OnnxEmbedder> {
    Arc::new(OnnxEmbedder::from_model_dir(&config.model_dir, config.detector))
}

async fn verify(config: Config) -> Result<ExitCode> {
    let controller = SessionController::new(
        config.session_settings(),
        SessionDeps {
            provider: embedder(&config),
            fetcher: Arc::new(FsImageFetcher::new(&config.reference_dir)),
            camera: Arc::new(V4l2CameraSource::new(&config.camera_device)),
            store: Arc::new(FileLabelStore::new(&config.store_path)),
            observer: Arc::new(ConsoleObserver),
        },
    );

    let mut states = controller.subscribe();
    let attempt = async {
        if let Err(err) = controller.start().await {
            tracing::debug!(error = %err, "attempt did not reach polling");
        }
        let state = *states.wait_for(|s| s.is_terminal()).await?;
        anyhow::Ok(state)
    };

    let state = tokio::select! {
        state = attempt => state?,
        _ = tokio::signal::ctrl_c() => {
            controller.unload();
            SessionState::Stopped
        }
    };

    match state {
        SessionState::Verified => {
            if let Some(record) = controller.verified()? {
                println!("verified as {} (distance {:.3})", record.label, record.distance);
            }
            Ok(ExitCode::SUCCESS)
        }
        SessionState::Stopped => Ok(ExitCode::from(130)),
        _ => Ok(ExitCode::FAILURE),
    }
}

async fn enroll(config: Config) -> Result<ExitCode> {
    let provider = embedder(&config);
    provider.load().await.context("loading models")?;

    let loader = ReferenceLoader::new(provider, Arc::new(FsImageFetcher::new(&config.reference_dir)));
    let (references, report) = loader.load_with_report(&config.references).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{} label(s) enrolled", references.len());
    Ok(ExitCode::SUCCESS)
}

fn status(config: &Config) -> Result<ExitCode> {
    let verified = FileLabelStore::new(&config.store_path).get()?;
    let report = serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "camera_device": config.camera_device,
        "model_dir": config.model_dir,
        "poll_interval_ms": config.poll_interval_ms,
        "match_threshold": config.match_threshold,
        "distance_metric": config.distance_metric,
        "stage_timeout_secs": config.stage_timeout_secs,
        "destination": config.destination,
        "store_path": config.store_path,
        "references": config.references,
        "verified": verified,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn devices() -> Result<ExitCode> {
    let devices = V4l2CameraSource::list_devices();
    if devices.is_empty() {
        println!("no capture devices found");
    }
    for device in devices {
        println!("{}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
    Ok(ExitCode::SUCCESS)
}
