//! mintel-ai - meeting-intelligence pipeline service
//!
//! Runs one worker and one maintenance loop per active stage, the
//! orchestrator event loop, and the HTTP API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mintel_common::config::{
    default_config_path, load_toml_config, RootFolderInitializer, RootFolderResolver, TomlConfig,
    CONFIG_FILE_NAME,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mintel_ai::capabilities::{
    AnalysisEngine, HttpAnalysisEngine, HttpTranscriptionEngine, TranscriptionEngine,
    UnconfiguredCapability,
};
use mintel_ai::config::PipelineSettings;
use mintel_ai::orchestrator::PipelineOrchestrator;
use mintel_ai::queue::maintenance::run_maintenance;
use mintel_ai::queue::StageQueues;
use mintel_ai::worker::{AnalysisHandler, StageHandler, StageWorker, TranscriptionHandler};
use mintel_ai::AppState;

/// Command-line arguments for mintel-ai
#[derive(Parser, Debug)]
#[command(name = "mintel-ai")]
#[command(about = "Meeting-intelligence processing pipeline")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "MINTEL_AI_PORT")]
    port: Option<u16>,

    /// Root folder holding the database and config file
    #[arg(short, long, env = "MINTEL_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Config file (default: <root folder>/mintel.toml, then the OS config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn config_path(args: &Args) -> PathBuf {
    if let Some(path) = &args.config {
        return path.clone();
    }
    if let Some(root) = &args.root_folder {
        let candidate = root.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return candidate;
        }
    }
    default_config_path()
}

fn build_engines(toml: &TomlConfig) -> Result<(Arc<dyn TranscriptionEngine>, Arc<dyn AnalysisEngine>)> {
    let timeout = Duration::from_secs(toml.capability_timeout_secs);

    let transcription: Arc<dyn TranscriptionEngine> = match &toml.transcription_url {
        Some(url) => Arc::new(
            HttpTranscriptionEngine::new(url, timeout).context("Failed to build transcription client")?,
        ),
        None => {
            warn!("transcription_url not configured, transcription tasks will fail");
            Arc::new(UnconfiguredCapability)
        }
    };

    let analysis: Arc<dyn AnalysisEngine> = match &toml.analysis_url {
        Some(url) => Arc::new(HttpAnalysisEngine::new(url, timeout).context("Failed to build analysis client")?),
        None => {
            warn!("analysis_url not configured, analysis tasks will fail");
            Arc::new(UnconfiguredCapability)
        }
    };

    Ok((transcription, analysis))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config = load_toml_config(&config_path(&args)).context("Failed to load config file")?;
    mintel_common::logging::init_tracing(&toml_config.logging).context("Failed to initialize logging")?;

    info!("Starting mintel-ai (pipeline) service");
    info!(
        "Version: {} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    // Root folder and database
    let root_folder = RootFolderResolver::default().resolve(args.root_folder.as_deref(), &toml_config);
    let initializer = RootFolderInitializer::new(root_folder);
    initializer
        .ensure_directory_exists()
        .context("Failed to initialize root folder")?;

    let db_path = initializer.database_path(&toml_config);
    info!("Database: {}", db_path.display());
    let db = mintel_ai::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let settings = PipelineSettings::load(&db).await.context("Failed to load pipeline settings")?;

    // Queues, orchestrator, handlers
    let (events_tx, events_rx) = mpsc::channel(settings.event_channel_capacity);
    let queues = StageQueues::new(db.clone(), &settings.topology, settings.poll_interval, events_tx);
    let orchestrator = PipelineOrchestrator::new(db.clone(), queues.clone(), settings.topology.clone());

    let (transcription, analysis) = build_engines(&toml_config)?;
    let mut handlers: Vec<Arc<dyn StageHandler>> = vec![Arc::new(TranscriptionHandler::new(transcription))];
    for stage in settings.topology.fan_out() {
        if let Some(handler) = AnalysisHandler::for_stage(*stage, analysis.clone()) {
            handlers.push(Arc::new(handler));
        }
    }

    // Repair lost events before any worker or the orchestrator loop starts
    match orchestrator.reconcile().await {
        Ok(report) => info!(?report, "Startup reconciliation finished"),
        Err(e) => error!(error = %e, "Startup reconciliation failed"),
    }

    let shutdown = CancellationToken::new();
    let mut background = JoinSet::new();

    for handler in handlers {
        let queue = queues.get(handler.stage())?.clone();
        let worker = StageWorker::new(db.clone(), queue, handler, settings.heartbeat_interval);
        background.spawn(worker.run(shutdown.clone()));
    }

    for (_, queue) in queues.iter() {
        background.spawn(run_maintenance(
            queue.clone(),
            settings.maintenance_interval,
            shutdown.clone(),
        ));
    }

    {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        let interval = settings.maintenance_interval;
        background.spawn(async move { orchestrator.run(events_rx, interval, shutdown).await });
    }

    // HTTP server
    let app = mintel_ai::build_router(AppState::new(db.clone(), orchestrator));

    let port = args.port.unwrap_or(toml_config.port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Workers finish their in-flight tasks before exiting
    shutdown.cancel();
    while let Some(joined) = background.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Background task ended abnormally");
        }
    }

    db.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
