//! Train builder server.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use trainbuilder_scheduler::PipelineService;
use trainbuilder_server::startup::{self, EXIT_RUNTIME, StartupError};
use trainbuilder_server::{AppState, routes};

#[derive(Parser)]
#[command(name = "trainbuilder-server")]
#[command(about = "Accepts train archives and publishes them as container images", long_about = None)]
struct Cli {
    /// Path to the KDL configuration file
    #[arg(long, env = "TRAINBUILDER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Keep jobs in memory even when a database URL is configured
    #[arg(long)]
    in_memory: bool,

    /// Emit logs as JSON
    #[arg(long, env = "TRAINBUILDER_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<StartupError>()
                .map(StartupError::exit_code)
                .unwrap_or(EXIT_RUNTIME);
            error!(exit_code = code, "FATAL: {:#}", e);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = startup::load_settings(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }

    let engine = startup::connect_engine(&settings).await?;
    let store = startup::open_store(&settings, cli.in_memory).await?;

    let listen = settings.listen;
    let service = Arc::new(PipelineService::new(store, engine, settings));
    service
        .prepare()
        .await
        .context("failed to create jobs directory")?;
    service.recover().await.context("failed to recover jobs")?;

    let scheduler = service.scheduler()?;
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(async move {
        scheduler
            .run(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    let app = routes::router(AppState::new(service)).layer(TraceLayer::new_for_http());

    info!("Starting server on {}", listen);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {}", listen))?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Let an in-progress tick finish before exiting
    let _ = stop_tx.send(true);
    scheduler_task.await.context("scheduler task panicked")?;

    served.context("server error")?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
