//! ttyhub: PTY session broker server

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ttyhub_broker::{
    build_router, DefaultModes, NativePtySpawner, ServerArgs, SessionRegistry, TracingObserver,
};

#[derive(Parser)]
#[command(name = "ttyhub")]
#[command(about = "Multi-viewer PTY session broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default)
    Serve(ServerArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Serve(args)) => args,
        None => match Cli::try_parse_from(["ttyhub", "serve"])?.command {
            Some(Commands::Serve(args)) => args,
            None => anyhow::bail!("no command"),
        },
    };

    let _guard = init_tracing(args.log_dir.as_deref());
    run_server(args).await
}

fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Failed to create log directory {:?}: {}. Logging to file disabled.",
            log_dir, e
        );
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, "ttyhub.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Some(guard)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {error}");
    }
    info!("shutdown signal received");
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = args.to_config();
    info!(
        "Limits: {} sessions/owner, idle {:?}, detach grace {:?}, modes {:?}",
        config.max_sessions_per_owner, config.idle_timeout, config.detach_grace, config.enabled_modes
    );

    let resolver = Arc::new(DefaultModes::new(&config));
    let registry = SessionRegistry::new(
        config,
        Arc::new(NativePtySpawner),
        resolver,
        Arc::new(TracingObserver),
    );
    let sweeper = registry.spawn_sweeper();

    let app = build_router(registry.clone());
    let addr = args.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    info!("ttyhub listening on {}", addr);

    // Sessions go first so attached viewers get their exit frame and hang up
    let draining = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown();
        })
        .await
        .context("Server error")?;

    sweeper.abort();
    registry.shutdown();
    info!("server shut down gracefully");
    Ok(())
}
