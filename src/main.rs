//! toolgrid gateway binary.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use toolgrid::{
    config::{self, GatewayConfig},
    server, AppState,
};

/// Protocol bridge and tool-aggregation gateway for LLM tool servers.
#[derive(Parser, Debug)]
#[command(name = "toolgrid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, value_name = "FILE", env = "TOOLGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address override (host:port)
    #[arg(short, long, env = "TOOLGRID_LISTEN")]
    listen: Option<String>,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose, args.quiet);

    let mut cfg = match &args.config {
        Some(path) => match config::load_config(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Configuration error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        cfg.listen = listen;
    }
    if cfg.listen.is_empty() {
        cfg.listen = config::DEFAULT_LISTEN.to_string();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(cfg)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting toolgrid gateway");

    let state = AppState::from_config(&cfg)?;
    state.connect_servers(&cfg).await?;

    state
        .sessions
        .spawn_sweeper(cfg.sessions.sweep_interval()?, state.shutdown.clone());
    if let Some(interval) = &cfg.refresh_interval {
        state.spawn_refresh(toolgrid_workflow::parse_duration(interval)?);
    }

    let listener = tokio::net::TcpListener::bind(&cfg.listen).await?;
    info!("Listening on http://{}", cfg.listen);

    let app = server::router(Arc::clone(&state));
    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            shutdown_state.shutdown.cancel();
        })
        .await?;

    state.catalog.shutdown().await;
    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
