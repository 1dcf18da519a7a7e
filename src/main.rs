//! CSI Sidecars
//!
//! Runs the CSI attacher, provisioner and resizer controllers in one process.
//! The process keeps running until one of the enabled controllers stops, then
//! cancels the others and exits with a non-zero status.

use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csi_sidecars::config::LoggingConfig;
use csi_sidecars::controlplane::DiagnosticsServer;
use csi_sidecars::{
    builtin_registry, Configuration, EnableList, Error, HostMetrics, Result, Supervisor,
    SupervisorConfig,
};

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Configuration::from_args(std::env::args_os()) {
        Ok(config) => config,
        // Help, version and usage errors are printed by clap
        Err(Error::Flags(e)) => e.exit(),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    init_logging(&config.logging);

    let err = match run(config).await {
        Ok(never) => match never {},
        Err(err) => err,
    };
    error!("{}", err);
    ExitCode::from(err.exit_code())
}

/// Run the host until the supervisor reports why it stopped
async fn run(config: Configuration) -> Result<std::convert::Infallible> {
    let config = config.finalize()?;

    info!("Starting CSI sidecars");
    info!("  Version: {}", csi_sidecars::VERSION);
    info!("  Controllers: {}", config.controllers);
    info!("  CSI address: {}", config.client.csi_address);
    match serde_json::to_string(&*config) {
        Ok(effective) => debug!(config = %effective, "Effective configuration"),
        Err(e) => warn!("Failed to serialize configuration: {}", e),
    }

    let registry = builtin_registry()?;
    let selected = registry.select(&EnableList::parse(&config.controllers))?;

    let metrics = HostMetrics::new()?;
    let shutdown = CancellationToken::new();
    let mut supervisor = Supervisor::new(SupervisorConfig::from_configuration(&config), metrics)
        .with_parent(&shutdown);

    // Bind diagnostics before any controller runs
    let diagnostics_stop = CancellationToken::new();
    let diagnostics = match config.diagnostics.listen_address() {
        Some(addr) => {
            let server =
                DiagnosticsServer::bind(addr, &config.diagnostics.metrics_path, supervisor.status())
                    .await?;
            let stop = diagnostics_stop.clone();
            let group = supervisor.cancellation_token();
            Some(tokio::spawn(async move {
                let result = server.serve(stop).await;
                if let Err(e) = &result {
                    error!("{}; stopping controllers", e);
                    group.cancel();
                }
                result
            }))
        }
        None => None,
    };

    tokio::spawn(watch_signals(shutdown));

    supervisor.start(selected, Arc::clone(&config))?;
    let err = supervisor.wait().await;

    diagnostics_stop.cancel();
    if let Some(handle) = diagnostics {
        match handle.await {
            Ok(Err(server_err)) => {
                error!("{}", err);
                return Err(server_err);
            }
            Ok(Ok(())) => {}
            Err(e) => warn!("Diagnostics server task failed: {}", e),
        }
    }
    Err(err)
}

/// Cancel the supervisor on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(logging: &LoggingConfig) {
    let level = logging.max_level();

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if logging.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
