//! MCP Bridge
//!
//! Expose stdio-based MCP servers over REST and streamable HTTP.

use clap::Parser;
use mcp_bridge::VERSION;
use mcp_bridge::config::{BridgeConfig, BridgeSettings, CliArgs, ConfigSource, ServerDefinition};
use mcp_bridge::http::{AppState, create_router, with_request_counting};
use mcp_bridge::registry::{ToolRegistry, spawn_registry_refresh_loop};
use mcp_bridge::router::ToolRouter;
use mcp_bridge::secrets::SECRET_COMMAND_TIMEOUT;
use mcp_bridge::session::SessionManager;
use mcp_bridge::supervisor::{BackendEvent, BackendManager, StdioBackend, StdioBackendSettings};
use std::collections::BTreeMap;
use std::io::{IsTerminal as _, stdout};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse();

    // Load configuration
    let config = BridgeConfig::load(cli)?;

    if config.cli.print_effective_config {
        let yaml = serde_yaml::to_string(&config.effective())?;
        print!("{yaml}");
        return Ok(());
    }

    // Initialize logging (effective config already includes CLI/ENV/config precedence).
    init_logging(&config.settings.log_level);

    tracing::info!("Starting MCP Bridge v{}", VERSION);

    match &config.source {
        ConfigSource::File(path) => {
            tracing::info!("Loaded {} server(s) from {}", config.servers.len(), path.display());
        }
        ConfigSource::MissingDefault(path) => {
            tracing::warn!(
                "Config file {} not found; starting with no servers",
                path.display()
            );
        }
    }
    for id in config.unknown_auto_enable_ids() {
        tracing::warn!(server = %id, "auto-enable names a server that is not defined");
    }
    if let Some(requested) = config.clamped_call_timeout {
        tracing::warn!(
            requested,
            cap = config.settings.call_timeout_max,
            "callTimeout exceeds MCP_BRIDGE_TOOL_CALL_TIMEOUT_MAX_SECS cap; clamping"
        );
    }

    // Create backend manager and tool registry
    let backend_manager = Arc::new(BackendManager::new());
    let registry = Arc::new(ToolRegistry::new());

    // Lifecycle events from backends (tool list changes, exits) keep the catalog current.
    let (events_tx, events_rx) = mpsc::unbounded_channel::<BackendEvent>();
    spawn_registry_refresh_loop(backend_manager.clone(), registry.clone(), events_rx);

    register_backends_from_config(
        backend_manager.as_ref(),
        &config.settings,
        config.servers.clone(),
        &events_tx,
    );

    let router = Arc::new(ToolRouter::new(
        registry.clone(),
        backend_manager.clone(),
        config.settings.call_timeout_duration(),
        config.settings.call_timeout_max_duration(),
    ));
    let sessions = Arc::new(SessionManager::new(
        config.settings.session_idle_timeout_duration(),
    ));

    // Create cancellation token for graceful shutdown
    let ct = CancellationToken::new();
    let sweeper = sessions.spawn_sweeper(
        config.settings.session_sweep_interval_duration(),
        ct.child_token(),
    );

    // Create app state for HTTP endpoints
    let state = Arc::new(AppState::new(router.clone(), sessions.clone()));
    let app = with_request_counting(create_router(state.clone()), state);

    // Parse bind address
    let addr: SocketAddr =
        config.settings.bind.parse().map_err(|e| {
            anyhow::anyhow!("Invalid bind address '{}': {}", config.settings.bind, e)
        })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let ct_clone = ct.clone();
    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            ct_clone.cancelled().await;
        });

        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    // Start enabled backends while already serving; `/ready` reports 503 until they are up.
    // Failures are isolated per backend.
    let startup = {
        let backend_manager = backend_manager.clone();
        let registry = registry.clone();
        let enabled = config.servers.values().filter(|s| s.enabled).count();
        tokio::spawn(async move {
            if enabled == 0 {
                tracing::warn!("No servers enabled. Bridge will start but have no tools.");
                return;
            }
            tracing::info!("Starting {} enabled backend(s)...", enabled);
            let ready = backend_manager.start_enabled(&registry).await;
            tracing::info!(
                "{}/{} backend(s) ready with {} tool(s)",
                ready,
                enabled,
                registry.snapshot().len()
            );
        })
    };

    // Wait for shutdown signal
    shutdown_signal(ct).await;

    // Reject new calls, then fail in-flight ones by stopping every backend.
    router.begin_shutdown();
    startup.abort();
    backend_manager.shutdown_all().await;
    let closed = sessions.close_all();
    tracing::info!(closed, "closed sessions");

    if let Err(e) = server.await {
        tracing::warn!(error = %e, "http server task failed");
    }
    if let Err(e) = sweeper.await {
        tracing::debug!(error = %e, "session sweeper task failed");
    }

    tracing::info!("Bridge shut down gracefully");
    Ok(())
}

fn register_backends_from_config(
    backend_manager: &BackendManager,
    settings: &BridgeSettings,
    servers: BTreeMap<String, ServerDefinition>,
    events_tx: &mpsc::UnboundedSender<BackendEvent>,
) {
    for (id, def) in servers {
        tracing::debug!(enabled = def.enabled, "Creating stdio backend: {}", id);
        let backend = Arc::new(StdioBackend::new(
            def,
            StdioBackendSettings {
                startup_timeout: settings.startup_timeout_duration(),
                secret_timeout: SECRET_COMMAND_TIMEOUT,
                events: Some(events_tx.clone()),
            },
        ));
        backend_manager.add_backend(backend);
    }
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection
    let is_tty = stdout().is_terminal();

    if is_tty {
        // Human-readable format for development
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        // JSON format for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT), then stop the HTTP server.
async fn shutdown_signal(ct: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Cancel the HTTP server
    ct.cancel();
}
