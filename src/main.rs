// dbtools-mcp entry point
// Loads sources, starts the idle sweeper and serves MCP on stdio until EOF or Ctrl-C

use anyhow::{bail, Context};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dbtools_mcp_lib::cli::Cli;
use dbtools_mcp_lib::config::SourceCatalog;
use dbtools_mcp_lib::db::{spawn_idle_sweeper, ConnectionRegistry, EngineFactory};
use dbtools_mcp_lib::server::McpServer;
use dbtools_mcp_lib::tools::ToolService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout carries the protocol, so logs go to stderr
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid --log-level filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config_path = cli.config.clone().or_else(SourceCatalog::discover);
    let catalog = match &config_path {
        Some(path) => SourceCatalog::load(path)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?,
        None if cli.validate_config => bail!("no configuration file found"),
        None => {
            warn!("No configuration file found, starting with no sources");
            SourceCatalog::empty()
        }
    };
    let catalog = Arc::new(catalog);

    if cli.validate_config {
        let summary = catalog.summary().await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        let problems = catalog.validate().await;
        if !problems.is_empty() {
            for problem in &problems {
                eprintln!("error: {}", problem);
            }
            bail!("configuration has {} problem(s)", problems.len());
        }
        return Ok(());
    }

    let summary = catalog.summary().await;
    info!(
        config = ?summary.config_file,
        sources = summary.sources_count,
        "Configuration loaded"
    );

    let factory = Arc::new(EngineFactory::with_default_engines());
    let registry = Arc::new(ConnectionRegistry::new(factory));
    let tools = Arc::new(ToolService::new(Arc::clone(&catalog), Arc::clone(&registry)));
    let server = Arc::new(McpServer::new(tools));

    let sweeper = spawn_idle_sweeper(Arc::clone(&registry), cli.sweep_interval(), cli.max_idle_hours);
    let reloader = spawn_reload_on_hangup(Arc::clone(&catalog));

    info!("Serving MCP on stdio");
    let (outcome, interrupted) = tokio::select! {
        served = server.serve_stdio() => (served.context("stdio transport failed"), false),
        signal = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            (signal.context("failed to listen for Ctrl-C"), true)
        }
    };

    sweeper.abort();
    if let Some(reloader) = reloader {
        reloader.abort();
    }
    let closed = registry.close_all().await;
    info!(closed, "Shutdown complete");

    if interrupted && outcome.is_ok() {
        // The blocking stdin reader would keep the runtime from shutting down
        std::process::exit(0);
    }
    outcome
}

/// Re-read the configuration file on SIGHUP
#[cfg(unix)]
fn spawn_reload_on_hangup(catalog: Arc<SourceCatalog>) -> Option<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGHUP reload disabled: {}", e);
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match catalog.reload().await {
                Ok(count) => info!(sources = count, "Configuration reloaded"),
                Err(e) => warn!("Configuration reload failed: {}", e),
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_catalog: Arc<SourceCatalog>) -> Option<tokio::task::JoinHandle<()>> {
    None
}
