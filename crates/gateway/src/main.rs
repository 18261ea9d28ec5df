use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ca_domain::config::{Config, ConfigSeverity};
use ca_gateway::api;
use ca_gateway::cli::{self, load_config, send_once, Cli, Command, ConfigCommand};
use ca_gateway::state::AppState;
use ca_runtime::{AgentRegistry, EchoExecutor, TurnOptions};
use ca_store::FsEventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _source) = load_config(&cli)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Send {
            ref agent,
            ref message,
            ref data_dir,
        }) => {
            // Keep stdout clean for the event stream.
            init_stderr_tracing();
            let (config, _source) = load_config(&cli)?;
            let code = send_once(&config, agent, message, data_dir.clone()).await?;
            std::process::exit(code);
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, source) = load_config(&cli)?;
            if !cli::config_validate(&config, &source) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _source) = load_config(&cli)?;
            cli::config_show(&config)
        }
        Some(Command::Agents { ref data_dir }) => {
            init_stderr_tracing();
            let (config, _source) = load_config(&cli)?;
            cli::list_contexts(&config, data_dir.clone())
        }
        Some(Command::Log {
            ref agent,
            ref data_dir,
        }) => {
            init_stderr_tracing();
            let (config, _source) = load_config(&cli)?;
            cli::dump_log(&config, agent, data_dir.clone())
        }
        Some(Command::Version) => {
            println!("chainagent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ca_gateway=debug")),
        )
        .json()
        .init();
}

fn init_stderr_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Start the server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("ChainAgent starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Event store ──────────────────────────────────────────────────
    let store = Arc::new(
        FsEventStore::new(config.storage.data_dir.clone()).context("opening event store")?,
    );

    // ── Registry ─────────────────────────────────────────────────────
    // Provider integrations plug in behind TurnExecutor; the built-in
    // echo executor keeps the server runnable without one.
    let registry = Arc::new(AgentRegistry::new(
        store,
        Arc::new(EchoExecutor),
        TurnOptions::from_config(&config.turn),
        config.llm.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        registry: registry.clone(),
    };

    // ── HTTP server ──────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // ── Teardown ─────────────────────────────────────────────────────
    registry.shutdown_all().await;
    tracing::info!("ChainAgent stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
