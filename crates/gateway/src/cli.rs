//! Command-line interface.
//!
//! `serve` runs the HTTP server; `send` reuses the same runtime
//! in-process for non-interactive callers: submit one message, stream the
//! resulting events to stdout as JSON lines, and exit.  The remaining
//! subcommands inspect configuration and persisted logs without starting
//! a server.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ca_domain::config::{Config, ConfigSeverity};
use ca_domain::event::{context_name, EventPayload};
use ca_runtime::{AgentRegistry, EchoExecutor, TurnOptions};
use ca_store::{EventStore, FsEventStore};

#[derive(Debug, Parser)]
#[command(name = "chainagent", about = "Event-sourced conversational agent runtime")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "CHAINAGENT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Submit one message in-process and stream the resulting events to
    /// stdout, one JSON object per line.
    Send {
        /// Agent name.
        agent: String,
        /// User message content.
        message: String,
        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// List agents with a persisted log in the data directory.
    Agents {
        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print an agent's persisted event log, one JSON object per line.
    Log {
        /// Agent name.
        agent: String,
        /// Override the configured data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse and validate the config, printing any issues.
    Validate,
    /// Dump the resolved config (with all defaults filled in) as TOML.
    Show,
}

/// Load the config honoring `--config` / `CHAINAGENT_CONFIG`.  Returns
/// the config and a human-readable description of where it came from.
pub fn load_config(cli: &Cli) -> anyhow::Result<(Config, String)> {
    let source = match &cli.config {
        Some(path) => path.display().to_string(),
        None if Path::new("chainagent.toml").exists() => "chainagent.toml".to_owned(),
        None => "built-in defaults".to_owned(),
    };
    let config = Config::load(cli.config.as_deref()).context("loading config")?;
    Ok((config, source))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// config validate / show
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Print any config issues.  Returns `true` when no errors were found.
pub fn config_validate(config: &Config, source: &str) -> bool {
    let issues = config.validate();

    if issues.is_empty() {
        println!("Config OK ({source})");
        return true;
    }

    let error_count = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }

    println!("\n{error_count} error(s), {warning_count} warning(s) in {source}");

    error_count == 0
}

/// Dump the resolved config as TOML.
pub fn config_show(config: &Config) -> anyhow::Result<()> {
    let output = toml::to_string_pretty(config).context("serializing config")?;
    print!("{output}");
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// agents / log — offline store inspection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn open_store(config: &Config, data_dir: Option<PathBuf>) -> anyhow::Result<FsEventStore> {
    let data_dir = data_dir.unwrap_or_else(|| config.storage.data_dir.clone());
    FsEventStore::new(data_dir).context("opening event store")
}

/// Print every context with a persisted log.
pub fn list_contexts(config: &Config, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(config, data_dir)?;
    for context in store.list().context("listing contexts")? {
        println!("{context}");
    }
    Ok(())
}

/// Print an agent's persisted log as JSON lines.
pub fn dump_log(config: &Config, agent: &str, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let store = open_store(config, data_dir)?;
    let context = context_name(agent);
    anyhow::ensure!(store.exists(&context), "no persisted log for '{agent}'");
    for event in store.load(&context).context("loading log")? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// send — the in-process one-shot flow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run the one-shot send flow.  Returns the process exit code: non-zero
/// when the triggered turn failed.
pub async fn send_once(
    config: &Config,
    agent_name: &str,
    message: &str,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<i32> {
    let store = Arc::new(open_store(config, data_dir)?);
    let registry = AgentRegistry::new(
        store,
        Arc::new(EchoExecutor),
        TurnOptions::from_config(&config.turn),
        config.llm.clone(),
    );

    let agent = registry
        .get_or_create(agent_name)
        .await
        .context("creating agent")?;

    let (snapshot, mut subscription) = agent.subscribe_with_replay();
    let submitted = agent
        .add_event_tracked(
            EventPayload::UserMessage {
                content: message.to_owned(),
                images: None,
            },
            true,
        )
        .finalized()
        .await
        .context("agent session ended before the message was processed")?;
    let trigger_counter = submitted.counter().unwrap_or(0);

    for event in &snapshot {
        println!("{}", serde_json::to_string(event)?);
    }

    let mut own_turn_started = false;
    let mut failed = false;
    while let Some(event) = subscription.recv().await {
        println!("{}", serde_json::to_string(&event)?);

        let after_submission = event.counter().is_some_and(|c| c > trigger_counter);
        if after_submission && matches!(event.payload, EventPayload::AgentTurnStarted { .. }) {
            own_turn_started = true;
        }
        if matches!(event.payload, EventPayload::SessionEnded) {
            break;
        }
        if own_turn_started && after_submission && event.payload.is_turn_terminal() {
            failed = matches!(event.payload, EventPayload::AgentTurnFailed { .. });
            break;
        }
    }

    // Close the session so the log gets its bookend.
    registry.shutdown_all().await;

    Ok(if failed { 1 } else { 0 })
}
