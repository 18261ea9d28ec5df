//! Service configuration, loaded from a TOML file.
//!
//! Every field has a default so a missing file yields a runnable dev
//! config (in-process data dir, 100 ms debounce, no turn deadline).

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::LlmConfig;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    /// Provider addressing emitted as a `SetLlmConfigEvent` when an agent
    /// is brought up.  Absent = agents run without a configured provider
    /// until a client sets one.
    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}

fn d_port() -> u16 {
    8790
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one event-log file per context.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
        }
    }
}

fn d_data_dir() -> PathBuf {
    PathBuf::from("./data/events")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Burst window for triggering events: a burst within this window
    /// results in exactly one turn, started by the last event.
    #[serde(default = "d_debounce_ms")]
    pub debounce_ms: u64,
    /// Optional deadline for a single turn.  On expiry the turn is
    /// interrupted with reason `timeout`.  Absent = unbounded.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            debounce_ms: d_debounce_ms(),
            timeout_ms: None,
        }
    }
}

fn d_debounce_ms() -> u64 {
    100
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load a config file.  An explicit path that does not exist is an
    /// error; with no path, `chainagent.toml` in the working directory is
    /// used when present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => {
                let fallback = PathBuf::from("chainagent.toml");
                if !fallback.exists() {
                    return Ok(Self::default());
                }
                fallback
            }
        };

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(config)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.storage.data_dir.as_os_str().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "storage.data_dir".into(),
                message: "data_dir must not be empty".into(),
            });
        }

        if self.turn.debounce_ms == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "turn.debounce_ms".into(),
                message: "debounce of 0 starts a turn for every triggering event in a burst".into(),
            });
        }

        if let Some(timeout) = self.turn.timeout_ms {
            if timeout <= self.turn.debounce_ms {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: "turn.timeout_ms".into(),
                    message: format!(
                        "turn deadline ({timeout} ms) is not greater than the debounce window \
                         ({} ms); turns will time out immediately",
                        self.turn.debounce_ms
                    ),
                });
            }
        }

        if let Some(llm) = &self.llm {
            if llm.model.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "llm.model".into(),
                    message: "model must not be empty".into(),
                });
            }
            if let Some(url) = &llm.base_url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: "llm.baseUrl".into(),
                        message: format!(
                            "base_url must start with http:// or https:// (got \"{url}\")"
                        ),
                    });
                }
            }
        }

        issues
    }
}
