/// Shared error type used across all ChainAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Store(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent session has ended: {0}")]
    AgentClosed(String),

    #[error("executor: {0}")]
    Executor(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
