pub mod config;
pub mod error;
pub mod event;
pub mod reducer;
pub mod trace;

pub use config::{Config, ConfigIssue, ConfigSeverity};
pub use error::{Error, Result};
pub use event::{AgentEvent, EventPayload, InterruptReason, LlmConfig};
pub use reducer::{ChatMessage, ReducedState, Role};
