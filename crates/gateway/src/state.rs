use std::sync::Arc;

use ca_domain::config::Config;
use ca_runtime::AgentRegistry;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<AgentRegistry>,
}
