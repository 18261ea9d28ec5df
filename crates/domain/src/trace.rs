use serde::Serialize;

/// Structured trace events emitted across all ChainAgent crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    AgentCreated {
        agent_name: String,
        context: String,
        replayed_events: usize,
    },
    TurnStarted {
        agent_name: String,
        turn_number: u64,
        trigger_event_id: String,
        message_count: usize,
    },
    TurnCompleted {
        agent_name: String,
        turn_number: u64,
        duration_ms: u64,
    },
    TurnInterrupted {
        agent_name: String,
        turn_number: u64,
        reason: String,
    },
    TurnFailed {
        agent_name: String,
        turn_number: u64,
        error: String,
    },
    StoreAppend {
        context: String,
        events: usize,
    },
    StoreLoaded {
        context: String,
        events: usize,
    },
    SessionEnded {
        agent_name: String,
        total_events: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ca_event");
    }
}
