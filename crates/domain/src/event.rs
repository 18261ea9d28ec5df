//! The event model — every significant occurrence in an agent's life is an
//! immutable, tagged, chained record.
//!
//! Events form a single linear history per agent: `parent_event_id` of each
//! event equals the `id` of the previous one, unconditionally, across turn
//! and session boundaries.  Ids are `"{contextName}:{counter}"` with the
//! counter zero-padded to 4 digits and assigned by the agent's processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The persistence key for an agent (`"{agentName}-v1"`).
pub fn context_name(agent_name: &str) -> String {
    format!("{agent_name}-v1")
}

/// Format an event id: `"{context}:{counter}"`, counter padded to 4 digits.
/// Counters ≥ 10000 print at natural width.
pub fn format_event_id(context: &str, counter: u64) -> String {
    format!("{context}:{counter:04}")
}

/// Parse the counter out of an event id.  Returns `None` when the id does
/// not end in `:<digits>`.
pub fn event_counter(id: &str) -> Option<u64> {
    id.rsplit(':').next()?.parse().ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Provider addressing for the turn executor.  Latest `SetLlmConfigEvent`
/// wins in the reduced state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub api_format: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env_var: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Interrupt reasons
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why an open turn was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    UserCancel,
    UserNewMessage,
    Timeout,
    SessionEnded,
}

impl InterruptReason {
    /// Wire-format spelling (`"user_cancel"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserCancel => "user_cancel",
            Self::UserNewMessage => "user_new_message",
            Self::Timeout => "timeout",
            Self::SessionEnded => "session_ended",
        }
    }
}

impl std::fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event payloads
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The tagged variant of an event.  The set is closed; the `"_tag"`
/// discriminator on the wire is `"<Variant>Event"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag")]
pub enum EventPayload {
    #[serde(rename = "SystemPromptEvent")]
    SystemPrompt { content: String },

    #[serde(rename = "UserMessageEvent")]
    UserMessage {
        content: String,
        /// Data-URI or URL image attachments, preserved opaquely.
        #[serde(skip_serializing_if = "Option::is_none")]
        images: Option<Vec<String>>,
    },

    /// The final assistant message of a turn (full text).
    #[serde(rename = "AssistantMessageEvent")]
    AssistantMessage { content: String },

    /// Incremental assistant text.  Ephemeral: broadcast and kept in the
    /// in-memory log, never persisted.
    #[serde(rename = "TextDeltaEvent")]
    TextDelta { delta: String },

    #[serde(rename = "SetLlmConfigEvent")]
    SetLlmConfig(LlmConfig),

    #[serde(rename = "SessionStartedEvent")]
    SessionStarted,

    #[serde(rename = "SessionEndedEvent")]
    SessionEnded,

    #[serde(rename = "AgentTurnStartedEvent", rename_all = "camelCase")]
    AgentTurnStarted { turn_number: u64 },

    #[serde(rename = "AgentTurnCompletedEvent", rename_all = "camelCase")]
    AgentTurnCompleted { turn_number: u64, duration_ms: u64 },

    #[serde(rename = "AgentTurnInterruptedEvent", rename_all = "camelCase")]
    AgentTurnInterrupted {
        turn_number: u64,
        reason: InterruptReason,
        /// Concatenation of the deltas the turn emitted before the
        /// interrupt; `Some` iff at least one delta was emitted.
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_response: Option<String>,
        /// Id of the triggering event that displaced the turn
        /// (`user_new_message` only).
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupted_by_event_id: Option<String>,
    },

    #[serde(rename = "AgentTurnFailedEvent", rename_all = "camelCase")]
    AgentTurnFailed { turn_number: u64, error: String },
}

impl EventPayload {
    /// Wire-format discriminator (`"UserMessageEvent"`, ...).
    pub fn tag(&self) -> &'static str {
        match self {
            Self::SystemPrompt { .. } => "SystemPromptEvent",
            Self::UserMessage { .. } => "UserMessageEvent",
            Self::AssistantMessage { .. } => "AssistantMessageEvent",
            Self::TextDelta { .. } => "TextDeltaEvent",
            Self::SetLlmConfig(_) => "SetLlmConfigEvent",
            Self::SessionStarted => "SessionStartedEvent",
            Self::SessionEnded => "SessionEndedEvent",
            Self::AgentTurnStarted { .. } => "AgentTurnStartedEvent",
            Self::AgentTurnCompleted { .. } => "AgentTurnCompletedEvent",
            Self::AgentTurnInterrupted { .. } => "AgentTurnInterruptedEvent",
            Self::AgentTurnFailed { .. } => "AgentTurnFailedEvent",
        }
    }

    /// Ephemeral payloads are broadcast but never persisted.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::TextDelta { .. })
    }

    /// Terminal events of a turn: completed, failed, or interrupted.
    pub fn is_turn_terminal(&self) -> bool {
        matches!(
            self,
            Self::AgentTurnCompleted { .. }
                | Self::AgentTurnFailed { .. }
                | Self::AgentTurnInterrupted { .. }
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A finalized, chained event.  `parent_event_id` is absent only for the
/// first event ever appended to the agent's log (genesis); on the wire the
/// field is omitted entirely when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "agentName")]
    pub agent_name: String,
    #[serde(rename = "parentEventId", skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(rename = "triggersAgentTurn")]
    pub triggers_agent_turn: bool,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    /// The counter component of this event's id.
    pub fn counter(&self) -> Option<u64> {
        event_counter(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn event(payload: EventPayload, counter: u64, parent: Option<&str>) -> AgentEvent {
        AgentEvent {
            id: format_event_id("a-v1", counter),
            timestamp: ts(),
            agent_name: "a".into(),
            parent_event_id: parent.map(String::from),
            triggers_agent_turn: matches!(payload, EventPayload::UserMessage { .. }),
            payload,
        }
    }

    #[test]
    fn id_formatting_pads_to_four_digits() {
        assert_eq!(format_event_id("a-v1", 0), "a-v1:0000");
        assert_eq!(format_event_id("a-v1", 42), "a-v1:0042");
        assert_eq!(format_event_id("a-v1", 9999), "a-v1:9999");
        assert_eq!(format_event_id("a-v1", 10000), "a-v1:10000");
    }

    #[test]
    fn counter_parses_back() {
        assert_eq!(event_counter("a-v1:0007"), Some(7));
        assert_eq!(event_counter("agent:with:colons:0123"), Some(123));
        assert_eq!(event_counter("nodigits"), None);
    }

    #[test]
    fn genesis_omits_parent_field() {
        let e = event(EventPayload::SessionStarted, 0, None);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["_tag"], "SessionStartedEvent");
        assert!(
            !json.as_object().unwrap().contains_key("parentEventId"),
            "absent parent must be omitted, not wrapped"
        );
    }

    #[test]
    fn chained_event_carries_parent() {
        let e = event(
            EventPayload::UserMessage {
                content: "hi".into(),
                images: None,
            },
            1,
            Some("a-v1:0000"),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["parentEventId"], "a-v1:0000");
        assert_eq!(json["triggersAgentTurn"], true);
        assert_eq!(json["agentName"], "a");
        assert!(!json.as_object().unwrap().contains_key("images"));
    }

    #[test]
    fn interrupted_wire_shape() {
        let e = event(
            EventPayload::AgentTurnInterrupted {
                turn_number: 1,
                reason: InterruptReason::UserNewMessage,
                partial_response: Some("Once upon".into()),
                interrupted_by_event_id: Some("a-v1:0005".into()),
            },
            6,
            Some("a-v1:0005"),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["_tag"], "AgentTurnInterruptedEvent");
        assert_eq!(json["reason"], "user_new_message");
        assert_eq!(json["partialResponse"], "Once upon");
        assert_eq!(json["interruptedByEventId"], "a-v1:0005");
        assert_eq!(json["turnNumber"], 1);
    }

    #[test]
    fn set_llm_config_wire_shape() {
        let e = event(
            EventPayload::SetLlmConfig(LlmConfig {
                api_format: "openai".into(),
                model: "gpt-4o".into(),
                base_url: Some("http://localhost:8080/v1".into()),
                api_key_env_var: None,
            }),
            2,
            Some("a-v1:0001"),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["_tag"], "SetLlmConfigEvent");
        assert_eq!(json["apiFormat"], "openai");
        assert_eq!(json["baseUrl"], "http://localhost:8080/v1");
        assert!(!json.as_object().unwrap().contains_key("apiKeyEnvVar"));
    }

    #[test]
    fn round_trip_every_variant() {
        let payloads = vec![
            EventPayload::SystemPrompt {
                content: "be terse".into(),
            },
            EventPayload::UserMessage {
                content: "hello".into(),
                images: Some(vec!["data:image/png;base64,AAAA".into()]),
            },
            EventPayload::AssistantMessage {
                content: "hi".into(),
            },
            EventPayload::TextDelta { delta: "h".into() },
            EventPayload::SetLlmConfig(LlmConfig {
                api_format: "anthropic".into(),
                model: "claude".into(),
                base_url: None,
                api_key_env_var: Some("ANTHROPIC_API_KEY".into()),
            }),
            EventPayload::SessionStarted,
            EventPayload::SessionEnded,
            EventPayload::AgentTurnStarted { turn_number: 3 },
            EventPayload::AgentTurnCompleted {
                turn_number: 3,
                duration_ms: 1200,
            },
            EventPayload::AgentTurnInterrupted {
                turn_number: 4,
                reason: InterruptReason::Timeout,
                partial_response: None,
                interrupted_by_event_id: None,
            },
            EventPayload::AgentTurnFailed {
                turn_number: 5,
                error: "boom".into(),
            },
        ];

        for (i, payload) in payloads.into_iter().enumerate() {
            let parent = if i == 0 { None } else { Some("a-v1:0000") };
            let original = event(payload, i as u64, parent);
            let json = serde_json::to_string(&original).unwrap();
            let decoded: AgentEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(decoded, original, "round trip must be exact: {json}");
        }
    }

    #[test]
    fn tag_matches_serialized_discriminator() {
        let e = event(
            EventPayload::AgentTurnFailed {
                turn_number: 1,
                error: "x".into(),
            },
            1,
            Some("a-v1:0000"),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["_tag"], e.payload.tag());
    }

    #[test]
    fn only_text_delta_is_ephemeral() {
        assert!(EventPayload::TextDelta { delta: "x".into() }.is_ephemeral());
        assert!(!EventPayload::SessionStarted.is_ephemeral());
        assert!(!EventPayload::AssistantMessage {
            content: "x".into()
        }
        .is_ephemeral());
    }
}
