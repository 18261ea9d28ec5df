//! Pure state derivation — fold the event log into a [`ReducedState`].
//!
//! No I/O.  Reducing a sequence in any batching yields the same final
//! state as reducing one event at a time.

use serde::Serialize;

use crate::event::{AgentEvent, EventPayload, LlmConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One projected conversation message.  Consecutive same-role messages are
/// kept as-is; merging is a display concern.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Image attachments from `UserMessageEvent`s, preserved opaquely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            images: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            images: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ReducedState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The current projection of an agent's event log.  Derived only, never
/// stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedState {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
    /// Count of events reduced so far; the counter the processor assigns
    /// to the next event.
    pub next_event_number: u64,
    /// Count of completed or failed turns.
    pub current_turn_number: u64,
    /// `Some(id)` between an `AgentTurnStartedEvent` and its matching
    /// terminal event; `None` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_turn_started_at_event_id: Option<String>,
}

impl ReducedState {
    pub fn is_turn_in_progress(&self) -> bool {
        self.agent_turn_started_at_event_id.is_some()
    }

    /// Fold a single event into the state.
    pub fn apply(&mut self, event: &AgentEvent) {
        match &event.payload {
            EventPayload::SystemPrompt { content } => {
                self.messages.push(ChatMessage::system(content.clone()));
            }
            EventPayload::UserMessage { content, images } => {
                self.messages.push(ChatMessage {
                    role: Role::User,
                    content: content.clone(),
                    images: images.clone(),
                });
            }
            EventPayload::AssistantMessage { content } => {
                self.messages.push(ChatMessage::assistant(content.clone()));
            }
            EventPayload::SetLlmConfig(config) => {
                self.llm_config = Some(config.clone());
            }
            EventPayload::AgentTurnStarted { .. } => {
                self.agent_turn_started_at_event_id = Some(event.id.clone());
            }
            EventPayload::AgentTurnCompleted { .. } | EventPayload::AgentTurnFailed { .. } => {
                self.agent_turn_started_at_event_id = None;
                self.current_turn_number += 1;
            }
            EventPayload::AgentTurnInterrupted { .. } => {
                self.agent_turn_started_at_event_id = None;
            }
            EventPayload::TextDelta { .. }
            | EventPayload::SessionStarted
            | EventPayload::SessionEnded => {}
        }
        self.next_event_number += 1;
    }

    /// Fold a batch of events, left to right.
    pub fn reduce(mut self, events: &[AgentEvent]) -> Self {
        for event in events {
            self.apply(event);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{format_event_id, InterruptReason};
    use chrono::{TimeZone, Utc};

    fn event(counter: u64, payload: EventPayload) -> AgentEvent {
        AgentEvent {
            id: format_event_id("a-v1", counter),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            agent_name: "a".into(),
            parent_event_id: (counter > 0).then(|| format_event_id("a-v1", counter - 1)),
            triggers_agent_turn: false,
            payload,
        }
    }

    fn conversation() -> Vec<AgentEvent> {
        vec![
            event(0, EventPayload::SessionStarted),
            event(
                1,
                EventPayload::SystemPrompt {
                    content: "be brief".into(),
                },
            ),
            event(
                2,
                EventPayload::UserMessage {
                    content: "hi".into(),
                    images: None,
                },
            ),
            event(3, EventPayload::AgentTurnStarted { turn_number: 1 }),
            event(4, EventPayload::TextDelta { delta: "he".into() }),
            event(5, EventPayload::TextDelta { delta: "llo".into() }),
            event(
                6,
                EventPayload::AssistantMessage {
                    content: "hello".into(),
                },
            ),
            event(
                7,
                EventPayload::AgentTurnCompleted {
                    turn_number: 1,
                    duration_ms: 50,
                },
            ),
        ]
    }

    #[test]
    fn projects_messages_in_log_order() {
        let state = ReducedState::default().reduce(&conversation());
        assert_eq!(
            state.messages,
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ]
        );
        assert_eq!(state.next_event_number, 8);
        assert_eq!(state.current_turn_number, 1);
        assert!(!state.is_turn_in_progress());
    }

    #[test]
    fn every_variant_counts_toward_next_event_number() {
        let events = vec![
            event(0, EventPayload::SessionStarted),
            event(1, EventPayload::TextDelta { delta: "x".into() }),
            event(2, EventPayload::SessionEnded),
        ];
        let state = ReducedState::default().reduce(&events);
        assert_eq!(state.next_event_number, 3);
        assert!(state.messages.is_empty());
    }

    #[test]
    fn batching_is_immaterial() {
        let events = conversation();
        let all_at_once = ReducedState::default().reduce(&events);

        let mut one_by_one = ReducedState::default();
        for e in &events {
            one_by_one.apply(e);
        }
        assert_eq!(all_at_once, one_by_one);

        let split = ReducedState::default()
            .reduce(&events[..3])
            .reduce(&events[3..]);
        assert_eq!(all_at_once, split);
    }

    #[test]
    fn turn_marker_tracks_open_turn() {
        let mut state = ReducedState::default();
        state.apply(&event(0, EventPayload::AgentTurnStarted { turn_number: 1 }));
        assert_eq!(
            state.agent_turn_started_at_event_id.as_deref(),
            Some("a-v1:0000")
        );
        assert!(state.is_turn_in_progress());

        state.apply(&event(
            1,
            EventPayload::AgentTurnInterrupted {
                turn_number: 1,
                reason: InterruptReason::UserCancel,
                partial_response: None,
                interrupted_by_event_id: None,
            },
        ));
        assert!(!state.is_turn_in_progress());
        // Interrupted turns do not advance the turn counter.
        assert_eq!(state.current_turn_number, 0);
    }

    #[test]
    fn failed_turn_advances_turn_counter() {
        let mut state = ReducedState::default();
        state.apply(&event(0, EventPayload::AgentTurnStarted { turn_number: 1 }));
        state.apply(&event(
            1,
            EventPayload::AgentTurnFailed {
                turn_number: 1,
                error: "boom".into(),
            },
        ));
        assert_eq!(state.current_turn_number, 1);
        assert!(!state.is_turn_in_progress());
    }

    #[test]
    fn latest_llm_config_wins() {
        let cfg = |model: &str| {
            EventPayload::SetLlmConfig(LlmConfig {
                api_format: "openai".into(),
                model: model.into(),
                base_url: None,
                api_key_env_var: None,
            })
        };
        let state = ReducedState::default().reduce(&[event(0, cfg("gpt-4o")), event(1, cfg("o3"))]);
        assert_eq!(state.llm_config.unwrap().model, "o3");
    }

    #[test]
    fn consecutive_same_role_messages_are_kept() {
        let events = vec![
            event(
                0,
                EventPayload::UserMessage {
                    content: "one".into(),
                    images: None,
                },
            ),
            event(
                1,
                EventPayload::UserMessage {
                    content: "two".into(),
                    images: None,
                },
            ),
        ];
        let state = ReducedState::default().reduce(&events);
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn user_images_preserved_opaquely() {
        let state = ReducedState::default().reduce(&[event(
            0,
            EventPayload::UserMessage {
                content: "look".into(),
                images: Some(vec!["https://example.com/cat.png".into()]),
            },
        )]);
        assert_eq!(
            state.messages[0].images.as_deref(),
            Some(&["https://example.com/cat.png".to_string()][..])
        );
    }
}
