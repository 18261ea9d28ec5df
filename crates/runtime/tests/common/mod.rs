//! Shared setup for runtime integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;
use std::time::Duration;

use ca_runtime::testing::collect_until;
use ca_runtime::{AgentHandle, AgentRegistry, TurnExecutor, TurnOptions};
use ca_store::EventStore;

use ca_domain::event::{AgentEvent, EventPayload};

/// Short debounce so bursts settle quickly in tests.
pub fn fast_options() -> TurnOptions {
    TurnOptions {
        debounce: Duration::from_millis(20),
        timeout: None,
    }
}

pub fn registry(store: Arc<dyn EventStore>, executor: Arc<dyn TurnExecutor>) -> AgentRegistry {
    AgentRegistry::new(store, executor, fast_options(), None)
}

/// Submit a user message.
pub fn send(agent: &AgentHandle, content: &str) {
    agent.add_event(
        EventPayload::UserMessage {
            content: content.into(),
            images: None,
        },
        true,
    );
}

/// Submit a user message and wait for the turn it triggers to complete.
/// Returns the events from the submitted message through the terminal
/// `AgentTurnCompletedEvent`; anything processed earlier (e.g. bring-up
/// events racing the subscription) is dropped.
pub async fn send_and_complete(agent: &AgentHandle, content: &str) -> Vec<AgentEvent> {
    let mut subscription = agent.subscribe();
    let submitted = agent
        .add_event_tracked(
            EventPayload::UserMessage {
                content: content.into(),
                images: None,
            },
            true,
        )
        .finalized()
        .await
        .expect("agent accepts the message");
    let events = collect_until(&mut subscription, |e| {
        matches!(e.payload, EventPayload::AgentTurnCompleted { .. })
    })
    .await;
    let start = events
        .iter()
        .position(|e| e.id == submitted.id)
        .expect("stream contains the submission");
    events[start..].to_vec()
}

/// The concatenated text of all `TextDeltaEvent`s in a slice.
pub fn delta_text(events: &[AgentEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::TextDelta { delta } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}
