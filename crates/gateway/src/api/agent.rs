//! Agent API endpoints — the primary interface for driving agents.
//!
//! - `POST /agent/:name`            — submit a user message, stream the log as SSE
//! - `GET  /agent/:name/events`     — live event stream (SSE)
//! - `GET  /agent/:name/state`      — reduced-state snapshot
//! - `GET  /agent/:name/log`        — full event-log snapshot
//! - `POST /agent/:name/interrupt`  — cancel the open turn
//! - `POST /agent/:name/end`        — end the session, drop from the registry
//! - `GET  /agents`                 — list cached agents

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::Deserialize;

use ca_domain::event::{AgentEvent, EventPayload};
use ca_domain::Error;
use ca_runtime::{AgentHandle, EventSubscription};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn registry_error(e: Error) -> Response {
    match e {
        Error::AgentNotFound(name) => {
            api_error(StatusCode::NOT_FOUND, format!("agent not found: {name}"))
        }
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// One SSE frame carrying an event as JSON.
fn frame(event: &AgentEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            // Unreachable for well-formed events; keep the stream alive.
            tracing::error!(id = %event.id, error = %e, "event serialization failed");
            Event::default().data("{}")
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /agent/:name
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client-submitted events.  Anything else in `_tag` is a 400.
#[derive(Debug, Deserialize)]
#[serde(tag = "_tag")]
enum ClientEvent {
    #[serde(rename = "UserMessageEvent")]
    UserMessage {
        content: String,
        #[serde(default)]
        images: Option<Vec<String>>,
    },
}

#[derive(Debug, Deserialize)]
pub struct PostQuery {
    /// When present, keep the response open until the agent has been idle
    /// for this many milliseconds, instead of closing at the turn's
    /// terminal event.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
}

/// Submit a user message and stream the full chronological event log —
/// existing events first, then everything produced by this submission up
/// to the triggered turn's terminal event.
///
/// Turn failures surface as `AgentTurnFailedEvent` frames, not HTTP
/// errors; only invalid input is rejected up front.
pub async fn post_message(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PostQuery>,
    body: String,
) -> Response {
    if body.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "empty body");
    }
    let ClientEvent::UserMessage { content, images } = match serde_json::from_str(&body) {
        Ok(event) => event,
        Err(e) => {
            return api_error(StatusCode::BAD_REQUEST, format!("invalid body: {e}"));
        }
    };

    let agent = match state.registry.get_or_create(&name).await {
        Ok(agent) => agent,
        Err(e) => return registry_error(e),
    };

    // Subscribe before submitting so nothing between the snapshot and the
    // live stream is lost.
    let (snapshot, subscription) = agent.subscribe_with_replay();
    let submitted = agent
        .add_event_tracked(EventPayload::UserMessage { content, images }, true)
        .finalized()
        .await;
    let Some(submitted) = submitted else {
        return api_error(StatusCode::CONFLICT, "agent session has ended");
    };

    let trigger_counter = submitted.counter().unwrap_or(0);
    let idle_window = query.idle_timeout.map(Duration::from_millis);
    let stream = post_event_stream(agent, snapshot, subscription, trigger_counter, idle_window);

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Stream the snapshot, then live events.  Without an idle window the
/// stream closes at the first terminal event of a turn that started after
/// the submitted message (an interrupt of a previous turn passes
/// through); with one, it closes once the agent stays idle for the whole
/// window.  `SessionEndedEvent` always closes the stream.
fn post_event_stream(
    agent: AgentHandle,
    snapshot: Vec<AgentEvent>,
    mut subscription: EventSubscription,
    trigger_counter: u64,
    idle_window: Option<Duration>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        for event in &snapshot {
            yield Ok(frame(event));
        }

        let mut own_turn_started = false;
        loop {
            let next = match idle_window {
                Some(window) => match tokio::time::timeout(window, subscription.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        if agent.is_idle() {
                            break;
                        }
                        continue;
                    }
                },
                None => subscription.recv().await,
            };
            let Some(event) = next else { break };

            let after_submission = event.counter().is_some_and(|c| c > trigger_counter);
            let session_ended = matches!(event.payload, EventPayload::SessionEnded);
            if after_submission && matches!(event.payload, EventPayload::AgentTurnStarted { .. }) {
                own_turn_started = true;
            }
            let terminal =
                own_turn_started && after_submission && event.payload.is_turn_terminal();

            yield Ok(frame(&event));

            if session_ended || (idle_window.is_none() && terminal) {
                break;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent/:name/events (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subscribe to an agent's stream: existing events are flushed first,
/// then live events, until the `SessionEndedEvent` closes the response.
/// Addressing an unknown name brings the agent up.
pub async fn events_sse(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let agent = match state.registry.get_or_create(&name).await {
        Ok(agent) => agent,
        Err(e) => return registry_error(e),
    };

    let (snapshot, subscription) = agent.subscribe_with_replay();
    let stream = async_stream::stream! {
        for event in &snapshot {
            yield Ok::<_, Infallible>(frame(event));
        }
        let mut subscription = subscription;
        while let Some(event) = subscription.recv().await {
            yield Ok(frame(&event));
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Introspection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counts and booleans describing the reduced state.
pub async fn get_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let agent = match state.registry.get(&name) {
        Ok(agent) => agent,
        Err(e) => return registry_error(e),
    };
    let reduced = agent.state();
    Json(serde_json::json!({
        "agentName": name,
        "nextEventNumber": reduced.next_event_number,
        "currentTurnNumber": reduced.current_turn_number,
        "messageCount": reduced.messages.len(),
        "isTurnInProgress": reduced.is_turn_in_progress(),
        "hasLlmConfig": reduced.llm_config.is_some(),
    }))
    .into_response()
}

/// Full event-log snapshot (includes in-memory deltas).
pub async fn get_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let agent = match state.registry.get(&name) {
        Ok(agent) => agent,
        Err(e) => return registry_error(e),
    };
    Json(agent.log_snapshot()).into_response()
}

/// Names of all cached agents.
pub async fn list_agents(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({ "agents": state.registry.list() })).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Interrupt the open turn.  `interrupted` reports whether a turn was
/// open when the request arrived.
pub async fn interrupt(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    let agent = match state.registry.get(&name) {
        Ok(agent) => agent,
        Err(e) => return registry_error(e),
    };
    let was_running = !agent.is_idle();
    agent.interrupt_turn();
    Json(serde_json::json!({ "interrupted": was_running })).into_response()
}

/// End the agent's session and drop it from the registry.  Ending an
/// unknown agent reports `ended: false` rather than failing, so the call
/// is safe to repeat.
pub async fn end_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.registry.shutdown_agent(&name).await {
        Ok(()) => Json(serde_json::json!({ "ended": true })).into_response(),
        Err(Error::AgentNotFound(_)) => {
            Json(serde_json::json!({ "ended": false })).into_response()
        }
        Err(e) => registry_error(e),
    }
}
