//! Test doubles and helpers for exercising the runtime without a
//! provider: a scripted executor with per-turn playback, and event-stream
//! collection utilities used by the integration suites.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ca_domain::event::AgentEvent;
use ca_domain::{Error, Result};

use crate::agent::EventSubscription;
use crate::executor::{TurnChunk, TurnContext, TurnExecutor, TurnStream};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ScriptedExecutor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One step of a scripted turn.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Delta(&'static str),
    Assistant(&'static str),
    /// Sleep between steps; cancellation drops the stream mid-pause.
    Pause(Duration),
    /// Fail the stream with this message.
    Fail(&'static str),
}

/// Plays back one pre-recorded script per turn, in order.  A turn past
/// the end of the script fails, which keeps a test that under-scripts
/// from hanging.
pub struct ScriptedExecutor {
    turns: Mutex<VecDeque<Vec<ScriptedStep>>>,
}

impl ScriptedExecutor {
    pub fn new(turns: Vec<Vec<ScriptedStep>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    pub fn single(steps: Vec<ScriptedStep>) -> Self {
        Self::new(vec![steps])
    }

    /// A turn that streams `text` as one delta per word, then the full
    /// text as the assistant message.
    pub fn reply(text: &'static str) -> Vec<ScriptedStep> {
        let mut steps: Vec<ScriptedStep> = text
            .split_inclusive(' ')
            .map(ScriptedStep::Delta)
            .collect();
        steps.push(ScriptedStep::Assistant(text));
        steps
    }
}

#[async_trait]
impl TurnExecutor for ScriptedExecutor {
    async fn execute(&self, _ctx: TurnContext, _cancel: CancellationToken) -> Result<TurnStream> {
        let steps = self.turns.lock().pop_front();
        let stream = async_stream::stream! {
            let Some(steps) = steps else {
                yield Err(Error::Executor("no scripted turn left".into()));
                return;
            };
            for step in steps {
                match step {
                    ScriptedStep::Delta(delta) => {
                        yield Ok(TurnChunk::TextDelta {
                            delta: delta.to_string(),
                        });
                    }
                    ScriptedStep::Assistant(content) => {
                        yield Ok(TurnChunk::AssistantMessage {
                            content: content.to_string(),
                        });
                    }
                    ScriptedStep::Pause(duration) => tokio::time::sleep(duration).await,
                    ScriptedStep::Fail(message) => {
                        yield Err(Error::Executor(message.to_string()));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream collection helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Default wait for any single expected event in tests.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Collect events until one matches `pred` (inclusive).  Panics when the
/// stream ends or `EVENT_WAIT` passes first.
pub async fn collect_until(
    subscription: &mut EventSubscription,
    pred: impl Fn(&AgentEvent) -> bool,
) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    let result = tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match subscription.recv().await {
                Some(event) => {
                    let hit = pred(&event);
                    events.push(event);
                    if hit {
                        return true;
                    }
                }
                None => return false,
            }
        }
    })
    .await;

    match result {
        Ok(true) => events,
        Ok(false) => panic!("stream ended before a matching event; got {:?}", tags(&events)),
        Err(_) => panic!("timed out waiting for event; got {:?}", tags(&events)),
    }
}

/// Collect events until the stream completes.  Panics on timeout.
pub async fn collect_all(mut subscription: EventSubscription) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    let result = tokio::time::timeout(EVENT_WAIT, async {
        while let Some(event) = subscription.recv().await {
            events.push(event);
        }
    })
    .await;
    if result.is_err() {
        panic!("stream did not complete; got {:?}", tags(&events));
    }
    events
}

/// The `_tag` sequence of a slice of events, for assertion messages.
pub fn tags(events: &[AgentEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.tag()).collect()
}
