//! Turn lifecycle — the per-agent trigger loop and the turn worker.
//!
//! The trigger loop consumes the agent's own broadcast, debounces bursts
//! of triggering events, and manages at most one turn worker at a time.
//! A new triggering event while a turn is open cancels the worker and
//! emits the interrupt before the next turn starts; the worker itself
//! emits completion/failure, so an outcome is reported exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ca_domain::config::TurnConfig;
use ca_domain::event::{AgentEvent, EventPayload, InterruptReason};
use ca_domain::trace::TraceEvent;

use crate::agent::{SharedView, Submitter};
use crate::executor::{TurnChunk, TurnContext, TurnExecutor};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Options & control
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turn scheduling knobs.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Burst window: a burst of triggering events within this window
    /// results in exactly one turn, started by the last event.
    pub debounce: Duration,
    /// Optional per-turn deadline; expiry interrupts with `timeout`.
    pub timeout: Option<Duration>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            timeout: None,
        }
    }
}

impl TurnOptions {
    pub fn from_config(config: &TurnConfig) -> Self {
        Self {
            debounce: Duration::from_millis(config.debounce_ms),
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// External requests routed to the trigger loop, which owns the turn
/// worker handle.
pub(crate) enum Control {
    /// Interrupt the open turn (`reason = user_cancel`); no-op when idle.
    Interrupt,
    /// Interrupt if needed, emit `SessionEndedEvent`, then stop.  `done`
    /// resolves once the session-end event has been broadcast.
    EndSession { done: oneshot::Sender<()> },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trigger loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct TriggerContext {
    pub agent_name: String,
    pub subscription: broadcast::Receiver<AgentEvent>,
    pub control_rx: mpsc::UnboundedReceiver<Control>,
    pub submitter: Submitter,
    pub view: Arc<SharedView>,
    pub executor: Arc<dyn TurnExecutor>,
    pub options: TurnOptions,
    /// Continues from the replayed turn count, so turn numbers keep
    /// increasing across lifetimes.
    pub turn_seq: u64,
}

struct OpenTurn {
    turn_number: u64,
    token: CancellationToken,
    handle: JoinHandle<TurnOutcome>,
}

pub(crate) async fn run_trigger_loop(mut ctx: TriggerContext) {
    let mut open: Option<OpenTurn> = None;

    loop {
        tokio::select! {
            control = ctx.control_rx.recv() => match control {
                None => break,
                Some(Control::Interrupt) => {
                    interrupt_open(
                        &ctx.agent_name,
                        &mut open,
                        &ctx.submitter,
                        InterruptReason::UserCancel,
                        None,
                    )
                    .await;
                }
                Some(Control::EndSession { done }) => {
                    interrupt_open(
                        &ctx.agent_name,
                        &mut open,
                        &ctx.submitter,
                        InterruptReason::SessionEnded,
                        None,
                    )
                    .await;
                    let _ = ctx
                        .submitter
                        .submit_acked(EventPayload::SessionEnded, false)
                        .finalized()
                        .await;
                    let _ = done.send(());
                    break;
                }
            },
            event = recv_event(&mut ctx.subscription) => match event {
                None => break,
                Some(event) => {
                    if matches!(event.payload, EventPayload::SessionEnded) {
                        break;
                    }
                    if event.triggers_agent_turn {
                        match debounce_burst(&mut ctx.subscription, event, ctx.options.debounce)
                            .await
                        {
                            Burst::Fire(last) => start_turn(&mut ctx, &mut open, last).await,
                            Burst::Ended => break,
                        }
                    }
                }
            },
        }
    }

    // Sessions ended out-of-band can leave a worker running; make sure it
    // is gone before the loop exits.
    if let Some(turn) = open.take() {
        turn.token.cancel();
        let _ = turn.handle.await;
    }
    tracing::debug!(agent = %ctx.agent_name, "trigger loop stopped");
}

/// Receive from the broadcast, riding out lag.  `None` = hub closed.
async fn recv_event(rx: &mut broadcast::Receiver<AgentEvent>) -> Option<AgentEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "trigger loop lagged behind the broadcast");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

enum Burst {
    /// The window elapsed; this is the last triggering event of the burst.
    Fire(AgentEvent),
    /// The session ended during the window; no turn starts.
    Ended,
}

/// Absorb a burst of triggering events.  Each new triggering event
/// restarts the window; the last one wins.
async fn debounce_burst(
    rx: &mut broadcast::Receiver<AgentEvent>,
    first: AgentEvent,
    window: Duration,
) -> Burst {
    let mut last = first;
    let mut deadline = tokio::time::Instant::now() + window;

    loop {
        match tokio::time::timeout_at(deadline, recv_event(rx)).await {
            Err(_) => return Burst::Fire(last),
            Ok(None) => return Burst::Ended,
            Ok(Some(event)) => {
                if matches!(event.payload, EventPayload::SessionEnded) {
                    return Burst::Ended;
                }
                if event.triggers_agent_turn {
                    last = event;
                    deadline = tokio::time::Instant::now() + window;
                }
            }
        }
    }
}

/// Displace any open turn, then start one for the triggering event.
async fn start_turn(ctx: &mut TriggerContext, open: &mut Option<OpenTurn>, trigger: AgentEvent) {
    interrupt_open(
        &ctx.agent_name,
        open,
        &ctx.submitter,
        InterruptReason::UserNewMessage,
        Some(trigger.id.clone()),
    )
    .await;

    ctx.turn_seq += 1;
    let turn_number = ctx.turn_seq;

    // Wait for the started event to be folded in, so the turn context
    // snapshot below includes the triggering message.
    let started = ctx
        .submitter
        .submit_acked(EventPayload::AgentTurnStarted { turn_number }, false)
        .finalized()
        .await;
    if started.is_none() {
        return;
    }

    let context = {
        let snapshot = ctx.view.snapshot.read();
        TurnContext {
            agent_name: ctx.agent_name.clone(),
            messages: snapshot.state.messages.clone(),
            llm_config: snapshot.state.llm_config.clone(),
        }
    };

    TraceEvent::TurnStarted {
        agent_name: ctx.agent_name.clone(),
        turn_number,
        trigger_event_id: trigger.id.clone(),
        message_count: context.messages.len(),
    }
    .emit();

    let token = CancellationToken::new();
    let handle = tokio::spawn(run_turn(TurnJob {
        agent_name: ctx.agent_name.clone(),
        executor: ctx.executor.clone(),
        context,
        token: token.clone(),
        submitter: ctx.submitter.clone(),
        turn_number,
        timeout: ctx.options.timeout,
    }));

    *open = Some(OpenTurn {
        turn_number,
        token,
        handle,
    });
}

/// Cancel the open turn and, when the worker observed the cancellation
/// (rather than finishing on its own first), emit the interrupt event.
/// The processor fills `partial_response` from its accumulator.
async fn interrupt_open(
    agent_name: &str,
    open: &mut Option<OpenTurn>,
    submitter: &Submitter,
    reason: InterruptReason,
    interrupted_by_event_id: Option<String>,
) {
    let Some(turn) = open.take() else { return };

    turn.token.cancel();
    let outcome = match turn.handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(error = %e, turn_number = turn.turn_number, "turn worker panicked");
            TurnOutcome::Cancelled
        }
    };

    if matches!(outcome, TurnOutcome::Cancelled) {
        submitter.submit(
            EventPayload::AgentTurnInterrupted {
                turn_number: turn.turn_number,
                reason,
                partial_response: None,
                interrupted_by_event_id,
            },
            false,
        );
        TraceEvent::TurnInterrupted {
            agent_name: agent_name.to_owned(),
            turn_number: turn.turn_number,
            reason: reason.as_str().to_owned(),
        }
        .emit();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a turn worker finished.  `Cancelled` means the interrupter owns
/// the terminal event; every other outcome already emitted its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnOutcome {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

struct TurnJob {
    agent_name: String,
    executor: Arc<dyn TurnExecutor>,
    context: TurnContext,
    token: CancellationToken,
    submitter: Submitter,
    turn_number: u64,
    timeout: Option<Duration>,
}

async fn run_turn(job: TurnJob) -> TurnOutcome {
    let TurnJob {
        agent_name,
        executor,
        context,
        token,
        submitter,
        turn_number,
        timeout,
    } = job;

    let started_at = tokio::time::Instant::now();
    let deadline = timeout.map(|t| started_at + t);
    let expired = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    let timeout_interrupt = |submitter: &Submitter| {
        submitter.submit(
            EventPayload::AgentTurnInterrupted {
                turn_number,
                reason: InterruptReason::Timeout,
                partial_response: None,
                interrupted_by_event_id: None,
            },
            false,
        );
        TraceEvent::TurnInterrupted {
            agent_name: agent_name.clone(),
            turn_number,
            reason: InterruptReason::Timeout.as_str().to_owned(),
        }
        .emit();
    };

    let mut stream = tokio::select! {
        _ = token.cancelled() => return TurnOutcome::Cancelled,
        _ = &mut expired => {
            timeout_interrupt(&submitter);
            return TurnOutcome::TimedOut;
        }
        result = executor.execute(context, token.clone()) => match result {
            Ok(stream) => stream,
            Err(e) => {
                if token.is_cancelled() {
                    return TurnOutcome::Cancelled;
                }
                let error = e.to_string();
                submitter.submit(
                    EventPayload::AgentTurnFailed {
                        turn_number,
                        error: error.clone(),
                    },
                    false,
                );
                TraceEvent::TurnFailed {
                    agent_name: agent_name.clone(),
                    turn_number,
                    error,
                }
                .emit();
                return TurnOutcome::Failed;
            }
        },
    };

    loop {
        tokio::select! {
            _ = token.cancelled() => return TurnOutcome::Cancelled,
            _ = &mut expired => {
                timeout_interrupt(&submitter);
                return TurnOutcome::TimedOut;
            }
            chunk = stream.next() => match chunk {
                None => {
                    let duration_ms = started_at.elapsed().as_millis() as u64;
                    submitter.submit(
                        EventPayload::AgentTurnCompleted {
                            turn_number,
                            duration_ms,
                        },
                        false,
                    );
                    TraceEvent::TurnCompleted {
                        agent_name: agent_name.clone(),
                        turn_number,
                        duration_ms,
                    }
                    .emit();
                    return TurnOutcome::Completed;
                }
                Some(Ok(TurnChunk::TextDelta { delta })) => {
                    submitter.submit(EventPayload::TextDelta { delta }, false);
                }
                Some(Ok(TurnChunk::AssistantMessage { content })) => {
                    submitter.submit(EventPayload::AssistantMessage { content }, false);
                }
                Some(Err(e)) => {
                    let error = e.to_string();
                    submitter.submit(
                        EventPayload::AgentTurnFailed {
                            turn_number,
                            error: error.clone(),
                        },
                        false,
                    );
                    TraceEvent::TurnFailed {
                        agent_name: agent_name.clone(),
                        turn_number,
                        error,
                    }
                    .emit();
                    return TurnOutcome::Failed;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ca_domain::event::format_event_id;
    use chrono::{TimeZone, Utc};

    fn event(counter: u64, payload: EventPayload, triggers: bool) -> AgentEvent {
        AgentEvent {
            id: format_event_id("a-v1", counter),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            agent_name: "a".into(),
            parent_event_id: (counter > 0).then(|| format_event_id("a-v1", counter - 1)),
            triggers_agent_turn: triggers,
            payload,
        }
    }

    fn user(counter: u64, content: &str) -> AgentEvent {
        event(
            counter,
            EventPayload::UserMessage {
                content: content.into(),
                images: None,
            },
            true,
        )
    }

    #[tokio::test]
    async fn debounce_last_trigger_in_burst_wins() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(user(1, "second")).unwrap();
        tx.send(user(2, "third")).unwrap();

        let burst = debounce_burst(&mut rx, user(0, "first"), Duration::from_millis(30)).await;
        match burst {
            Burst::Fire(last) => assert_eq!(last.id, "a-v1:0002"),
            Burst::Ended => panic!("burst must fire"),
        }
    }

    #[tokio::test]
    async fn debounce_ignores_non_triggering_events() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(event(
            1,
            EventPayload::TextDelta { delta: "x".into() },
            false,
        ))
        .unwrap();
        tx.send(event(2, EventPayload::AgentTurnStarted { turn_number: 9 }, false))
            .unwrap();

        let burst = debounce_burst(&mut rx, user(0, "only"), Duration::from_millis(30)).await;
        match burst {
            Burst::Fire(last) => assert_eq!(last.id, "a-v1:0000"),
            Burst::Ended => panic!("burst must fire"),
        }
    }

    #[tokio::test]
    async fn debounce_yields_to_session_end() {
        let (tx, mut rx) = broadcast::channel(16);
        tx.send(event(1, EventPayload::SessionEnded, false)).unwrap();

        let burst = debounce_burst(&mut rx, user(0, "first"), Duration::from_millis(30)).await;
        assert!(matches!(burst, Burst::Ended));
    }

    #[test]
    fn options_follow_the_turn_config() {
        let options = TurnOptions::from_config(&TurnConfig {
            debounce_ms: 250,
            timeout_ms: Some(10_000),
        });
        assert_eq!(options.debounce, Duration::from_millis(250));
        assert_eq!(options.timeout, Some(Duration::from_secs(10)));

        let defaults = TurnOptions::default();
        assert_eq!(defaults.debounce, Duration::from_millis(100));
        assert!(defaults.timeout.is_none());
    }
}
