//! The per-agent actor.
//!
//! Exactly one processor task mutates agent state.  External calls enqueue
//! to its mailbox (or create a subscription) and return; everything that
//! happens afterwards surfaces exclusively as events on the log/stream.
//!
//! Per event the processor: assigns id/timestamp/parent, folds the event
//! into the reduced state, updates the partial-response accumulator,
//! publishes an atomically-consistent snapshot, broadcasts to subscribers,
//! and (for persisted variants) hands the event to a background append
//! worker in submission order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use ca_domain::event::{context_name, format_event_id, AgentEvent, EventPayload};
use ca_domain::reducer::ReducedState;
use ca_domain::trace::TraceEvent;
use ca_store::EventStore;

use crate::executor::TurnExecutor;
use crate::turn::{self, Control, TurnOptions};

/// Broadcast buffer per agent.  A subscriber that falls further behind
/// than this is dropped (its stream ends); the publisher never blocks.
const BROADCAST_CAPACITY: usize = 1024;

/// How long agent teardown waits for pending background appends.
const FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Submissions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct Submission {
    pub payload: EventPayload,
    pub triggers: bool,
    /// Resolved with the finalized (id-assigned, chained) event after the
    /// processor has broadcast it.
    pub ack: Option<oneshot::Sender<AgentEvent>>,
}

/// Cheap handle for enqueueing events; used by the trigger loop and turn
/// worker as well as the public API.
#[derive(Clone)]
pub(crate) struct Submitter {
    agent_name: String,
    tx: mpsc::UnboundedSender<Submission>,
}

impl Submitter {
    pub fn submit(&self, payload: EventPayload, triggers: bool) {
        let tag = payload.tag();
        if self
            .tx
            .send(Submission {
                payload,
                triggers,
                ack: None,
            })
            .is_err()
        {
            tracing::warn!(agent = %self.agent_name, tag, "event dropped: agent session has ended");
        }
    }

    pub fn submit_acked(&self, payload: EventPayload, triggers: bool) -> EventTicket {
        let (ack_tx, ack_rx) = oneshot::channel();
        let tag = payload.tag();
        if self
            .tx
            .send(Submission {
                payload,
                triggers,
                ack: Some(ack_tx),
            })
            .is_err()
        {
            tracing::warn!(agent = %self.agent_name, tag, "event dropped: agent session has ended");
        }
        EventTicket { rx: ack_rx }
    }
}

/// Receipt for a submitted event; resolves once the processor has
/// finalized and broadcast it.
pub struct EventTicket {
    rx: oneshot::Receiver<AgentEvent>,
}

impl EventTicket {
    /// The finalized event, or `None` when the agent ended before
    /// processing it.
    pub async fn finalized(self) -> Option<AgentEvent> {
        self.rx.await.ok()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Broadcast hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fan-out point for finalized events.
///
/// `subscribe` registers the reader atomically — any publish after
/// `subscribe` returns is delivered.  `close` drops the sender so every
/// receiver drains its buffer and then completes.
pub(crate) struct BroadcastHub {
    tx: RwLock<Option<broadcast::Sender<AgentEvent>>>,
}

impl BroadcastHub {
    /// Build the hub and the trigger loop's receiver in one step, so that
    /// the first subscriber exists before anything can be published.
    fn new() -> (Self, broadcast::Receiver<AgentEvent>) {
        let (tx, rx) = broadcast::channel(BROADCAST_CAPACITY);
        (
            Self {
                tx: RwLock::new(Some(tx)),
            },
            rx,
        )
    }

    fn publish(&self, event: AgentEvent) {
        if let Some(tx) = self.tx.read().as_ref() {
            // Err means no live subscribers; not an error.
            let _ = tx.send(event);
        }
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<AgentEvent>> {
        self.tx.read().as_ref().map(|tx| tx.subscribe())
    }

    fn close(&self) {
        self.tx.write().take();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscriptions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live event stream.  Yields every event whose processing began after
/// the subscription was created, in processor order, ending after
/// `SessionEndedEvent` (or immediately when the agent has already ended).
pub struct EventSubscription {
    rx: Option<broadcast::Receiver<AgentEvent>>,
    /// Events with a counter below this were already delivered via a
    /// replay snapshot and are skipped.
    skip_below: u64,
    done: bool,
}

impl EventSubscription {
    /// Next event, or `None` once the stream is complete.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.counter().is_some_and(|c| c < self.skip_below) {
                        continue;
                    }
                    if matches!(event.payload, EventPayload::SessionEnded) {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscriber lagged past buffer; dropping subscription");
                    self.done = true;
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Adapt into a `futures` stream (for SSE bodies).
    pub fn into_stream(mut self) -> impl futures_core::Stream<Item = AgentEvent> {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read model published by the processor.  Updated before each broadcast,
/// so an observer that has seen event `n` always reads state reflecting
/// events `0..=n`.
pub(crate) struct SharedView {
    pub snapshot: RwLock<Snapshot>,
}

pub(crate) struct Snapshot {
    pub log: Vec<AgentEvent>,
    pub state: ReducedState,
    pub partial_response: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Clonable handle to a running agent.  All operations are non-blocking
/// submissions except [`end_session`](Self::end_session), which resolves
/// after the final event is broadcast and persistence has drained.
#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    name: String,
    context_name: String,
    submitter: Submitter,
    control: mpsc::UnboundedSender<Control>,
    hub: Arc<BroadcastHub>,
    view: Arc<SharedView>,
    ended: AtomicBool,
    terminated: watch::Receiver<bool>,
}

impl AgentHandle {
    /// Bring up the actor over a replayed log.  Callers go through the
    /// registry, which owns loading and the bring-up events.
    pub(crate) fn spawn(
        name: &str,
        store: Arc<dyn EventStore>,
        executor: Arc<dyn TurnExecutor>,
        options: TurnOptions,
        replayed: Vec<AgentEvent>,
    ) -> AgentHandle {
        let context = context_name(name);
        let state = ReducedState::default().reduce(&replayed);
        let last_event_id = replayed.last().map(|e| e.id.clone());
        let initial_turn_seq = state.current_turn_number;

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let (hub, trigger_rx) = BroadcastHub::new();
        let hub = Arc::new(hub);
        let view = Arc::new(SharedView {
            snapshot: RwLock::new(Snapshot {
                log: replayed,
                state: state.clone(),
                partial_response: String::new(),
            }),
        });

        let submitter = Submitter {
            agent_name: name.to_owned(),
            tx: mailbox_tx,
        };

        let persist_handle = tokio::spawn(run_persist_worker(
            context.clone(),
            store,
            persist_rx,
        ));

        tokio::spawn(run_processor(ProcessorContext {
            agent_name: name.to_owned(),
            context_name: context.clone(),
            mailbox_rx,
            hub: hub.clone(),
            view: view.clone(),
            persist_tx,
            persist_handle,
            terminated_tx,
            state,
            last_event_id,
        }));

        tokio::spawn(turn::run_trigger_loop(turn::TriggerContext {
            agent_name: name.to_owned(),
            subscription: trigger_rx,
            control_rx,
            submitter: submitter.clone(),
            view: view.clone(),
            executor,
            options,
            turn_seq: initial_turn_seq,
        }));

        AgentHandle {
            inner: Arc::new(AgentInner {
                name: name.to_owned(),
                context_name: context,
                submitter,
                control: control_tx,
                hub,
                view,
                ended: AtomicBool::new(false),
                terminated: terminated_rx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn context_name(&self) -> &str {
        &self.inner.context_name
    }

    /// Enqueue an event.  Returns immediately; the event is appended to
    /// the log in submission order.
    pub fn add_event(&self, payload: EventPayload, triggers_agent_turn: bool) {
        self.inner.submitter.submit(payload, triggers_agent_turn);
    }

    /// Enqueue an event and get a ticket that resolves with its finalized
    /// form once processed.
    pub fn add_event_tracked(&self, payload: EventPayload, triggers_agent_turn: bool) -> EventTicket {
        self.inner.submitter.submit_acked(payload, triggers_agent_turn)
    }

    /// Subscribe to the live stream.  When this returns, the subscription
    /// is registered: every event whose processing begins afterwards is
    /// delivered.  Events processed earlier are not delivered
    /// retroactively.
    pub fn subscribe(&self) -> EventSubscription {
        match self.inner.hub.subscribe() {
            Some(rx) => EventSubscription {
                rx: Some(rx),
                skip_below: 0,
                done: false,
            },
            None => EventSubscription {
                rx: None,
                skip_below: 0,
                done: true,
            },
        }
    }

    /// Atomic snapshot of the full log plus a live subscription that
    /// resumes exactly where the snapshot ends (no gap, no duplicates).
    pub fn subscribe_with_replay(&self) -> (Vec<AgentEvent>, EventSubscription) {
        // Subscribe first: anything published between the subscription and
        // the snapshot read is both in the snapshot and in the buffer, and
        // is deduplicated by counter.
        let rx = self.inner.hub.subscribe();
        let snapshot = self.inner.view.snapshot.read();
        let log = snapshot.log.clone();
        let skip_below = snapshot.state.next_event_number;
        drop(snapshot);

        let done = rx.is_none();
        (
            log,
            EventSubscription {
                rx,
                skip_below,
                done,
            },
        )
    }

    /// Snapshot of all events processed so far (includes in-memory
    /// `TextDeltaEvent`s).
    pub fn log_snapshot(&self) -> Vec<AgentEvent> {
        self.inner.view.snapshot.read().log.clone()
    }

    /// Current reduced-state snapshot.
    pub fn state(&self) -> ReducedState {
        self.inner.view.snapshot.read().state.clone()
    }

    /// True iff no turn is open.
    pub fn is_idle(&self) -> bool {
        !self.state().is_turn_in_progress()
    }

    /// Interrupt the open turn, if any (`reason = user_cancel`).  No-op
    /// when idle.
    pub fn interrupt_turn(&self) {
        let _ = self.inner.control.send(Control::Interrupt);
    }

    /// Graceful, idempotent termination: interrupt any open turn
    /// (`reason = session_ended`), emit `SessionEndedEvent`, then close
    /// subscriptions.  Resolves after the final event has been broadcast
    /// and background persistence has drained.
    pub async fn end_session(&self) {
        if !self.inner.ended.swap(true, Ordering::SeqCst) {
            let (done_tx, done_rx) = oneshot::channel();
            if self
                .inner
                .control
                .send(Control::EndSession { done: done_tx })
                .is_ok()
            {
                let _ = done_rx.await;
            }
        }

        // Wait for the processor to flush and exit (it closes the hub).
        let mut terminated = self.inner.terminated.clone();
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, async {
            while !*terminated.borrow() {
                if terminated.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Processor — the single writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ProcessorContext {
    agent_name: String,
    context_name: String,
    mailbox_rx: mpsc::UnboundedReceiver<Submission>,
    hub: Arc<BroadcastHub>,
    view: Arc<SharedView>,
    persist_tx: mpsc::UnboundedSender<AgentEvent>,
    persist_handle: tokio::task::JoinHandle<()>,
    terminated_tx: watch::Sender<bool>,
    state: ReducedState,
    last_event_id: Option<String>,
}

async fn run_processor(mut ctx: ProcessorContext) {
    let mut partial = String::new();

    while let Some(submission) = ctx.mailbox_rx.recv().await {
        let Submission {
            mut payload,
            triggers,
            ack,
        } = submission;

        // The processor owns the delta accumulator, so it fills the
        // partial response at processing time; deltas still queued in the
        // mailbox at draft time have all been folded in by now.
        if let EventPayload::AgentTurnInterrupted {
            partial_response, ..
        } = &mut payload
        {
            *partial_response = (!partial.is_empty()).then(|| partial.clone());
        }

        let event = AgentEvent {
            id: format_event_id(&ctx.context_name, ctx.state.next_event_number),
            timestamp: Utc::now(),
            agent_name: ctx.agent_name.clone(),
            parent_event_id: ctx.last_event_id.clone(),
            triggers_agent_turn: triggers,
            payload,
        };

        ctx.state.apply(&event);
        ctx.last_event_id = Some(event.id.clone());

        match &event.payload {
            EventPayload::AgentTurnStarted { .. } => partial.clear(),
            EventPayload::TextDelta { delta } => partial.push_str(delta),
            _ => {}
        }

        {
            let mut snapshot = ctx.view.snapshot.write();
            snapshot.log.push(event.clone());
            snapshot.state = ctx.state.clone();
            snapshot.partial_response = partial.clone();
        }

        // Broadcast before persistence is submitted: observers see events
        // ahead of durability, never behind it.
        ctx.hub.publish(event.clone());

        if let Some(ack) = ack {
            let _ = ack.send(event.clone());
        }

        let is_session_end = matches!(event.payload, EventPayload::SessionEnded);

        if !event.payload.is_ephemeral() && ctx.persist_tx.send(event).is_err() {
            tracing::error!(agent = %ctx.agent_name, "persistence worker gone; event not stored");
        }

        if is_session_end {
            TraceEvent::SessionEnded {
                agent_name: ctx.agent_name.clone(),
                total_events: ctx.state.next_event_number,
            }
            .emit();
            break;
        }
    }

    // Teardown: flush pending appends (bounded), then complete all
    // subscriptions.
    drop(ctx.persist_tx);
    if tokio::time::timeout(FLUSH_TIMEOUT, ctx.persist_handle)
        .await
        .is_err()
    {
        tracing::warn!(agent = %ctx.agent_name, "timed out waiting for pending appends");
    }
    ctx.hub.close();
    let _ = ctx.terminated_tx.send(true);
    tracing::debug!(agent = %ctx.agent_name, "processor stopped");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence worker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pulls finalized events in FIFO order and appends them one at a time,
/// so appends never reorder with respect to submission.  Append failures
/// are logged; the in-memory log stays authoritative for subscribers.
async fn run_persist_worker(
    context: String,
    store: Arc<dyn EventStore>,
    mut rx: mpsc::UnboundedReceiver<AgentEvent>,
) {
    while let Some(event) = rx.recv().await {
        if let Err(e) = store.append(&context, std::slice::from_ref(&event)) {
            tracing::error!(context = %context, id = %event.id, error = %e, "append failed");
        }
    }
}
