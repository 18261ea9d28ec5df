//! The agent runtime: per-agent actors over an event-sourced log.
//!
//! Each agent is a mailbox-driven actor.  A single processor task assigns
//! ids, chains events, folds them into reduced state, broadcasts to
//! subscribers, and persists in the background; a trigger loop debounces
//! triggering events and drives at most one streaming turn at a time; the
//! [`AgentRegistry`] owns lazy creation (with log replay) and coordinated
//! shutdown.

pub mod agent;
pub mod executor;
pub mod registry;
pub mod testing;
pub mod turn;

pub use agent::{AgentHandle, EventSubscription, EventTicket};
pub use executor::{BoxStream, EchoExecutor, TurnChunk, TurnContext, TurnExecutor, TurnStream};
pub use registry::AgentRegistry;
pub use turn::TurnOptions;
