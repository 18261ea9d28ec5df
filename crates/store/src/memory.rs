//! In-memory backend — tests and the in-process CLI.

use std::collections::HashMap;

use parking_lot::RwLock;

use ca_domain::event::AgentEvent;
use ca_domain::Result;

#[derive(Default)]
pub struct MemoryEventStore {
    logs: RwLock<HashMap<String, Vec<AgentEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl super::EventStore for MemoryEventStore {
    fn load(&self, context: &str) -> Result<Vec<AgentEvent>> {
        Ok(self.logs.read().get(context).cloned().unwrap_or_default())
    }

    fn append(&self, context: &str, events: &[AgentEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        debug_assert!(
            events.iter().all(|e| !e.payload.is_ephemeral()),
            "ephemeral events must not reach the store"
        );
        self.logs
            .write()
            .entry(context.to_owned())
            .or_default()
            .extend_from_slice(events);
        Ok(())
    }

    fn exists(&self, context: &str) -> bool {
        self.logs.read().contains_key(context)
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.logs.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
