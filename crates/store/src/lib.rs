//! Durable append-only event logs, one per context.
//!
//! Two backends with identical semantics: [`FsEventStore`] (one JSONL file
//! per context under a data directory) and [`MemoryEventStore`] (tests and
//! the in-process CLI).  A batch append is atomic with respect to
//! concurrent appends on the same context: the whole batch is durable
//! before the call returns, or nothing from it is visible.

mod fs;
mod memory;

pub use fs::FsEventStore;
pub use memory::MemoryEventStore;

use ca_domain::event::AgentEvent;
use ca_domain::Result;

/// Durable, per-context append log.
///
/// Only persisted variants are ever passed to `append`; ephemeral events
/// (`TextDeltaEvent`) never reach the store.
pub trait EventStore: Send + Sync {
    /// All persisted events for a context, in append order.  Empty when
    /// the context has never been written.
    fn load(&self, context: &str) -> Result<Vec<AgentEvent>>;

    /// Append a batch.  Appending an empty batch is a no-op.
    fn append(&self, context: &str, events: &[AgentEvent]) -> Result<()>;

    fn exists(&self, context: &str) -> bool;

    /// All known context names.
    fn list(&self) -> Result<Vec<String>>;
}


#[cfg(test)]
mod tests {
    use super::test_support::sample_log;
    use super::*;

    fn backends(dir: &std::path::Path) -> Vec<Box<dyn EventStore>> {
        vec![
            Box::new(FsEventStore::new(dir).unwrap()),
            Box::new(MemoryEventStore::new()),
        ]
    }

    #[test]
    fn backends_share_semantics() {
        let dir = tempfile::tempdir().unwrap();
        for store in backends(dir.path()) {
            let log = sample_log("a-v1");

            assert!(!store.exists("a-v1"));
            assert!(store.load("a-v1").unwrap().is_empty());

            store.append("a-v1", &log[..2]).unwrap();
            store.append("a-v1", &log[2..]).unwrap();
            // Empty batch is a no-op.
            store.append("a-v1", &[]).unwrap();

            assert!(store.exists("a-v1"));
            assert_eq!(store.load("a-v1").unwrap(), log);
            assert_eq!(store.list().unwrap(), vec!["a-v1".to_string()]);
        }
    }

    #[test]
    fn contexts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        for store in backends(dir.path()) {
            store.append("a-v1", &sample_log("a-v1")).unwrap();
            store.append("b-v1", &sample_log("b-v1")[..1]).unwrap();

            assert_eq!(store.load("a-v1").unwrap().len(), 5);
            assert_eq!(store.load("b-v1").unwrap().len(), 1);

            let mut names = store.list().unwrap();
            names.sort();
            assert_eq!(names, vec!["a-v1".to_string(), "b-v1".to_string()]);
        }
    }
}
