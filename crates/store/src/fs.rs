//! Filesystem backend — one JSONL file per context.
//!
//! Each context maps to `<data_dir>/<context>.jsonl`; every event is one
//! JSON line, human-readable and append-only.  A per-context mutex plus a
//! single buffered `write_all` per batch keeps concurrent appends on the
//! same context from interleaving.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use ca_domain::event::AgentEvent;
use ca_domain::trace::TraceEvent;
use ca_domain::{Error, Result};

const LOG_EXTENSION: &str = "jsonl";

pub struct FsEventStore {
    data_dir: PathBuf,
    /// context → append lock.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsEventStore {
    /// Open (creating if needed) a store rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(Error::Io)?;
        tracing::info!(path = %data_dir.display(), "event store ready");
        Ok(Self {
            data_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, context: &str) -> PathBuf {
        self.data_dir.join(format!("{context}.{LOG_EXTENSION}"))
    }

    fn lock_for(&self, context: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(context.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl super::EventStore for FsEventStore {
    fn load(&self, context: &str) -> Result<Vec<AgentEvent>> {
        let path = self.path(context);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let mut events = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            // A malformed line means the log cannot be replayed faithfully;
            // surface the failure rather than silently breaking the chain.
            let event: AgentEvent = serde_json::from_str(line).map_err(|e| {
                Error::Store(format!(
                    "{}:{}: malformed event: {e}",
                    path.display(),
                    lineno + 1
                ))
            })?;
            events.push(event);
        }

        TraceEvent::StoreLoaded {
            context: context.to_owned(),
            events: events.len(),
        }
        .emit();
        Ok(events)
    }

    fn append(&self, context: &str, events: &[AgentEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        debug_assert!(
            events.iter().all(|e| !e.payload.is_ephemeral()),
            "ephemeral events must not reach the store"
        );

        let mut buf = String::new();
        for event in events {
            buf.push_str(&serde_json::to_string(event).map_err(Error::Json)?);
            buf.push('\n');
        }

        let lock = self.lock_for(context);
        let _guard = lock.lock();

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(context))
            .map_err(Error::Io)?;
        file.write_all(buf.as_bytes()).map_err(Error::Io)?;
        file.sync_data().map_err(Error::Io)?;

        TraceEvent::StoreAppend {
            context: context.to_owned(),
            events: events.len(),
        }
        .emit();
        Ok(())
    }

    fn exists(&self, context: &str) -> bool {
        self.path(context).exists()
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir).map_err(Error::Io)? {
            let path = entry.map_err(Error::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
