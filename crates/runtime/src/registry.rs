//! Agent registry — lazy creation and caching of agents by name, plus
//! coordinated shutdown.
//!
//! Creation replays the persisted log through the reducer, brings up the
//! actor, and emits the session bookend events.  Concurrent first-access
//! calls for the same name share a single in-flight creation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use ca_domain::event::{context_name, EventPayload, LlmConfig};
use ca_domain::trace::TraceEvent;
use ca_domain::{Error, Result};
use ca_store::EventStore;

use crate::agent::AgentHandle;
use crate::executor::TurnExecutor;
use crate::turn::TurnOptions;

pub struct AgentRegistry {
    store: Arc<dyn EventStore>,
    executor: Arc<dyn TurnExecutor>,
    options: TurnOptions,
    /// Emitted at bring-up when the replayed log carries no config yet.
    default_llm: Option<LlmConfig>,
    /// name → creation cell.  The cell settles once per successful
    /// creation; late callers wait on the in-flight result and share it.
    agents: Mutex<HashMap<String, Arc<OnceCell<AgentHandle>>>>,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<dyn EventStore>,
        executor: Arc<dyn TurnExecutor>,
        options: TurnOptions,
        default_llm: Option<LlmConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            options,
            default_llm,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// The cached agent, or a freshly created one.  Creation failures
    /// (store load errors) are returned to the caller and leave the cell
    /// unset, so a later call can retry.
    pub async fn get_or_create(&self, name: &str) -> Result<AgentHandle> {
        let cell = {
            let mut agents = self.agents.lock();
            agents.entry(name.to_owned()).or_default().clone()
        };
        let handle = cell
            .get_or_try_init(|| self.create(name))
            .await?;
        Ok(handle.clone())
    }

    async fn create(&self, name: &str) -> Result<AgentHandle> {
        let context = context_name(name);
        let replayed = self.store.load(&context)?;
        let has_config = replayed
            .iter()
            .any(|e| matches!(e.payload, EventPayload::SetLlmConfig(_)));
        let replayed_len = replayed.len();

        let handle = AgentHandle::spawn(
            name,
            self.store.clone(),
            self.executor.clone(),
            self.options.clone(),
            replayed,
        );

        handle.add_event(EventPayload::SessionStarted, false);
        if !has_config {
            if let Some(config) = &self.default_llm {
                handle.add_event(EventPayload::SetLlmConfig(config.clone()), false);
            }
        }

        TraceEvent::AgentCreated {
            agent_name: name.to_owned(),
            context,
            replayed_events: replayed_len,
        }
        .emit();
        Ok(handle)
    }

    /// The cached agent, or `AgentNotFound`.
    pub fn get(&self, name: &str) -> Result<AgentHandle> {
        self.agents
            .lock()
            .get(name)
            .and_then(|cell| cell.get())
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(name.to_owned()))
    }

    /// Names of all cached agents, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .agents
            .lock()
            .iter()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// End one agent's session and drop it from the cache.  A later
    /// `get_or_create` for the same name resumes from the store.
    pub async fn shutdown_agent(&self, name: &str) -> Result<()> {
        let cell = self
            .agents
            .lock()
            .remove(name)
            .ok_or_else(|| Error::AgentNotFound(name.to_owned()))?;
        if let Some(handle) = cell.get() {
            handle.end_session().await;
        }
        Ok(())
    }

    /// End every agent's session concurrently and clear the cache.  The
    /// sole teardown path at process exit.
    pub async fn shutdown_all(&self) {
        let cells: Vec<_> = {
            let mut agents = self.agents.lock();
            agents.drain().map(|(_, cell)| cell).collect()
        };
        let handles: Vec<_> = cells.iter().filter_map(|cell| cell.get()).collect();
        tracing::info!(agents = handles.len(), "shutting down all agents");
        futures_util::future::join_all(handles.iter().map(|h| h.end_session())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EchoExecutor;
    use ca_store::MemoryEventStore;

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(EchoExecutor),
            TurnOptions::default(),
            None,
        ))
    }

    /// Wait until all previously submitted events have been processed by
    /// submitting a tracked marker behind them.
    async fn drain(handle: &AgentHandle) {
        let _ = handle
            .add_event_tracked(
                EventPayload::SystemPrompt {
                    content: "marker".into(),
                },
                false,
            )
            .finalized()
            .await;
    }

    #[tokio::test]
    async fn creation_emits_session_started_once() {
        let registry = registry();
        let handle = registry.get_or_create("a").await.unwrap();
        drain(&handle).await;

        let started: Vec<_> = handle
            .log_snapshot()
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::SessionStarted))
            .collect();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, "a-v1:0000");
        assert!(started[0].parent_event_id.is_none());
    }

    #[tokio::test]
    async fn concurrent_first_access_creates_one_agent() {
        let registry = registry();
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("a").await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let handle = registry.get("a").unwrap();
        drain(&handle).await;
        let started = handle
            .log_snapshot()
            .into_iter()
            .filter(|e| matches!(e.payload, EventPayload::SessionStarted))
            .count();
        assert_eq!(started, 1, "exactly one instantiation");
    }

    #[tokio::test]
    async fn get_on_uncached_name_fails() {
        let registry = registry();
        assert!(matches!(
            registry.get("ghost"),
            Err(Error::AgentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn default_llm_config_emitted_at_bring_up() {
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(EchoExecutor),
            TurnOptions::default(),
            Some(LlmConfig {
                api_format: "openai".into(),
                model: "gpt-4o".into(),
                base_url: None,
                api_key_env_var: None,
            }),
        ));
        let handle = registry.get_or_create("a").await.unwrap();
        drain(&handle).await;

        let state = handle.state();
        assert_eq!(state.llm_config.unwrap().model, "gpt-4o");
    }

    #[tokio::test]
    async fn shutdown_agent_removes_from_cache() {
        let registry = registry();
        registry.get_or_create("a").await.unwrap();
        assert_eq!(registry.list(), vec!["a".to_string()]);

        registry.shutdown_agent("a").await.unwrap();
        assert!(registry.list().is_empty());
        assert!(matches!(registry.get("a"), Err(Error::AgentNotFound(_))));
        assert!(matches!(
            registry.shutdown_agent("a").await,
            Err(Error::AgentNotFound(_))
        ));
    }
}
