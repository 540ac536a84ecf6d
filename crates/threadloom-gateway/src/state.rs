use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use threadloom_core::config::AppConfig;
use threadloom_core::event::EventBus;
use threadloom_core::traits::{ChatBackend, GraphStore};
use threadloom_core::types::GraphId;
use threadloom_graph::{ContextAssembler, ContextMerger, ExecutionPlanner};
use threadloom_stream::NodeRegistry;

/// Shared application state for axum handlers and client connections.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn GraphStore>,
    pub backend: Arc<dyn ChatBackend>,
    pub planner: ExecutionPlanner,
    pub merger: ContextMerger,
    pub assembler: Arc<ContextAssembler>,
    pub registry: Arc<NodeRegistry>,
    pub event_bus: Arc<EventBus>,
    graph_locks: Mutex<HashMap<GraphId, Arc<Mutex<()>>>>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn GraphStore>,
        backend: Arc<dyn ChatBackend>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            planner: ExecutionPlanner::new(store.clone()),
            merger: ContextMerger::new(config.merge.clone()),
            assembler: Arc::new(ContextAssembler::new(store.clone())),
            registry: Arc::new(NodeRegistry::new()),
            config,
            store,
            backend,
            event_bus,
            graph_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive write access to one graph. Held across load, mutate and
    /// save so concurrent edits apply one after the other.
    pub async fn lock_graph(&self, graph_id: &GraphId) -> OwnedMutexGuard<()> {
        let lock = self
            .graph_locks
            .lock()
            .await
            .entry(graph_id.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}
