use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use futures::future::BoxFuture;

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::graph::{Edge, Graph};
use threadloom_core::traits::GraphStore;
use threadloom_core::types::{EdgeDirection, GraphId, NodeId, NodeKind, NodeOutput};

/// Process-local graph store. Used by tests and `store.backend = "memory"`.
#[derive(Default)]
pub struct MemoryGraphStore {
    graphs: RwLock<HashMap<GraphId, Graph>>,
    outputs: Mutex<Vec<NodeOutput>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the given graphs.
    pub fn with_graphs(graphs: impl IntoIterator<Item = Graph>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.graphs.write() {
            for g in graphs {
                map.insert(g.id.clone(), g);
            }
        }
        store
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<GraphId, Graph>) -> T) -> Result<T> {
        let map = self
            .graphs
            .read()
            .map_err(|e| ThreadloomError::Database(e.to_string()))?;
        Ok(f(&map))
    }
}

impl GraphStore for MemoryGraphStore {
    fn node_kind(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Option<NodeKind>>> {
        let result = self.read(|map| {
            map.get(graph)
                .and_then(|g| g.node(node))
                .map(|n| n.kind)
        });
        Box::pin(async move { result })
    }

    fn incident_edges(
        &self,
        graph: &GraphId,
        node: &NodeId,
        direction: EdgeDirection,
    ) -> BoxFuture<'_, Result<Vec<Edge>>> {
        let result = self.read(|map| {
            map.get(graph)
                .map(|g| g.incident(node, direction).into_iter().cloned().collect())
                .unwrap_or_default()
        });
        Box::pin(async move { result })
    }

    fn load_graph(&self, graph: &GraphId) -> BoxFuture<'_, Result<Option<Graph>>> {
        let result = self.read(|map| map.get(graph).cloned());
        Box::pin(async move { result })
    }

    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        let graph = graph.clone();
        Box::pin(async move {
            let mut map = self
                .graphs
                .write()
                .map_err(|e| ThreadloomError::Database(e.to_string()))?;
            map.insert(graph.id.clone(), graph);
            Ok(())
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphId>>> {
        let result = self.read(|map| {
            let mut ids: Vec<GraphId> = map.keys().cloned().collect();
            ids.sort();
            ids
        });
        Box::pin(async move { result })
    }

    fn record_output(&self, output: &NodeOutput) -> BoxFuture<'_, Result<()>> {
        let output = output.clone();
        Box::pin(async move {
            self.outputs
                .lock()
                .map_err(|e| ThreadloomError::Database(e.to_string()))?
                .push(output);
            Ok(())
        })
    }

    fn outputs(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Vec<NodeOutput>>> {
        let graph = graph.clone();
        let node = node.clone();
        Box::pin(async move {
            let outputs = self
                .outputs
                .lock()
                .map_err(|e| ThreadloomError::Database(e.to_string()))?;
            Ok(outputs
                .iter()
                .filter(|o| o.graph_id == graph && o.node_id == node)
                .cloned()
                .collect())
        })
    }
}
