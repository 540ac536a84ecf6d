use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::graph::{Edge, Graph};
use crate::types::*;

/// Durable node/edge records held outside the engine.
///
/// The planner only needs `node_kind` and `incident_edges`; the rest serves
/// the canvas write path and history reads.
pub trait GraphStore: Send + Sync + 'static {
    /// Kind of a node, or `None` if the node (or graph) does not exist.
    fn node_kind(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Option<NodeKind>>>;

    /// Whether a node exists.
    fn node_exists(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<bool>> {
        let kind = self.node_kind(graph, node);
        Box::pin(async move { Ok(kind.await?.is_some()) })
    }

    /// Edges incident to a node, in insertion order.
    fn incident_edges(
        &self,
        graph: &GraphId,
        node: &NodeId,
        direction: EdgeDirection,
    ) -> BoxFuture<'_, Result<Vec<Edge>>>;

    /// Load a whole graph snapshot.
    fn load_graph(&self, graph: &GraphId) -> BoxFuture<'_, Result<Option<Graph>>>;

    /// Replace a whole graph snapshot.
    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>>;

    /// List stored graph ids.
    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphId>>>;

    /// Commit a finished session's output to history.
    fn record_output(&self, output: &NodeOutput) -> BoxFuture<'_, Result<()>>;

    /// Committed outputs of a node, oldest first.
    fn outputs(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Vec<NodeOutput>>>;
}

/// Streams text deltas for a chat request.
pub trait ChatBackend: Send + Sync + 'static {
    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>>;
}

/// Producer side of a client's stream channel.
///
/// The coordinator sends control messages; events come back on the
/// channel the transport was created with.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, message: ControlMessage) -> BoxFuture<'_, Result<()>>;
}

/// Per-kind node behaviour the registry dispatches to.
///
/// `execute` only dispatches work and returns; completion is observed
/// through the coordinator. `stop` resolves once cancellation has been
/// acknowledged.
pub trait NodeHandler: Send + Sync + 'static {
    fn kind(&self) -> NodeKind;

    fn execute(&self, node: &NodeId) -> BoxFuture<'_, Result<()>>;

    fn stop(&self, node: &NodeId) -> BoxFuture<'_, Result<()>>;
}

/// Observer of one node's stream sessions.
pub trait SessionListener: Send + Sync + 'static {
    /// A chunk was appended to a session of the node.
    fn on_chunk(&self, key: &SessionKey, chunk: &str) {
        let _ = (key, chunk);
    }

    /// A session reached a terminal state.
    fn on_finished(&self, session: FinishedSession) -> BoxFuture<'_, Result<()>>;
}
