use std::sync::Arc;

use futures::future::BoxFuture;

use threadloom_core::error::Result;
use threadloom_core::graph::Node;
use threadloom_core::traits::NodeHandler;
use threadloom_core::types::{GraphId, NodeId, NodeKind, StartStream, StreamType};

use crate::coordinator::StreamCoordinator;

/// Handler for nodes that hold input and produce no stream: prompts,
/// attachments and repository sources.
pub struct PromptHandler {
    kind: NodeKind,
}

impl PromptHandler {
    pub fn new(kind: NodeKind) -> Self {
        Self { kind }
    }
}

impl NodeHandler for PromptHandler {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn execute(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Merge nodes combine context when a downstream node assembles its
/// messages; executing one does nothing on its own.
pub struct MergeHandler;

impl NodeHandler for MergeHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::ContextMerge
    }

    fn execute(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Starts and cancels model streams for a generation node.
pub struct GenerationHandler {
    kind: NodeKind,
    sessions: Arc<StreamCoordinator>,
    request: StartStream,
}

impl GenerationHandler {
    pub fn new(kind: NodeKind, sessions: Arc<StreamCoordinator>, request: StartStream) -> Self {
        Self {
            kind,
            sessions,
            request,
        }
    }

    pub fn request(&self) -> &StartStream {
        &self.request
    }
}

impl NodeHandler for GenerationHandler {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn execute(&self, node: &NodeId) -> BoxFuture<'_, Result<()>> {
        let mut request = self.request.clone();
        request.node_id = node.clone();
        Box::pin(async move { self.sessions.start(request).await })
    }

    fn stop(&self, node: &NodeId) -> BoxFuture<'_, Result<()>> {
        let node = node.clone();
        Box::pin(async move { self.sessions.cancel(&node).await })
    }
}

fn stream_type_for(kind: NodeKind) -> StreamType {
    match kind {
        NodeKind::ParallelGeneration => StreamType::Parallel,
        NodeKind::Routing => StreamType::Routing,
        NodeKind::ContextMerge => StreamType::Merge,
        _ => StreamType::Generation,
    }
}

/// Build the handler a client registers for one of its nodes.
///
/// Generation nodes read `model` from their data (falling back to
/// `default_model`); parallel nodes fan out over `models`.
pub fn handler_for(
    node: &Node,
    graph_id: &GraphId,
    sessions: Arc<StreamCoordinator>,
    default_model: &str,
) -> Arc<dyn NodeHandler> {
    match node.kind {
        NodeKind::ContextMerge => Arc::new(MergeHandler),
        kind if kind.is_generation() => {
            let model = node
                .data
                .get("model")
                .and_then(|v| v.as_str())
                .filter(|m| !m.is_empty())
                .unwrap_or(default_model)
                .to_string();
            let sub_models = if kind.is_fan_out() {
                let listed: Vec<String> = node
                    .data
                    .get("models")
                    .and_then(|v| v.as_array())
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m.as_str())
                            .filter(|m| !m.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if listed.is_empty() {
                    vec![model.clone()]
                } else {
                    listed
                }
            } else {
                Vec::new()
            };
            let request = StartStream {
                graph_id: graph_id.clone(),
                node_id: node.id.clone(),
                model,
                stream_type: stream_type_for(kind),
                title: None,
                sub_models,
            };
            Arc::new(GenerationHandler::new(kind, sessions, request))
        }
        kind => Arc::new(PromptHandler::new(kind)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadloom_core::types::{SessionKey, SessionState};
    use threadloom_test_utils::RecordingTransport;

    fn coordinator() -> (Arc<StreamCoordinator>, Arc<RecordingTransport>) {
        let (transport, _ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport.clone());
        (coord, transport)
    }

    #[tokio::test]
    async fn test_input_nodes_are_noops() {
        let (coord, transport) = coordinator();
        let node = Node::new("p1", NodeKind::Prompt);
        let handler = handler_for(&node, &GraphId::from_string("g"), coord.clone(), "m");
        assert_eq!(handler.kind(), NodeKind::Prompt);
        handler.execute(&node.id).await.unwrap();
        handler.stop(&node.id).await.unwrap();
        assert!(transport.sent().is_empty());
        assert!(coord.sessions(&node.id).await.is_empty());

        let merge = Node::new("m1", NodeKind::ContextMerge);
        let handler = handler_for(&merge, &GraphId::from_string("g"), coord, "m");
        assert_eq!(handler.kind(), NodeKind::ContextMerge);
        handler.execute(&merge.id).await.unwrap();
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_generation_uses_node_model() {
        let (coord, transport) = coordinator();
        let node = Node::new("t1", NodeKind::TextGeneration)
            .with_data(serde_json::json!({"model": "gpt-4o"}));
        let handler = handler_for(&node, &GraphId::from_string("g"), coord.clone(), "fallback");
        handler.execute(&node.id).await.unwrap();

        assert_eq!(transport.starts(), vec![SessionKey::node(node.id.clone())]);
        let session = coord.session(&SessionKey::node(node.id.clone())).await.unwrap();
        assert_eq!(session.model(), "gpt-4o");
        assert_eq!(coord.node_status(&node.id).await, SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_parallel_fans_out_over_models() {
        let (coord, transport) = coordinator();
        let node = Node::new("par", NodeKind::ParallelGeneration)
            .with_data(serde_json::json!({"models": ["a", "b"]}));
        let handler = handler_for(&node, &GraphId::from_string("g"), coord.clone(), "fallback");
        handler.execute(&node.id).await.unwrap();
        assert_eq!(
            transport.starts(),
            vec![
                SessionKey::sub(node.id.clone(), "a"),
                SessionKey::sub(node.id.clone(), "b")
            ]
        );

        let lone = Node::new("par2", NodeKind::ParallelGeneration);
        let handler = handler_for(&lone, &GraphId::from_string("g"), coord, "fallback");
        handler.execute(&lone.id).await.unwrap();
        assert!(transport
            .starts()
            .contains(&SessionKey::sub(lone.id.clone(), "fallback")));
    }
}
