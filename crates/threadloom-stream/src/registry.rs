use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::NodeHandler;
use threadloom_core::types::{ExecutionPlan, NodeId, NodeKind, SessionState};

use crate::coordinator::StreamCoordinator;

/// What a plan run does after a node ends in `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep executing the remaining nodes.
    Continue,
    /// Stop at the first failed node.
    #[default]
    Abort,
}

/// Handle returned by `register`, used to release exactly that
/// registration later.
pub type RegistrationId = u64;

struct Registration {
    id: RegistrationId,
    handler: Arc<dyn NodeHandler>,
    sessions: Arc<StreamCoordinator>,
    /// Serializes executions of this node.
    running: Mutex<()>,
}

/// Result of one executed plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node_id: NodeId,
    /// Terminal status, or `None` if the node started no session.
    pub status: Option<SessionState>,
}

/// Result of a plan run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRun {
    pub outcomes: Vec<NodeOutcome>,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Table of node handlers, one entry per node id.
///
/// An entry binds a handler to the coordinator whose sessions it drives.
pub struct NodeRegistry {
    entries: RwLock<HashMap<NodeId, Arc<Registration>>>,
    next_id: AtomicU64,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for a node. Replaces (with a warning) any handler
    /// already registered for the same id.
    pub async fn register(
        &self,
        node: NodeId,
        handler: Arc<dyn NodeHandler>,
        sessions: Arc<StreamCoordinator>,
    ) -> RegistrationId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = handler.kind();
        let registration = Arc::new(Registration {
            id,
            handler,
            sessions,
            running: Mutex::new(()),
        });
        if self
            .entries
            .write()
            .await
            .insert(node.clone(), registration)
            .is_some()
        {
            warn!(node_id = %node, kind = %kind, "Replacing registered node handler");
        }
        id
    }

    /// Remove a node's handler. Returns whether one was registered.
    pub async fn unregister(&self, node: &NodeId) -> bool {
        self.entries.write().await.remove(node).is_some()
    }

    /// Remove a node's handler only if it is still the given registration.
    pub async fn release(&self, node: &NodeId, id: RegistrationId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(node) {
            Some(entry) if entry.id == id => {
                entries.remove(node);
                true
            }
            _ => false,
        }
    }

    pub async fn is_registered(&self, node: &NodeId) -> bool {
        self.entries.read().await.contains_key(node)
    }

    /// Capability tag of a registered node.
    pub async fn kind_of(&self, node: &NodeId) -> Option<NodeKind> {
        self.entries.read().await.get(node).map(|e| e.handler.kind())
    }

    async fn entry(&self, node: &NodeId) -> Result<Arc<Registration>> {
        self.entries
            .read()
            .await
            .get(node)
            .cloned()
            .ok_or_else(|| ThreadloomError::NotRegistered(node.to_string()))
    }

    /// Run a node's handler and wait until its sessions settle.
    ///
    /// Resolves with the node's terminal status, or `None` if the handler
    /// started no session. Stream failures are reported through the status,
    /// not as errors.
    pub async fn execute(&self, node: &NodeId) -> Result<Option<SessionState>> {
        let entry = self.entry(node).await?;
        let _running = entry.running.lock().await;

        entry.handler.execute(node).await?;
        Ok(entry.sessions.wait_settled(node).await)
    }

    /// Ask a node's handler to stop; resolves once cancellation has been
    /// acknowledged.
    pub async fn stop(&self, node: &NodeId) -> Result<()> {
        let entry = self.entry(node).await?;
        entry.handler.stop(node).await
    }

    /// Execute plan entries one at a time.
    ///
    /// Registry errors abort the run. A cancelled node always stops the
    /// run; an errored node stops it under [`FailurePolicy::Abort`].
    pub async fn run_plan(&self, plan: &ExecutionPlan, policy: FailurePolicy) -> PlanRun {
        let mut run = PlanRun::default();
        for node in &plan.nodes {
            match self.execute(node).await {
                Ok(status) => {
                    info!(node_id = %node, status = ?status, "Plan step finished");
                    run.outcomes.push(NodeOutcome {
                        node_id: node.clone(),
                        status,
                    });
                    let stop = match status {
                        Some(SessionState::Cancelled) => true,
                        Some(SessionState::Error) => policy == FailurePolicy::Abort,
                        _ => false,
                    };
                    if stop {
                        run.aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!(node_id = %node, error = %e, "Plan step failed");
                    run.aborted = true;
                    run.error = Some(e.to_string());
                    break;
                }
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use threadloom_core::types::{ControlMessage, GraphId, SessionKey, StartStream, StreamType, TransportEvent};
    use threadloom_test_utils::RecordingTransport;
    use tokio::sync::mpsc;

    /// Starts a single session; the test plays the producer.
    struct Streaming {
        sessions: Arc<StreamCoordinator>,
    }

    impl NodeHandler for Streaming {
        fn kind(&self) -> NodeKind {
            NodeKind::TextGeneration
        }

        fn execute(&self, node: &NodeId) -> BoxFuture<'_, Result<()>> {
            let request = StartStream {
                graph_id: GraphId::from_string("g"),
                node_id: node.clone(),
                model: "m".into(),
                stream_type: StreamType::Generation,
                title: None,
                sub_models: vec![],
            };
            Box::pin(async move { self.sessions.start(request).await })
        }

        fn stop(&self, node: &NodeId) -> BoxFuture<'_, Result<()>> {
            let node = node.clone();
            Box::pin(async move { self.sessions.cancel(&node).await })
        }
    }

    struct Noop;

    impl NodeHandler for Noop {
        fn kind(&self) -> NodeKind {
            NodeKind::Prompt
        }

        fn execute(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn stop(&self, _node: &NodeId) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Producer that finishes each started session with `reply`, or with
    /// an error for nodes named in `failing`.
    fn auto_producer(
        coord: Arc<StreamCoordinator>,
        mut ctl: mpsc::UnboundedReceiver<ControlMessage>,
        failing: &'static [&'static str],
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = ctl.recv().await {
                match message {
                    ControlMessage::Start { key, .. } => {
                        coord
                            .handle_event(TransportEvent::Chunk {
                                key: key.clone(),
                                payload: "out".into(),
                            })
                            .await;
                        let event = if failing.contains(&key.node_id.as_str()) {
                            TransportEvent::Error {
                                key,
                                payload: "boom".into(),
                            }
                        } else {
                            TransportEvent::End { key }
                        };
                        coord.handle_event(event).await;
                    }
                    ControlMessage::Cancel { key } => {
                        coord.handle_event(TransportEvent::CancelAck { key }).await;
                    }
                }
            }
        })
    }

    fn plan(nodes: &[&str]) -> ExecutionPlan {
        ExecutionPlan {
            nodes: nodes.iter().map(|n| NodeId::from(*n)).collect(),
            warnings: vec![],
        }
    }

    #[tokio::test]
    async fn test_execute_unregistered_creates_no_session() {
        let (transport, _ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport.clone());
        let registry = NodeRegistry::new();
        let node = NodeId::from("ghost");

        let err = registry.execute(&node).await.unwrap_err();
        assert!(matches!(err, ThreadloomError::NotRegistered(_)));
        assert!(matches!(
            registry.stop(&node).await,
            Err(ThreadloomError::NotRegistered(_))
        ));
        assert!(coord.sessions(&node).await.is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_execute_waits_for_completion() {
        let (transport, ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport);
        let producer = auto_producer(coord.clone(), ctl, &[]);
        let registry = NodeRegistry::new();
        let node = NodeId::from("t1");
        registry
            .register(node.clone(), Arc::new(Streaming { sessions: coord.clone() }), coord.clone())
            .await;

        let status = registry.execute(&node).await.unwrap();
        assert_eq!(status, Some(SessionState::Complete));
        let session = coord.session(&SessionKey::node(node)).await.unwrap();
        assert_eq!(session.text(), "out");
        producer.abort();
    }

    #[tokio::test]
    async fn test_execute_without_session_resolves_none() {
        let (transport, _ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport);
        let registry = NodeRegistry::new();
        let node = NodeId::from("p1");
        registry.register(node.clone(), Arc::new(Noop), coord).await;
        assert_eq!(registry.execute(&node).await.unwrap(), None);
        assert_eq!(registry.kind_of(&node).await, Some(NodeKind::Prompt));
    }

    #[tokio::test]
    async fn test_stop_resolves_after_ack() {
        let (transport, mut ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport);
        let registry = Arc::new(NodeRegistry::new());
        let node = NodeId::from("t1");
        registry
            .register(node.clone(), Arc::new(Streaming { sessions: coord.clone() }), coord.clone())
            .await;

        let exec = tokio::spawn({
            let registry = registry.clone();
            let node = node.clone();
            async move { registry.execute(&node).await }
        });
        // Start reached the producer; leave it running.
        assert!(matches!(ctl.recv().await, Some(ControlMessage::Start { .. })));

        let stop = tokio::spawn({
            let registry = registry.clone();
            let node = node.clone();
            async move { registry.stop(&node).await }
        });
        let Some(ControlMessage::Cancel { key }) = ctl.recv().await else {
            panic!("expected cancel");
        };
        coord.handle_event(TransportEvent::CancelAck { key }).await;

        stop.await.unwrap().unwrap();
        assert_eq!(exec.await.unwrap().unwrap(), Some(SessionState::Cancelled));
    }

    #[tokio::test]
    async fn test_register_replaces_and_release_is_scoped() {
        let (transport, _ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport);
        let registry = NodeRegistry::new();
        let node = NodeId::from("n");
        let first = registry.register(node.clone(), Arc::new(Noop), coord.clone()).await;
        let second = registry
            .register(node.clone(), Arc::new(Streaming { sessions: coord.clone() }), coord)
            .await;
        assert_ne!(first, second);
        assert_eq!(registry.kind_of(&node).await, Some(NodeKind::TextGeneration));

        assert!(!registry.release(&node, first).await);
        assert!(registry.is_registered(&node).await);
        assert!(registry.release(&node, second).await);
        assert!(!registry.unregister(&node).await);
    }

    #[tokio::test]
    async fn test_run_plan_policies() {
        let (transport, ctl) = RecordingTransport::new();
        let (coord, _out) = StreamCoordinator::new(transport);
        let producer = auto_producer(coord.clone(), ctl, &["b"]);
        let registry = NodeRegistry::new();
        for n in ["a", "b", "c"] {
            registry
                .register(NodeId::from(n), Arc::new(Streaming { sessions: coord.clone() }), coord.clone())
                .await;
        }

        let run = registry.run_plan(&plan(&["a", "b", "c"]), FailurePolicy::Abort).await;
        assert!(run.aborted);
        assert_eq!(run.outcomes.len(), 2);
        assert_eq!(run.outcomes[1].status, Some(SessionState::Error));

        let run = registry.run_plan(&plan(&["a", "b", "c"]), FailurePolicy::Continue).await;
        assert!(!run.aborted);
        let statuses: Vec<_> = run.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![
                Some(SessionState::Complete),
                Some(SessionState::Error),
                Some(SessionState::Complete)
            ]
        );

        let run = registry.run_plan(&plan(&["a", "missing", "c"]), FailurePolicy::Continue).await;
        assert!(run.aborted);
        assert_eq!(run.outcomes.len(), 1);
        assert!(run.error.unwrap().contains("missing"));
        producer.abort();
    }
}
