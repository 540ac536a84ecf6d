use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::{SessionListener, Transport};
use threadloom_core::types::{
    ControlMessage, FinishedSession, NodeId, SessionKey, SessionState, StartStream, TransportEvent,
};

use crate::session::{aggregate_status, StreamSession};

/// Outbound event for the client, tagged by node and sub-model.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    StreamChunk {
        node_id: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_model_id: Option<String>,
        payload: String,
    },
    /// A sub-session finished (`sub_model_id` set), or the whole node did.
    #[serde(rename_all = "camelCase")]
    StreamEnd {
        node_id: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_model_id: Option<String>,
        status: SessionState,
    },
    #[serde(rename_all = "camelCase")]
    StreamError {
        node_id: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        sub_model_id: Option<String>,
        payload: String,
    },
    #[serde(rename_all = "camelCase")]
    RoutingResponse {
        node_id: NodeId,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    NodeDataUpdate {
        node_id: NodeId,
        payload: serde_json::Value,
    },
}

/// Sessions of one node plus its completion signal.
struct NodeSlot {
    sessions: Mutex<Vec<StreamSession>>,
    /// Bumped under the sessions lock on every start and clear. A finish
    /// only publishes the node status if no newer run replaced its sessions.
    generation: AtomicU64,
    status: watch::Sender<SessionState>,
}

impl NodeSlot {
    fn new() -> Self {
        let (status, _) = watch::channel(SessionState::Idle);
        Self {
            sessions: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            status,
        }
    }
}

/// Per-client stream multiplexer.
///
/// Control messages go out through the transport; transport events come
/// back through [`StreamCoordinator::run`] (or `handle_event` directly) and
/// are applied to the sessions in arrival order. Each node has its own slot
/// with its own lock, so work on one node never waits on another.
pub struct StreamCoordinator {
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<StreamEvent>,
    nodes: Mutex<HashMap<NodeId, Arc<NodeSlot>>>,
    listeners: Mutex<HashMap<NodeId, Vec<Arc<dyn SessionListener>>>>,
}

impl StreamCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            transport,
            outbound,
            nodes: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        });
        (coordinator, rx)
    }

    /// Apply transport events until the channel closes, then fail every
    /// session still streaming.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        self.fail_all("transport closed").await;
    }

    async fn slot(&self, node: &NodeId) -> Arc<NodeSlot> {
        let mut nodes = self.nodes.lock().await;
        nodes
            .entry(node.clone())
            .or_insert_with(|| Arc::new(NodeSlot::new()))
            .clone()
    }

    async fn existing_slot(&self, node: &NodeId) -> Option<Arc<NodeSlot>> {
        self.nodes.lock().await.get(node).cloned()
    }

    fn emit(&self, event: StreamEvent) {
        // The client may already be gone
        let _ = self.outbound.send(event);
    }

    /// Start fresh session(s) for a node: one per sub-model, or a single
    /// one when no sub-models are given.
    pub async fn start(&self, request: StartStream) -> Result<()> {
        let node = request.node_id.clone();
        let keys: Vec<SessionKey> = if request.sub_models.is_empty() {
            vec![SessionKey::node(node.clone())]
        } else {
            request
                .sub_models
                .iter()
                .map(|m| SessionKey::sub(node.clone(), m.clone()))
                .collect()
        };

        let slot = self.slot(&node).await;
        {
            let mut sessions = slot.sessions.lock().await;
            if sessions.iter().any(|s| s.is_streaming()) {
                return Err(ThreadloomError::SessionBusy(node.to_string()));
            }
            let started_at = Utc::now();
            *sessions = keys
                .iter()
                .map(|key| {
                    let model = key.sub_model_id.as_deref().unwrap_or(&request.model);
                    let mut session = StreamSession::new(key.clone(), request.graph_id.clone(), model);
                    session.begin(started_at);
                    session
                })
                .collect();
            slot.generation.fetch_add(1, Ordering::SeqCst);
            slot.status.send_replace(SessionState::Streaming);
        }

        info!(node_id = %node, sessions = keys.len(), stream_type = ?request.stream_type, "Stream started");

        for key in keys {
            let message = ControlMessage::Start {
                key: key.clone(),
                request: request.clone(),
            };
            if let Err(e) = self.transport.send(message).await {
                warn!(session = %key, error = %e, "Failed to dispatch stream start");
                self.handle_event(TransportEvent::Error {
                    key,
                    payload: e.to_string(),
                })
                .await;
            }
        }
        Ok(())
    }

    /// Cancel every streaming sub-session of a node and wait until all of
    /// them are terminal. A no-op for nodes that are not streaming.
    pub async fn cancel(&self, node: &NodeId) -> Result<()> {
        let Some(slot) = self.existing_slot(node).await else {
            return Ok(());
        };
        let mut status = slot.status.subscribe();

        let keys: Vec<SessionKey> = {
            let mut sessions = slot.sessions.lock().await;
            sessions
                .iter_mut()
                .filter_map(|s| s.request_cancel().then(|| s.key().clone()))
                .collect()
        };
        if !keys.is_empty() {
            info!(node_id = %node, sessions = keys.len(), "Cancelling stream");
        }

        for key in keys {
            if let Err(e) = self.transport.send(ControlMessage::Cancel { key: key.clone() }).await {
                warn!(session = %key, error = %e, "Failed to dispatch cancel");
                self.handle_event(TransportEvent::Error {
                    key,
                    payload: e.to_string(),
                })
                .await;
            }
        }

        let _ = status.wait_for(|s| *s != SessionState::Streaming).await;
        Ok(())
    }

    /// Resolve once the node is not streaming. Returns its terminal status,
    /// or `None` if it has no sessions.
    pub async fn wait_settled(&self, node: &NodeId) -> Option<SessionState> {
        let slot = self.existing_slot(node).await?;
        let mut status = slot.status.subscribe();
        let state = *status.wait_for(|s| *s != SessionState::Streaming).await.ok()?;
        (state != SessionState::Idle).then_some(state)
    }

    /// Aggregate status of a node (`idle` if it never streamed).
    pub async fn node_status(&self, node: &NodeId) -> SessionState {
        match self.existing_slot(node).await {
            Some(slot) => *slot.status.borrow(),
            None => SessionState::Idle,
        }
    }

    /// Snapshot of one session.
    pub async fn session(&self, key: &SessionKey) -> Option<StreamSession> {
        let slot = self.existing_slot(&key.node_id).await?;
        let sessions = slot.sessions.lock().await;
        sessions.iter().find(|s| s.key() == key).cloned()
    }

    /// Snapshots of all sessions of a node.
    pub async fn sessions(&self, node: &NodeId) -> Vec<StreamSession> {
        match self.existing_slot(node).await {
            Some(slot) => slot.sessions.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Discard a node's terminal sessions. Refused while streaming.
    pub async fn clear(&self, node: &NodeId) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        let Some(slot) = nodes.get(node).cloned() else {
            return Ok(());
        };
        let mut sessions = slot.sessions.lock().await;
        if sessions.iter().any(|s| s.is_streaming()) {
            return Err(ThreadloomError::SessionBusy(node.to_string()));
        }
        sessions.clear();
        slot.generation.fetch_add(1, Ordering::SeqCst);
        slot.status.send_replace(SessionState::Idle);
        nodes.remove(node);
        Ok(())
    }

    /// Register a listener for one node's sessions.
    pub async fn subscribe(&self, node: NodeId, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().await.entry(node).or_default().push(listener);
    }

    /// Drop every listener of a node.
    pub async fn unsubscribe_all(&self, node: &NodeId) {
        self.listeners.lock().await.remove(node);
    }

    async fn listeners_of(&self, node: &NodeId) -> Vec<Arc<dyn SessionListener>> {
        self.listeners
            .lock()
            .await
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply one transport event.
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Chunk { key, payload } => self.on_chunk(key, payload).await,
            TransportEvent::End { key } => {
                self.finish(key, |s| s.complete()).await;
            }
            TransportEvent::Error { key, payload } => {
                let emitted = payload.clone();
                let event_key = key.clone();
                let changed = self.finish(key, move |s| s.fail(payload)).await;
                if changed {
                    self.emit(StreamEvent::StreamError {
                        node_id: event_key.node_id,
                        sub_model_id: event_key.sub_model_id,
                        payload: emitted,
                    });
                }
            }
            TransportEvent::CancelAck { key } => {
                self.finish(key, |s| s.acknowledge_cancel()).await;
            }
            TransportEvent::RoutingResponse { node_id, payload } => {
                self.emit(StreamEvent::RoutingResponse { node_id, payload });
            }
            TransportEvent::NodeDataUpdate { node_id, payload } => {
                self.emit(StreamEvent::NodeDataUpdate { node_id, payload });
            }
        }
    }

    async fn on_chunk(&self, key: SessionKey, payload: String) {
        let Some(slot) = self.existing_slot(&key.node_id).await else {
            debug!(session = %key, "Chunk for unknown node dropped");
            return;
        };
        let accepted = {
            let mut sessions = slot.sessions.lock().await;
            sessions
                .iter_mut()
                .find(|s| s.key() == &key)
                .is_some_and(|s| s.append(&payload))
        };
        if !accepted {
            debug!(session = %key, "Chunk for inactive session dropped");
            return;
        }
        for listener in self.listeners_of(&key.node_id).await {
            listener.on_chunk(&key, &payload);
        }
        self.emit(StreamEvent::StreamChunk {
            node_id: key.node_id,
            sub_model_id: key.sub_model_id,
            payload,
        });
    }

    /// Move one session to a terminal state. Emits `stream_end` for the
    /// session and, once every sub-session is terminal, for the node;
    /// listeners see the finished session before waiters are released.
    async fn finish(
        &self,
        key: SessionKey,
        transition: impl FnOnce(&mut StreamSession) -> bool,
    ) -> bool {
        let Some(slot) = self.existing_slot(&key.node_id).await else {
            debug!(session = %key, "Event for unknown node dropped");
            return false;
        };

        let (finished, fan_out, node_state, generation) = {
            let mut sessions = slot.sessions.lock().await;
            let Some(session) = sessions.iter_mut().find(|s| s.key() == &key) else {
                debug!(session = %key, "Event for unknown session dropped");
                return false;
            };
            if !transition(session) {
                return false;
            }
            let finished = session.finished();
            (
                finished,
                key.sub_model_id.is_some(),
                aggregate_status(&sessions),
                slot.generation.load(Ordering::SeqCst),
            )
        };

        let status = finished.as_ref().map(|f| f.status).unwrap_or(SessionState::Error);
        info!(session = %key, status = status.as_str(), "Stream session finished");

        if fan_out {
            self.emit(StreamEvent::StreamEnd {
                node_id: key.node_id.clone(),
                sub_model_id: key.sub_model_id.clone(),
                status,
            });
        }

        if let Some(finished) = finished {
            self.notify_finished(&key.node_id, finished).await;
        }

        if node_state.is_terminal() {
            self.emit(StreamEvent::StreamEnd {
                node_id: key.node_id.clone(),
                sub_model_id: None,
                status: node_state,
            });
            // Listeners ran unlocked; a restart in that window owns the status now
            let _sessions = slot.sessions.lock().await;
            if slot.generation.load(Ordering::SeqCst) == generation {
                slot.status.send_replace(node_state);
            } else {
                debug!(node_id = %key.node_id, "Node restarted before its end was published");
            }
        }
        true
    }

    async fn notify_finished(&self, node: &NodeId, finished: FinishedSession) {
        for listener in self.listeners_of(node).await {
            if let Err(e) = listener.on_finished(finished.clone()).await {
                warn!(session = %finished.key, error = %e, "Session listener failed");
            }
        }
    }

    /// Fail every streaming session, keeping partial text. Used when the
    /// transport is lost.
    pub async fn fail_all(&self, reason: &str) {
        let slots: Vec<Arc<NodeSlot>> = self.nodes.lock().await.values().cloned().collect();
        let payload = ThreadloomError::TransportError(reason.to_string()).to_string();
        for slot in slots {
            let keys: Vec<SessionKey> = slot
                .sessions
                .lock()
                .await
                .iter()
                .filter(|s| s.is_streaming())
                .map(|s| s.key().clone())
                .collect();
            for key in keys {
                self.handle_event(TransportEvent::Error {
                    key,
                    payload: payload.clone(),
                })
                .await;
            }
        }
    }
}
