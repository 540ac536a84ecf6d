use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::{ChatBackend, GraphStore, SessionListener, Transport};
use threadloom_core::types::{
    ChatMessage, ChatRequest, ControlMessage, FinishedSession, SessionKey, StartStream, StreamType,
    TransportEvent,
};
use threadloom_graph::ContextAssembler;

struct Producer {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn GraphStore>,
    assembler: Arc<ContextAssembler>,
    events: mpsc::UnboundedSender<TransportEvent>,
    active: Mutex<HashMap<SessionKey, CancellationToken>>,
}

/// Transport that produces stream output by calling the chat backend.
///
/// Each started session runs as its own task with a cancellation token;
/// events come back on the channel returned by `new`, in production order
/// per session.
pub struct ProviderTransport {
    producer: Arc<Producer>,
    shutdown: CancellationToken,
}

impl ProviderTransport {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<dyn GraphStore>,
        assembler: Arc<ContextAssembler>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            producer: Arc::new(Producer {
                backend,
                store,
                assembler,
                events,
                active: Mutex::new(HashMap::new()),
            }),
            shutdown: CancellationToken::new(),
        });
        (transport, rx)
    }

    /// Stop every running producer.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn start(&self, key: SessionKey, request: StartStream) {
        let token = self.shutdown.child_token();
        if let Ok(mut active) = self.producer.active.lock() {
            active.insert(key.clone(), token.clone());
        }
        let producer = self.producer.clone();
        tokio::spawn(async move { producer.run(key, request, token).await });
    }

    fn cancel(&self, key: SessionKey) {
        let token = self
            .producer
            .active
            .lock()
            .ok()
            .and_then(|active| active.get(&key).cloned());
        match token {
            Some(token) => token.cancel(),
            // Nothing running for this session
            None => self.producer.emit(TransportEvent::CancelAck { key }),
        }
    }
}

impl Transport for ProviderTransport {
    fn send(&self, message: ControlMessage) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.shutdown.is_cancelled() {
                return Err(ThreadloomError::TransportError("transport closed".into()));
            }
            match message {
                ControlMessage::Start { key, request } => self.start(key, request),
                ControlMessage::Cancel { key } => self.cancel(key),
            }
            Ok(())
        })
    }
}

impl Producer {
    fn emit(&self, event: TransportEvent) {
        // The coordinator may already be gone
        let _ = self.events.send(event);
    }

    /// Release the session's token, then send its terminal event.
    fn finish(&self, key: &SessionKey, event: TransportEvent) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(key);
        }
        self.emit(event);
    }

    async fn messages(&self, request: &StartStream) -> Result<Vec<ChatMessage>> {
        let graph = self
            .store
            .load_graph(&request.graph_id)
            .await?
            .ok_or_else(|| ThreadloomError::NotFound(format!("graph {}", request.graph_id)))?;
        self.assembler.messages_for(&graph, &request.node_id).await
    }

    async fn run(&self, key: SessionKey, request: StartStream, token: CancellationToken) {
        let messages = match self.messages(&request).await {
            Ok(messages) => messages,
            Err(e) => {
                self.finish(&key, TransportEvent::Error { key: key.clone(), payload: e.to_string() });
                return;
            }
        };
        let model = key.sub_model_id.clone().unwrap_or_else(|| request.model.clone());
        debug!(session = %key, model = %model, messages = messages.len(), "Producing stream");

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.finish(&key, TransportEvent::CancelAck { key: key.clone() });
                return;
            }
            opened = self.backend.chat_stream(ChatRequest { model, messages }) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %key, error = %e, "Provider stream failed to open");
                self.finish(&key, TransportEvent::Error { key: key.clone(), payload: e.to_string() });
                return;
            }
        };

        let mut text = String::new();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.finish(&key, TransportEvent::CancelAck { key: key.clone() });
                    return;
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        text.push_str(&chunk);
                        self.emit(TransportEvent::Chunk { key: key.clone(), payload: chunk });
                    }
                    Some(Err(e)) => {
                        self.finish(&key, TransportEvent::Error { key: key.clone(), payload: e.to_string() });
                        return;
                    }
                    None => break,
                },
            }
        }

        if request.stream_type == StreamType::Routing {
            self.emit(TransportEvent::RoutingResponse {
                node_id: key.node_id.clone(),
                payload: routing_payload(&text),
            });
        }
        self.finish(&key, TransportEvent::End { key: key.clone() });
    }
}

/// A routing reply is forwarded as-is when it is a JSON object, otherwise
/// wrapped as `{"text": ...}`.
fn routing_payload(text: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(text.trim()) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => serde_json::json!({ "text": text }),
    }
}

/// Commits every finished session to the graph store's history.
pub struct OutputRecorder {
    store: Arc<dyn GraphStore>,
}

impl OutputRecorder {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl SessionListener for OutputRecorder {
    fn on_finished(&self, session: FinishedSession) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.store.record_output(&session.to_output()).await })
    }
}
