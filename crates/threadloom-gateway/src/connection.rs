use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::event::GraphEvent;
use threadloom_core::Graph;
use threadloom_core::types::{ExecutionPlan, GraphId, NodeId, PlanDirection, StartStream};
use threadloom_graph::{regenerate_title, TitleStrategy};
use threadloom_stream::{handler_for, PlanRun, RegistrationId, StreamCoordinator};

use crate::lane::LaneQueue;
use crate::protocol::{ClientMessage, PlanRequest, ServerMessage};
use crate::state::AppState;
use crate::transport::{OutputRecorder, ProviderTransport};

/// One connected client: its coordinator plus the bookkeeping needed to
/// tear it down.
struct Client {
    state: Arc<AppState>,
    coordinator: Arc<StreamCoordinator>,
    recorder: Arc<OutputRecorder>,
    ws_tx: Mutex<SplitSink<WebSocket, Message>>,
    /// Graphs this client touched; bus events for them are forwarded.
    graphs: Mutex<HashSet<GraphId>>,
    /// Nodes whose finished sessions are already being recorded.
    recorded: Mutex<HashSet<NodeId>>,
    registrations: Mutex<Vec<(NodeId, RegistrationId)>>,
}

impl Client {
    async fn send<T: Serialize>(&self, frame: &T) -> bool {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize frame");
                return true;
            }
        };
        self.ws_tx.lock().await.send(Message::Text(json.into())).await.is_ok()
    }

    async fn send_error(&self, err: &ThreadloomError, node: Option<NodeId>) {
        self.send(&ServerMessage::error(err, node)).await;
    }

    async fn watch(&self, graph: &GraphId) {
        self.graphs.lock().await.insert(graph.clone());
    }

    async fn record(&self, node: &NodeId) {
        if self.recorded.lock().await.insert(node.clone()) {
            self.coordinator.subscribe(node.clone(), self.recorder.clone()).await;
        }
    }

    async fn start(&self, request: StartStream) {
        self.watch(&request.graph_id).await;
        self.record(&request.node_id).await;
        let node = request.node_id.clone();
        if let Err(e) = self.coordinator.start(request).await {
            self.send_error(&e, Some(node)).await;
        }
    }

    async fn regenerate_title(&self, graph_id: GraphId, strategy: TitleStrategy) -> Result<()> {
        self.watch(&graph_id).await;
        let state = &self.state;
        let graph = self.load_graph(&graph_id).await?;
        let title = regenerate_title(
            state.backend.as_ref(),
            state.store.as_ref(),
            &graph,
            strategy,
            state.config.provider.title_model(),
        )
        .await?;

        // Reload so edits made while the title was generating survive
        let write = state.lock_graph(&graph_id).await;
        let mut graph = self.load_graph(&graph_id).await?;
        graph.title = Some(title.clone());
        state.store.save_graph(&graph).await?;
        drop(write);
        state.event_bus.publish(GraphEvent::TitleChanged { graph_id, title });
        Ok(())
    }

    async fn load_graph(&self, graph_id: &GraphId) -> Result<Graph> {
        self.state
            .store
            .load_graph(graph_id)
            .await?
            .ok_or_else(|| ThreadloomError::NotFound(format!("graph {graph_id}")))
    }

    /// Plan, register handlers for the planned nodes, run, release.
    async fn run_plan(&self, request: &PlanRequest) -> Result<(ExecutionPlan, PlanRun)> {
        let state = &self.state;
        let kinds = PlanDirection::parse_kinds(request.kinds.as_deref().unwrap_or(""))?;
        let direction = PlanDirection::parse(&request.direction, &kinds)?;
        let plan = state
            .planner
            .plan(&request.graph_id, &request.node_id, &direction)
            .await?;
        let graph = state
            .store
            .load_graph(&request.graph_id)
            .await?
            .ok_or_else(|| ThreadloomError::NotFound(format!("graph {}", request.graph_id)))?;

        let mut mounted = Vec::with_capacity(plan.len());
        for id in &plan.nodes {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let handler = handler_for(
                node,
                &graph.id,
                self.coordinator.clone(),
                &state.config.provider.default_model,
            );
            let registration = state
                .registry
                .register(id.clone(), handler, self.coordinator.clone())
                .await;
            self.record(id).await;
            mounted.push((id.clone(), registration));
        }
        self.registrations.lock().await.extend(mounted.iter().cloned());

        info!(graph_id = %request.graph_id, node_id = %request.node_id, steps = plan.len(), "Running plan");
        let run = state.registry.run_plan(&plan, request.failure_policy).await;

        for (id, registration) in &mounted {
            state.registry.release(id, *registration).await;
        }
        self.registrations
            .lock()
            .await
            .retain(|entry| !mounted.contains(entry));
        Ok((plan, run))
    }

    async fn release_all(&self) {
        let registrations = std::mem::take(&mut *self.registrations.lock().await);
        for (id, registration) in registrations {
            self.state.registry.release(&id, registration).await;
        }
    }
}

/// Handle a single WebSocket connection.
pub async fn handle_connection(ws: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = ws.split();

    let (transport, transport_events) =
        ProviderTransport::new(state.backend.clone(), state.store.clone(), state.assembler.clone());
    let (coordinator, mut stream_events) = StreamCoordinator::new(transport.clone());

    let client = Arc::new(Client {
        recorder: Arc::new(OutputRecorder::new(state.store.clone())),
        state: state.clone(),
        coordinator: coordinator.clone(),
        ws_tx: Mutex::new(ws_tx),
        graphs: Mutex::new(HashSet::new()),
        recorded: Mutex::new(HashSet::new()),
        registrations: Mutex::new(Vec::new()),
    });

    // Apply transport events to sessions in arrival order
    let pump_task = tokio::spawn(coordinator.clone().run(transport_events));

    // Forward stream events to the socket
    let stream_client = client.clone();
    let stream_task = tokio::spawn(async move {
        while let Some(event) = stream_events.recv().await {
            if !stream_client.send(&event).await {
                break;
            }
        }
    });

    // Forward graph events for graphs this client touched
    let mut bus_rx = state.event_bus.subscribe();
    let bus_client = client.clone();
    let bus_task = tokio::spawn(async move {
        loop {
            let event = match bus_rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Graph event subscriber lagged");
                    continue;
                }
                Err(_) => break,
            };
            if !bus_client.graphs.lock().await.contains(event.graph_id()) {
                continue;
            }
            if !bus_client.send(&ServerMessage::from(event)).await {
                break;
            }
        }
    });

    // Plan runs execute one at a time per connection
    let (lane, mut lane_rx) = LaneQueue::new(16);
    let lane_client = client.clone();
    let lane_task = tokio::spawn(async move {
        while let Some(request) = lane_rx.recv().await {
            let frame = match lane_client.run_plan(&request).await {
                Ok((plan, run)) => ServerMessage::PlanResult {
                    graph_id: request.graph_id.clone(),
                    node_id: request.node_id.clone(),
                    plan,
                    run,
                },
                Err(e) => ServerMessage::error(&e, Some(request.node_id.clone())),
            };
            lane_client.send(&frame).await;
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let message: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        client
                            .send(&ServerMessage::parse_error(format!("Parse error: {e}")))
                            .await;
                        continue;
                    }
                };
                dispatch(&client, &lane, message).await;
            }
            Message::Close(_) => break,
            Message::Ping(data) => {
                let _ = client.ws_tx.lock().await.send(Message::Pong(data)).await;
            }
            _ => {}
        }
    }

    transport.shutdown();
    lane_task.abort();
    client.release_all().await;
    coordinator.fail_all("client disconnected").await;
    pump_task.abort();
    bus_task.abort();
    stream_task.abort();
    debug!("Connection closed");
}

async fn dispatch(client: &Arc<Client>, lane: &LaneQueue, message: ClientMessage) {
    match message {
        ClientMessage::StartStream(request) => client.start(request).await,
        ClientMessage::CancelStream { node_id } => {
            // Waits for acknowledgment; keep reading meanwhile
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.coordinator.cancel(&node_id).await {
                    client.send_error(&e, Some(node_id)).await;
                }
            });
        }
        ClientMessage::RegenerateTitle { graph_id, strategy } => {
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = client.regenerate_title(graph_id, strategy).await {
                    warn!(error = %e, "Title regeneration failed");
                    client.send_error(&e, None).await;
                }
            });
        }
        ClientMessage::RunPlan(request) => {
            client.watch(&request.graph_id).await;
            let node = request.node_id.clone();
            if !lane.submit(request) {
                let err = ThreadloomError::Gateway("plan queue is full".into());
                client.send_error(&err, Some(node)).await;
            }
        }
    }
}
