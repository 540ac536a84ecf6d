use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info};

use threadloom_core::error::ThreadloomError;
use threadloom_core::event::GraphEvent;
use threadloom_core::graph::{Connection, Graph};
use threadloom_core::types::{GraphId, NodeId, PlanDirection};
use threadloom_graph::ConnectOutcome;

use crate::auth;
use crate::connection;
use crate::middleware::Authenticated;
use crate::state::AppState;

/// Error response carrying the error kind and message.
pub enum ApiError {
    Forbidden,
    Failed(ThreadloomError),
}

impl From<ThreadloomError> for ApiError {
    fn from(e: ThreadloomError) -> Self {
        Self::Failed(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            Self::Forbidden => return StatusCode::FORBIDDEN.into_response(),
            Self::Failed(err) => err,
        };
        let status = match &err {
            ThreadloomError::NotFound(_) | ThreadloomError::NotRegistered(_) => StatusCode::NOT_FOUND,
            ThreadloomError::InvalidDirection(_)
            | ThreadloomError::IncompatibleHandle { .. }
            | ThreadloomError::Json(_) => StatusCode::BAD_REQUEST,
            ThreadloomError::HandleCapacityViolation { .. } | ThreadloomError::SessionBusy(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": err.kind(),
            "message": err.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn require_viewer(auth_result: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_viewer_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

fn require_operator(auth_result: &auth::AuthResult) -> ApiResult<()> {
    if auth::has_operator_access(&auth_result.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

async fn load(state: &AppState, graph_id: &GraphId) -> ApiResult<Graph> {
    state
        .store
        .load_graph(graph_id)
        .await?
        .ok_or_else(|| ApiError::Failed(ThreadloomError::NotFound(format!("graph {graph_id}"))))
}

// GET /api/health (no auth)
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// GET /api/graphs (Viewer+)
pub async fn list_graphs(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    require_viewer(&auth_result)?;
    let graphs = state.store.list_graphs().await?;
    Ok(Json(serde_json::json!({ "graphs": graphs })))
}

// GET /api/graphs/{id} (Viewer+)
pub async fn get_graph(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Graph>> {
    require_viewer(&auth_result)?;
    Ok(Json(load(&state, &GraphId::from_string(&id)).await?))
}

// PUT /api/graphs/{id} (Operator+)
pub async fn put_graph(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut graph): Json<Graph>,
) -> ApiResult<StatusCode> {
    require_operator(&auth_result)?;
    graph.id = GraphId::from_string(&id);
    let _write = state.lock_graph(&graph.id).await;
    state.store.save_graph(&graph).await?;
    info!(graph_id = %graph.id, nodes = graph.nodes.len(), edges = graph.edges.len(), "Graph saved");
    state.event_bus.publish(GraphEvent::GraphChanged { graph_id: graph.id });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PlanQuery {
    pub node_id: String,
    pub direction: String,
    #[serde(default)]
    pub kinds: Option<String>,
}

// GET /api/graphs/{id}/plan?node_id=&direction=&kinds= (Viewer+)
pub async fn plan(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<PlanQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    require_viewer(&auth_result)?;
    let kinds = PlanDirection::parse_kinds(q.kinds.as_deref().unwrap_or(""))?;
    let direction = PlanDirection::parse(&q.direction, &kinds)?;
    let plan = state
        .planner
        .plan(&GraphId::from_string(&id), &NodeId::from(q.node_id.as_str()), &direction)
        .await?;
    debug!(graph_id = %id, steps = plan.len(), "Plan computed");
    Ok(Json(serde_json::json!({
        "nodes": plan.nodes,
        "warnings": plan.warnings,
    })))
}

// POST /api/graphs/{id}/connect (Operator+)
pub async fn connect(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(conn): Json<Connection>,
) -> ApiResult<Json<ConnectOutcome>> {
    require_operator(&auth_result)?;
    let graph_id = GraphId::from_string(&id);
    let write = state.lock_graph(&graph_id).await;
    let mut graph = load(&state, &graph_id).await?;
    let result = state.merger.connect(&conn, &mut graph)?;
    if !matches!(result, ConnectOutcome::Existing { .. }) {
        state.store.save_graph(&graph).await?;
    }
    drop(write);

    match &result {
        ConnectOutcome::Merged { merge, inserted } => {
            state.event_bus.publish(GraphEvent::MergePlaced {
                graph_id: graph_id.clone(),
                merge_node: merge.clone(),
                target: conn.target.clone(),
                inserted: *inserted,
            });
            state.event_bus.publish(GraphEvent::GraphChanged { graph_id });
        }
        ConnectOutcome::Added { .. } => {
            state.event_bus.publish(GraphEvent::GraphChanged { graph_id });
        }
        ConnectOutcome::Existing { .. } => {}
    }
    Ok(Json(result))
}

// DELETE /api/graphs/{id}/edges/{edge_id} (Operator+)
pub async fn delete_edge(
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, edge_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    require_operator(&auth_result)?;
    let graph_id = GraphId::from_string(&id);
    let write = state.lock_graph(&graph_id).await;
    let mut graph = load(&state, &graph_id).await?;
    let edge = state.merger.disconnect(&edge_id, &mut graph)?;
    state.store.save_graph(&graph).await?;
    drop(write);
    debug!(graph_id = %graph_id, edge_id = %edge.id, "Edge deleted");

    state.event_bus.publish(GraphEvent::GraphChanged { graph_id });
    Ok(StatusCode::NO_CONTENT)
}

// GET /ws (Operator+)
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Authenticated(auth_result): Authenticated,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(e) = require_operator(&auth_result) {
        return e.into_response();
    }
    info!(client = %auth_result.name, "WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    connection::handle_connection(socket, state).await;
    debug!("WebSocket client disconnected");
}
