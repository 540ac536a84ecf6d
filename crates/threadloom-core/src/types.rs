use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, ThreadloomError};

/// Unique graph identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(pub String);

impl GraphId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Node identifier, unique within one graph.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The closed set of node types a graph may contain.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Prompt,
    Attachment,
    Github,
    TextGeneration,
    ParallelGeneration,
    Routing,
    ContextMerge,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Prompt,
        NodeKind::Attachment,
        NodeKind::Github,
        NodeKind::TextGeneration,
        NodeKind::ParallelGeneration,
        NodeKind::Routing,
        NodeKind::ContextMerge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::Attachment => "attachment",
            Self::Github => "github",
            Self::TextGeneration => "text_generation",
            Self::ParallelGeneration => "parallel_generation",
            Self::Routing => "routing",
            Self::ContextMerge => "context_merge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Nodes that call the model with a single prompt and a single context.
    pub fn is_generation(&self) -> bool {
        matches!(
            self,
            Self::TextGeneration | Self::ParallelGeneration | Self::Routing
        )
    }

    /// Fan-out nodes run several sub-model sessions under one node id.
    pub fn is_fan_out(&self) -> bool {
        matches!(self, Self::ParallelGeneration)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way to follow edges when asking the store for neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeDirection {
    /// Edges whose target is the node.
    Incoming,
    /// Edges whose source is the node.
    Outgoing,
}

/// Direction of an execution plan relative to its start node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "snake_case")]
pub enum PlanDirection {
    #[serde(rename = "self")]
    SelfOnly,
    Upstream,
    Downstream,
    All,
    Multiple { kinds: Vec<NodeKind> },
}

impl PlanDirection {
    /// Parse a direction name as sent by clients. `kinds` is only consulted
    /// for `multiple`, which requires a non-empty filter.
    pub fn parse(direction: &str, kinds: &[NodeKind]) -> Result<Self> {
        match direction {
            "self" => Ok(Self::SelfOnly),
            "upstream" => Ok(Self::Upstream),
            "downstream" => Ok(Self::Downstream),
            "all" => Ok(Self::All),
            "multiple" if kinds.is_empty() => Err(ThreadloomError::InvalidDirection(
                "multiple requires a node kind filter".to_string(),
            )),
            "multiple" => Ok(Self::Multiple {
                kinds: kinds.to_vec(),
            }),
            other => Err(ThreadloomError::InvalidDirection(other.to_string())),
        }
    }

    /// Parse a comma-separated kind list, e.g. `github,attachment`.
    pub fn parse_kinds(list: &str) -> Result<Vec<NodeKind>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                NodeKind::parse(s)
                    .ok_or_else(|| ThreadloomError::InvalidDirection(format!("unknown node kind: {s}")))
            })
            .collect()
    }
}

/// Something the planner noticed but tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanWarning {
    /// Ordering stalled on a cycle; `node` was placed before all of its
    /// in-cycle dependencies were.
    CycleBroken { node: NodeId },
}

/// An ordered, duplicate-free list of nodes to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub nodes: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<PlanWarning>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn position(&self, node: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }
}

/// Identifies one stream session: a node, and for fan-out nodes a sub-model.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_model_id: Option<String>,
}

impl SessionKey {
    pub fn node(node_id: NodeId) -> Self {
        Self {
            node_id,
            sub_model_id: None,
        }
    }

    pub fn sub(node_id: NodeId, sub_model_id: impl Into<String>) -> Self {
        Self {
            node_id,
            sub_model_id: Some(sub_model_id.into()),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sub_model_id {
            Some(sub) => write!(f, "{}/{}", self.node_id, sub),
            None => write!(f, "{}", self.node_id),
        }
    }
}

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Complete,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "streaming" => Some(Self::Streaming),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// What kind of model call a stream carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    #[default]
    Generation,
    Parallel,
    Routing,
    Merge,
}

/// Request to start streaming a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStream {
    pub graph_id: GraphId,
    pub node_id: NodeId,
    pub model: String,
    #[serde(default)]
    pub stream_type: StreamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Sub-model ids for fan-out nodes. Empty means a single session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_models: Vec<String>,
}

/// Control message sent from the coordinator to the transport.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Start producing output for one session.
    Start { key: SessionKey, request: StartStream },
    /// Stop producing output for one session; the transport answers with
    /// `TransportEvent::CancelAck` once the producer has stopped.
    Cancel { key: SessionKey },
}

/// Event arriving from the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Chunk { key: SessionKey, payload: String },
    End { key: SessionKey },
    Error { key: SessionKey, payload: String },
    CancelAck { key: SessionKey },
    RoutingResponse { node_id: NodeId, payload: serde_json::Value },
    NodeDataUpdate { node_id: NodeId, payload: serde_json::Value },
}

impl TransportEvent {
    /// The session this event belongs to, if it is session-scoped.
    pub fn key(&self) -> Option<&SessionKey> {
        match self {
            Self::Chunk { key, .. }
            | Self::End { key }
            | Self::Error { key, .. }
            | Self::CancelAck { key } => Some(key),
            Self::RoutingResponse { .. } | Self::NodeDataUpdate { .. } => None,
        }
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the model backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// A request to the model backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// The committed result of a stream session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutput {
    pub graph_id: GraphId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_model_id: Option<String>,
    pub model: String,
    pub text: String,
    pub status: SessionState,
    /// Start of the run that produced this output, shared by its sub-models.
    pub started_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

/// Snapshot of a session that just reached a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedSession {
    pub graph_id: GraphId,
    pub key: SessionKey,
    pub model: String,
    pub text: String,
    pub status: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FinishedSession {
    /// History record for this session.
    pub fn to_output(&self) -> NodeOutput {
        NodeOutput {
            graph_id: self.graph_id.clone(),
            node_id: self.key.node_id.clone(),
            sub_model_id: self.key.sub_model_id.clone(),
            model: self.model.clone(),
            text: self.text.clone(),
            status: self.status,
            started_at: self.started_at,
            recorded_at: self.finished_at,
        }
    }
}
