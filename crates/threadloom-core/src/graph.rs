use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::handle::{HandleCategory, HandleId};
use crate::types::{EdgeDirection, GraphId, NodeId, NodeKind};

/// Canvas position. Owned by the UI; the engine only reads it when placing
/// synthesized nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A node in a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Kind-specific payload (prompt text, merge settings, model list, ...).
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId(id.into()),
            kind,
            position: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// `data.text` as a string, if present.
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(|v| v.as_str())
    }
}

/// A directed data edge between two node handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: NodeId,
    pub target_handle: String,
}

impl Edge {
    /// Edge into the `category` handle of `target`.
    pub fn new(source: impl Into<String>, target: impl Into<String>, category: HandleCategory) -> Self {
        let target = NodeId(target.into());
        Self {
            id: Uuid::new_v4().to_string(),
            source: NodeId(source.into()),
            source_handle: None,
            target_handle: HandleId::new(category, target.clone()).to_string(),
            target,
        }
    }

    pub fn target_handle_id(&self) -> Result<HandleId> {
        HandleId::parse(&self.target_handle)
    }

    /// Whether this edge lands on `handle` of `target`.
    pub fn lands_on(&self, target: &NodeId, handle: &str) -> bool {
        &self.target == target && self.target_handle == handle
    }

    /// Whether this edge is the realisation of `conn`.
    pub fn matches(&self, conn: &Connection) -> bool {
        self.source == conn.source
            && self.target == conn.target
            && self.target_handle == conn.target_handle
            && (conn.source_handle.is_none() || self.source_handle == conn.source_handle)
    }
}

/// A proposed edge, as the canvas hands it over before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub source: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    pub target: NodeId,
    pub target_handle: String,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>, category: HandleCategory) -> Self {
        let target = NodeId(target.into());
        Self {
            source: NodeId(source.into()),
            source_handle: None,
            target_handle: HandleId::new(category, target.clone()).to_string(),
            target,
        }
    }

    pub fn into_edge(self) -> Edge {
        Edge {
            id: Uuid::new_v4().to_string(),
            source: self.source,
            source_handle: self.source_handle,
            target: self.target,
            target_handle: self.target_handle,
        }
    }
}

/// A graph snapshot: nodes in insertion order plus edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub id: GraphId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            title: None,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    /// Remove an edge by id, returning it.
    pub fn remove_edge(&mut self, id: &str) -> Option<Edge> {
        let idx = self.edges.iter().position(|e| e.id == id)?;
        Some(self.edges.remove(idx))
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| &n.id == id)?;
        self.edges.retain(|e| &e.source != id && &e.target != id);
        Some(self.nodes.remove(idx))
    }

    /// Edges touching `node` in the given direction, in insertion order.
    pub fn incident(&self, node: &NodeId, direction: EdgeDirection) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| match direction {
                EdgeDirection::Incoming => &e.target == node,
                EdgeDirection::Outgoing => &e.source == node,
            })
            .collect()
    }

    /// Incoming edges of `node` landing on a handle of `category`.
    pub fn edges_into(&self, node: &NodeId, category: HandleCategory) -> Vec<&Edge> {
        let handle = HandleId::new(category, node.clone()).to_string();
        self.edges
            .iter()
            .filter(|e| e.lands_on(node, &handle))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Graph {
        let mut g = Graph::new(GraphId::from_string("g1"));
        g.add_node(Node::new("p1", NodeKind::Prompt));
        g.add_node(Node::new("t1", NodeKind::TextGeneration));
        g.add_node(Node::new("t2", NodeKind::TextGeneration));
        g.add_edge(Edge::new("p1", "t1", HandleCategory::Prompt));
        g.add_edge(Edge::new("t1", "t2", HandleCategory::Context));
        g
    }

    #[test]
    fn test_incident_edges() {
        let g = sample();
        let t1 = NodeId::from("t1");
        assert_eq!(g.incident(&t1, EdgeDirection::Incoming).len(), 1);
        assert_eq!(g.incident(&t1, EdgeDirection::Outgoing).len(), 1);
        assert_eq!(g.edges_into(&NodeId::from("t2"), HandleCategory::Context).len(), 1);
        assert!(g.edges_into(&t1, HandleCategory::Context).is_empty());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut g = sample();
        g.remove_node(&NodeId::from("t1")).unwrap();
        assert!(g.edges.is_empty());
        assert_eq!(g.nodes.len(), 2);
    }

    #[test]
    fn test_edge_matches_connection() {
        let conn = Connection::new("t1", "t2", HandleCategory::Context);
        let edge = conn.clone().into_edge();
        assert!(edge.matches(&conn));
        assert_eq!(edge.target_handle, "context_t2");
        assert!(!Edge::new("p1", "t2", HandleCategory::Context).matches(&conn));
    }

    #[test]
    fn test_graph_json_shape() {
        let json = r#"{
            "id": "g1",
            "nodes": [{"id": "p1", "kind": "prompt", "data": {"text": "hi"}}],
            "edges": [{"id": "e1", "source": "p1", "target": "t1", "targetHandle": "prompt_t1"}]
        }"#;
        let g: Graph = serde_json::from_str(json).unwrap();
        assert_eq!(g.node(&NodeId::from("p1")).unwrap().text(), Some("hi"));
        assert_eq!(g.edges[0].target_handle_id().unwrap().category, HandleCategory::Prompt);
    }
}
