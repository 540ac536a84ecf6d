use std::path::{Path, PathBuf};

use threadloom_core::config::{AppConfig, StoreBackend};
use threadloom_core::{Edge, Graph, GraphId, HandleCategory, Node, NodeKind};

/// Fluent builder for test graphs. Edge ids are `e1`, `e2`, ... in
/// insertion order.
pub struct GraphBuilder {
    graph: Graph,
    next_edge: usize,
}

impl GraphBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            graph: Graph::new(GraphId::from_string(id)),
            next_edge: 1,
        }
    }

    pub fn node(mut self, id: &str, kind: NodeKind) -> Self {
        self.graph.add_node(Node::new(id, kind));
        self
    }

    pub fn node_at(mut self, id: &str, kind: NodeKind, x: f64, y: f64) -> Self {
        self.graph.add_node(Node::new(id, kind).with_position(x, y));
        self
    }

    /// A node carrying `data.text`, e.g. a prompt or attachment.
    pub fn text_node(mut self, id: &str, kind: NodeKind, text: &str) -> Self {
        self.graph
            .add_node(Node::new(id, kind).with_data(serde_json::json!({ "text": text })));
        self
    }

    pub fn node_with_data(mut self, id: &str, kind: NodeKind, data: serde_json::Value) -> Self {
        self.graph.add_node(Node::new(id, kind).with_data(data));
        self
    }

    pub fn edge(mut self, source: &str, target: &str, category: HandleCategory) -> Self {
        let mut edge = Edge::new(source, target, category);
        edge.id = format!("e{}", self.next_edge);
        self.next_edge += 1;
        self.graph.add_edge(edge);
        self
    }

    pub fn title(mut self, title: &str) -> Self {
        self.graph.title = Some(title.to_string());
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}

/// `P1 --prompt--> T1`
pub fn scenario_a() -> Graph {
    GraphBuilder::new("g-a")
        .text_node("P1", NodeKind::Prompt, "Hello")
        .node("T1", NodeKind::TextGeneration)
        .edge("P1", "T1", HandleCategory::Prompt)
        .build()
}

/// `M1 --context--> T1`, with `M2` unconnected.
pub fn scenario_b() -> Graph {
    GraphBuilder::new("g-b")
        .node_at("M1", NodeKind::TextGeneration, 0.0, 0.0)
        .node_at("M2", NodeKind::TextGeneration, 0.0, 200.0)
        .node_at("T1", NodeKind::TextGeneration, 600.0, 100.0)
        .edge("M1", "T1", HandleCategory::Context)
        .build()
}

/// Config with an in-memory store and open gateway.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.backend = StoreBackend::Memory;
    config.gateway.bind = "127.0.0.1:0".to_string();
    config
}

/// Write `contents` to `dir/config.toml` and return the path.
pub fn write_config(dir: &Path, contents: &str) -> PathBuf {
    let path = dir.join("config.toml");
    std::fs::write(&path, contents).expect("write test config");
    path
}
