use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;

use threadloom_core::config::MergeMode;
use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::graph::Graph;
use threadloom_core::handle::HandleCategory;
use threadloom_core::traits::GraphStore;
use threadloom_core::types::{ChatMessage, NodeId, NodeKind, NodeOutput};

use crate::merge::MergeNodeData;

/// Builds the chat messages a generation node sends to the backend.
///
/// The context chain is walked upstream: every generation node contributes
/// its own turn (prompt + attachments) and its last committed output, and
/// merge nodes combine their branches according to their mode. The node's
/// own turn comes last.
pub struct ContextAssembler {
    store: Arc<dyn GraphStore>,
}

impl ContextAssembler {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    pub async fn messages_for(&self, graph: &Graph, node: &NodeId) -> Result<Vec<ChatMessage>> {
        let target = graph
            .node(node)
            .ok_or_else(|| ThreadloomError::NotFound(format!("node {node} in graph {}", graph.id)))?;
        let outputs = self.upstream_outputs(graph, node).await?;

        let walk = Walk {
            graph,
            outputs: &outputs,
        };
        let mut visited = HashSet::from([node.clone()]);
        let mut messages = Vec::new();
        if let Some(system) = target.data.get("systemPrompt").and_then(|v| v.as_str()) {
            if !system.trim().is_empty() {
                messages.push(ChatMessage::system(system));
            }
        }
        messages.extend(walk.context_input(node, &mut visited));
        if let Some(turn) = walk.own_turn(node) {
            messages.push(ChatMessage::user(turn));
        }

        debug!(graph_id = %graph.id, node_id = %node, messages = messages.len(), "Context assembled");
        Ok(messages)
    }

    /// Last committed output text of every generation node upstream of `node`.
    async fn upstream_outputs(&self, graph: &Graph, node: &NodeId) -> Result<HashMap<NodeId, String>> {
        let mut seen = HashSet::from([node.clone()]);
        let mut queue = VecDeque::from([node.clone()]);
        let mut outputs = HashMap::new();

        while let Some(current) = queue.pop_front() {
            for category in [HandleCategory::Context, HandleCategory::Prompt] {
                for edge in graph.edges_into(&current, category) {
                    if seen.insert(edge.source.clone()) {
                        queue.push_back(edge.source.clone());
                    }
                }
            }
            let is_generation = graph.node(&current).is_some_and(|n| n.kind.is_generation());
            if current != *node && is_generation {
                let history = self.store.outputs(&graph.id, &current).await?;
                if let Some(text) = latest_text(&history) {
                    outputs.insert(current, text);
                }
            }
        }
        Ok(outputs)
    }
}

/// Text of the most recent run with output: latest non-empty text per
/// sub-model, joined in first-seen order. Sub-models of older runs are
/// left out.
fn latest_text(history: &[NodeOutput]) -> Option<String> {
    let with_text = || history.iter().filter(|o| !o.text.is_empty());
    let run = with_text().map(|o| o.started_at).max()?;
    let mut order: Vec<Option<&str>> = Vec::new();
    let mut latest: HashMap<Option<&str>, &str> = HashMap::new();
    for output in with_text().filter(|o| o.started_at == run) {
        let sub = output.sub_model_id.as_deref();
        if !latest.contains_key(&sub) {
            order.push(sub);
        }
        latest.insert(sub, &output.text);
    }
    if order.is_empty() {
        return None;
    }
    let texts: Vec<&str> = order.iter().filter_map(|sub| latest.get(sub).copied()).collect();
    Some(texts.join("\n\n"))
}

struct Walk<'a> {
    graph: &'a Graph,
    outputs: &'a HashMap<NodeId, String>,
}

impl Walk<'_> {
    /// History arriving through the context handle of `node`.
    fn context_input(&self, node: &NodeId, visited: &mut HashSet<NodeId>) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for edge in self.graph.edges_into(node, HandleCategory::Context) {
            messages.extend(self.history_of(&edge.source, visited));
        }
        messages
    }

    fn history_of(&self, node: &NodeId, visited: &mut HashSet<NodeId>) -> Vec<ChatMessage> {
        if !visited.insert(node.clone()) {
            return Vec::new();
        }
        let Some(n) = self.graph.node(node) else {
            return Vec::new();
        };

        match n.kind {
            NodeKind::ContextMerge => {
                let data = MergeNodeData::from_node(n);
                let mut combined = Vec::new();
                for edge in self.graph.edges_into(node, HandleCategory::Context) {
                    let branch = self.history_of(&edge.source, visited);
                    match (data.mode, data.branch_summaries.get(edge.source.as_str())) {
                        (MergeMode::Summary, Some(summary)) => {
                            combined.push(ChatMessage::assistant(summary.clone()));
                        }
                        _ => combined.extend(branch),
                    }
                }
                if data.mode == MergeMode::Recent {
                    let skip = combined.len().saturating_sub(data.recent_count);
                    combined.drain(..skip);
                }
                combined
            }
            kind if kind.is_generation() => {
                let mut messages = self.context_input(node, visited);
                if let Some(turn) = self.own_turn(node) {
                    messages.push(ChatMessage::user(turn));
                }
                if let Some(text) = self.outputs.get(node) {
                    messages.push(ChatMessage::assistant(text.clone()));
                }
                messages
            }
            _ => Vec::new(),
        }
    }

    /// Prompt text plus attachment blocks of `node`.
    fn own_turn(&self, node: &NodeId) -> Option<String> {
        let mut parts = Vec::new();

        if let Some(edge) = self.graph.edges_into(node, HandleCategory::Prompt).first() {
            let prompt = self.graph.node(&edge.source).and_then(|src| match src.kind {
                NodeKind::Routing => self.outputs.get(&src.id).cloned(),
                _ => src.text().map(str::to_string),
            });
            if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
                parts.push(prompt);
            }
        }

        for edge in self.graph.edges_into(node, HandleCategory::Attachment) {
            let Some(src) = self.graph.node(&edge.source) else {
                continue;
            };
            let Some(text) = src.text().filter(|t| !t.trim().is_empty()) else {
                continue;
            };
            let name = src
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(src.id.as_str());
            parts.push(format!("[{name}]\n{text}"));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}
