//! Context merging.
//!
//! A generation node takes exactly one context edge. When a second branch
//! is connected into that handle, the merger rewrites the topology so that
//! both branches feed a `context_merge` node which in turn feeds the
//! target. Every rewrite is staged on a copy of the graph and committed
//! only if the result still respects handle capacities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use threadloom_core::config::{MergeConfig, MergeMode};
use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::graph::{Connection, Edge, Graph, Node, Position};
use threadloom_core::handle::{input_categories, HandleCategory, HandleId};
use threadloom_core::types::{NodeId, NodeKind};

/// Payload of a `context_merge` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeNodeData {
    #[serde(default)]
    pub mode: MergeMode,
    #[serde(default = "default_recent_count")]
    pub recent_count: usize,
    /// Summary per branch, keyed by branch source node id.
    #[serde(default)]
    pub branch_summaries: BTreeMap<String, String>,
}

fn default_recent_count() -> usize {
    MergeConfig::default().recent_count
}

impl Default for MergeNodeData {
    fn default() -> Self {
        Self {
            mode: MergeMode::default(),
            recent_count: default_recent_count(),
            branch_summaries: BTreeMap::new(),
        }
    }
}

impl MergeNodeData {
    /// Read a merge node's payload, falling back to defaults for missing
    /// or malformed fields.
    pub fn from_node(node: &Node) -> Self {
        serde_json::from_value(node.data.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// What `place_merge` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// No merge needed, or the connection is already merged.
    Unchanged,
    /// The branch joined an existing merge node.
    Absorbed { merge: NodeId },
    /// A new merge node was created.
    Inserted { merge: NodeId },
}

impl MergeOutcome {
    pub fn merge_node(&self) -> Option<&NodeId> {
        match self {
            Self::Unchanged => None,
            Self::Absorbed { merge } | Self::Inserted { merge } => Some(merge),
        }
    }
}

/// What `connect` did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// The edge was added as proposed.
    Added { edge: Edge },
    /// An identical edge already existed.
    Existing { edge: Edge },
    /// The connection was routed through a merge node.
    Merged { merge: NodeId, inserted: bool },
}

/// Rewrites multi-branch context inputs into merge nodes.
pub struct ContextMerger {
    config: MergeConfig,
}

impl ContextMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Validate and add a proposed edge, merging when it would overfill a
    /// single-context handle.
    pub fn connect(&self, conn: &Connection, graph: &mut Graph) -> Result<ConnectOutcome> {
        let source = graph
            .node(&conn.source)
            .ok_or_else(|| ThreadloomError::NotFound(format!("source node {}", conn.source)))?;
        let target = graph
            .node(&conn.target)
            .ok_or_else(|| ThreadloomError::NotFound(format!("target node {}", conn.target)))?;
        let (source_kind, target_kind) = (source.kind, target.kind);

        let handle = HandleId::parse(&conn.target_handle)?;
        let incompatible = || ThreadloomError::IncompatibleHandle {
            source_kind: source_kind.to_string(),
            handle: conn.target_handle.clone(),
        };
        if handle.node_id != conn.target
            || !input_categories(target_kind).contains(&handle.category)
            || !handle.category.accepts(source_kind)
        {
            return Err(incompatible());
        }

        if let Some(edge) = graph.edges.iter().find(|e| e.matches(conn)) {
            return Ok(ConnectOutcome::Existing { edge: edge.clone() });
        }

        let occupied = graph.edges_into(&conn.target, handle.category).len();
        match handle.category.capacity(target_kind) {
            Some(capacity) if occupied >= capacity => {
                if handle.category == HandleCategory::Context && target_kind.is_generation() {
                    return match self.place_merge(conn, graph)? {
                        MergeOutcome::Absorbed { merge } => Ok(ConnectOutcome::Merged {
                            merge,
                            inserted: false,
                        }),
                        MergeOutcome::Inserted { merge } => Ok(ConnectOutcome::Merged {
                            merge,
                            inserted: true,
                        }),
                        MergeOutcome::Unchanged => Err(ThreadloomError::HandleCapacityViolation {
                            node: conn.target.to_string(),
                            handle: conn.target_handle.clone(),
                            capacity,
                        }),
                    };
                }
                Err(ThreadloomError::HandleCapacityViolation {
                    node: conn.target.to_string(),
                    handle: conn.target_handle.clone(),
                    capacity,
                })
            }
            _ => {
                let edge = conn.clone().into_edge();
                debug!(edge_id = %edge.id, source = %edge.source, target = %edge.target, "Edge added");
                graph.add_edge(edge.clone());
                Ok(ConnectOutcome::Added { edge })
            }
        }
    }

    /// Remove an edge. Merge nodes stay even when left with fewer than two
    /// branches.
    pub fn disconnect(&self, edge_id: &str, graph: &mut Graph) -> Result<Edge> {
        let edge = graph
            .remove_edge(edge_id)
            .ok_or_else(|| ThreadloomError::NotFound(format!("edge {edge_id}")))?;
        debug!(edge_id = %edge.id, source = %edge.source, target = %edge.target, "Edge removed");
        Ok(edge)
    }

    /// Route `conn` through a merge node if it lands on an occupied context
    /// handle of a generation node. The proposed direct edge, if already
    /// present in `graph`, is dropped. Repeating a call is a no-op.
    pub fn place_merge(&self, conn: &Connection, graph: &mut Graph) -> Result<MergeOutcome> {
        let Ok(handle) = HandleId::parse(&conn.target_handle) else {
            return Ok(MergeOutcome::Unchanged);
        };
        if handle.category != HandleCategory::Context {
            return Ok(MergeOutcome::Unchanged);
        }
        let Some(target) = graph.node(&conn.target) else {
            return Err(ThreadloomError::NotFound(format!("target node {}", conn.target)));
        };
        if !target.kind.is_generation() {
            return Ok(MergeOutcome::Unchanged);
        }
        let target_pos = target.position;
        if !graph.contains_node(&conn.source) {
            return Err(ThreadloomError::NotFound(format!("source node {}", conn.source)));
        }

        let existing: Vec<Edge> = graph
            .edges_into(&conn.target, HandleCategory::Context)
            .into_iter()
            .filter(|e| e.source != conn.source)
            .cloned()
            .collect();
        let Some(first) = existing.first() else {
            return Ok(MergeOutcome::Unchanged);
        };

        let mut staged = graph.clone();
        let direct: Vec<String> = staged
            .edges
            .iter()
            .filter(|e| e.matches(conn))
            .map(|e| e.id.clone())
            .collect();
        for id in &direct {
            staged.remove_edge(id);
        }

        let existing_merge = staged
            .node(&first.source)
            .filter(|n| n.kind == NodeKind::ContextMerge)
            .map(|n| n.id.clone());

        let outcome = match existing_merge {
            Some(merge) => {
                let branch = branch_edge(conn, &merge);
                let already = staged.edges.iter().any(|e| e.matches(&branch));
                if !already {
                    staged.add_edge(branch.into_edge());
                }
                if already && direct.is_empty() {
                    return Ok(MergeOutcome::Unchanged);
                }
                MergeOutcome::Absorbed { merge }
            }
            None => {
                let merge = NodeId::new();
                let position = target_pos.unwrap_or_default();
                let data = MergeNodeData {
                    mode: self.config.default_mode,
                    recent_count: self.config.recent_count,
                    branch_summaries: BTreeMap::new(),
                };
                staged.add_node(Node {
                    id: merge.clone(),
                    kind: NodeKind::ContextMerge,
                    position: Some(Position {
                        x: position.x + self.config.offset_x,
                        y: position.y + self.config.offset_y,
                    }),
                    data: data.to_value(),
                });

                let merge_handle = HandleId::context(&merge).to_string();
                for old in &existing {
                    if let Some(edge) = staged.edges.iter_mut().find(|e| e.id == old.id) {
                        edge.target = merge.clone();
                        edge.target_handle = merge_handle.clone();
                    }
                }
                staged.add_edge(branch_edge(conn, &merge).into_edge());
                staged.add_edge(Edge::new(
                    merge.as_str(),
                    conn.target.as_str(),
                    HandleCategory::Context,
                ));
                MergeOutcome::Inserted { merge }
            }
        };

        check_capacity(&staged, &conn.target)?;
        *graph = staged;

        info!(
            graph_id = %graph.id,
            target = %conn.target,
            source = %conn.source,
            outcome = ?outcome,
            "Context merge placed"
        );
        Ok(outcome)
    }
}

fn branch_edge(conn: &Connection, merge: &NodeId) -> Connection {
    Connection {
        source: conn.source.clone(),
        source_handle: conn.source_handle.clone(),
        target: merge.clone(),
        target_handle: HandleId::context(merge).to_string(),
    }
}

fn check_capacity(graph: &Graph, node: &NodeId) -> Result<()> {
    let Some(owner) = graph.node(node) else {
        return Ok(());
    };
    for &category in input_categories(owner.kind) {
        if let Some(capacity) = category.capacity(owner.kind) {
            if graph.edges_into(node, category).len() > capacity {
                return Err(ThreadloomError::HandleCapacityViolation {
                    node: node.to_string(),
                    handle: HandleId::new(category, node.clone()).to_string(),
                    capacity,
                });
            }
        }
    }
    Ok(())
}
