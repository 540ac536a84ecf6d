use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::GraphStore;
use threadloom_core::types::{
    EdgeDirection, ExecutionPlan, GraphId, NodeId, NodeKind, PlanDirection, PlanWarning,
};

/// Nodes reachable from a start node, indexed by BFS discovery rank.
///
/// Rank 0 is the start node. `succ[a]` lists the ranks that must run
/// after `a`; `indeg` counts the in-set predecessors of each rank.
struct Reach {
    nodes: Vec<NodeId>,
    kinds: Vec<NodeKind>,
    rank: HashMap<NodeId, usize>,
    succ: Vec<Vec<usize>>,
    indeg: Vec<usize>,
}

impl Reach {
    fn new(start: NodeId, kind: NodeKind) -> Self {
        let mut reach = Self {
            nodes: Vec::new(),
            kinds: Vec::new(),
            rank: HashMap::new(),
            succ: Vec::new(),
            indeg: Vec::new(),
        };
        reach.push(start, kind);
        reach
    }

    fn push(&mut self, node: NodeId, kind: NodeKind) -> usize {
        let idx = self.nodes.len();
        self.rank.insert(node.clone(), idx);
        self.nodes.push(node);
        self.kinds.push(kind);
        self.succ.push(Vec::new());
        self.indeg.push(0);
        idx
    }
}

/// Computes ordered execution plans over the graph store.
pub struct ExecutionPlanner {
    store: Arc<dyn GraphStore>,
}

impl ExecutionPlanner {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Plan the nodes to run for `direction`, starting from `start`.
    pub async fn plan(
        &self,
        graph: &GraphId,
        start: &NodeId,
        direction: &PlanDirection,
    ) -> Result<ExecutionPlan> {
        let kind = self
            .store
            .node_kind(graph, start)
            .await?
            .ok_or_else(|| ThreadloomError::NotFound(format!("node {start} in graph {graph}")))?;

        let plan = match direction {
            PlanDirection::SelfOnly => ExecutionPlan {
                nodes: vec![start.clone()],
                warnings: Vec::new(),
            },
            PlanDirection::Upstream => self.directed(graph, start, kind, EdgeDirection::Incoming, None).await?,
            PlanDirection::Downstream => self.directed(graph, start, kind, EdgeDirection::Outgoing, None).await?,
            PlanDirection::All => {
                let mut plan = self.directed(graph, start, kind, EdgeDirection::Incoming, None).await?;
                let down = self.directed(graph, start, kind, EdgeDirection::Outgoing, None).await?;
                let mut seen: HashSet<NodeId> = plan.nodes.iter().cloned().collect();
                plan.nodes
                    .extend(down.nodes.into_iter().filter(|n| seen.insert(n.clone())));
                plan.warnings.extend(down.warnings);
                plan
            }
            PlanDirection::Multiple { kinds } => {
                if kinds.is_empty() {
                    return Err(ThreadloomError::InvalidDirection(
                        "multiple requires a node kind filter".to_string(),
                    ));
                }
                self.directed(graph, start, kind, EdgeDirection::Outgoing, Some(kinds.as_slice()))
                    .await?
            }
        };

        debug!(
            graph_id = %graph,
            node_id = %start,
            nodes = plan.len(),
            warnings = plan.warnings.len(),
            "Execution plan computed"
        );
        Ok(plan)
    }

    async fn directed(
        &self,
        graph: &GraphId,
        start: &NodeId,
        kind: NodeKind,
        direction: EdgeDirection,
        filter: Option<&[NodeKind]>,
    ) -> Result<ExecutionPlan> {
        let reach = self.reach(graph, start, kind, direction).await?;
        let mut warnings = Vec::new();
        let order = order(&reach, direction, &mut warnings);
        let nodes = order
            .into_iter()
            .filter(|&i| filter.map_or(true, |kinds| kinds.contains(&reach.kinds[i])))
            .map(|i| reach.nodes[i].clone())
            .collect();
        Ok(ExecutionPlan { nodes, warnings })
    }

    /// Breadth-first walk from `start` along `direction`, recording every
    /// dependency between reached nodes.
    async fn reach(
        &self,
        graph: &GraphId,
        start: &NodeId,
        kind: NodeKind,
        direction: EdgeDirection,
    ) -> Result<Reach> {
        let mut reach = Reach::new(start.clone(), kind);
        let mut queue = VecDeque::from([0usize]);
        let mut pairs: HashSet<(usize, usize)> = HashSet::new();

        while let Some(idx) = queue.pop_front() {
            let node = reach.nodes[idx].clone();
            for edge in self.store.incident_edges(graph, &node, direction).await? {
                let other = match direction {
                    EdgeDirection::Incoming => edge.source,
                    EdgeDirection::Outgoing => edge.target,
                };
                let other_idx = match reach.rank.get(&other) {
                    Some(&i) => i,
                    None => {
                        let Some(other_kind) = self.store.node_kind(graph, &other).await? else {
                            debug!(edge_id = %edge.id, node_id = %other, "Skipping dangling edge");
                            continue;
                        };
                        let i = reach.push(other, other_kind);
                        queue.push_back(i);
                        i
                    }
                };
                let (before, after) = match direction {
                    EdgeDirection::Incoming => (other_idx, idx),
                    EdgeDirection::Outgoing => (idx, other_idx),
                };
                if pairs.insert((before, after)) {
                    reach.succ[before].push(after);
                    reach.indeg[after] += 1;
                }
            }
        }
        Ok(reach)
    }
}

/// Kahn ordering with ready nodes taken by discovery rank. A stall means a
/// cycle: the farthest remaining node (upstream) or the nearest one
/// (downstream) is placed anyway and reported.
fn order(reach: &Reach, direction: EdgeDirection, warnings: &mut Vec<PlanWarning>) -> Vec<usize> {
    let n = reach.nodes.len();
    let mut indeg = reach.indeg.clone();
    let mut placed = vec![false; n];
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indeg[i] == 0).collect();
    let mut out = Vec::with_capacity(n);

    while out.len() < n {
        let next = match ready.pop_first() {
            Some(i) => i,
            None => {
                let mut remaining = (0..n).filter(|&i| !placed[i]);
                let forced = match direction {
                    EdgeDirection::Incoming => remaining.max(),
                    EdgeDirection::Outgoing => remaining.next(),
                };
                let Some(forced) = forced else { break };
                warn!(node_id = %reach.nodes[forced], "Cycle in plan; placing node before its dependencies");
                warnings.push(PlanWarning::CycleBroken {
                    node: reach.nodes[forced].clone(),
                });
                forced
            }
        };
        placed[next] = true;
        out.push(next);
        for &s in &reach.succ[next] {
            if placed[s] {
                continue;
            }
            indeg[s] -= 1;
            if indeg[s] == 0 {
                ready.insert(s);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadloom_core::{Graph, HandleCategory};
    use threadloom_store::MemoryGraphStore;
    use threadloom_test_utils::{scenario_a, GraphBuilder};

    fn planner(graph: Graph) -> (ExecutionPlanner, GraphId) {
        let id = graph.id.clone();
        let store = Arc::new(MemoryGraphStore::with_graphs([graph]));
        (ExecutionPlanner::new(store), id)
    }

    fn ids(plan: &ExecutionPlan) -> Vec<&str> {
        plan.nodes.iter().map(|n| n.as_str()).collect()
    }

    /// p -> a -> c, b -> c, c -> d, c -> e, e -> f
    fn diamond() -> Graph {
        GraphBuilder::new("g")
            .text_node("p", NodeKind::Prompt, "hi")
            .node("a", NodeKind::TextGeneration)
            .node("b", NodeKind::TextGeneration)
            .node("c", NodeKind::ContextMerge)
            .node("d", NodeKind::TextGeneration)
            .node("e", NodeKind::ParallelGeneration)
            .node("f", NodeKind::TextGeneration)
            .edge("p", "a", HandleCategory::Prompt)
            .edge("a", "c", HandleCategory::Context)
            .edge("b", "c", HandleCategory::Context)
            .edge("c", "d", HandleCategory::Context)
            .edge("c", "e", HandleCategory::Context)
            .edge("e", "f", HandleCategory::Context)
            .build()
    }

    #[tokio::test]
    async fn test_upstream_prompt_then_generation() {
        let (planner, g) = planner(scenario_a());
        let plan = planner
            .plan(&g, &NodeId::from("T1"), &PlanDirection::Upstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["P1", "T1"]);
        assert!(plan.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_self_plan() {
        let (planner, g) = planner(scenario_a());
        let plan = planner
            .plan(&g, &NodeId::from("P1"), &PlanDirection::SelfOnly)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["P1"]);
    }

    #[tokio::test]
    async fn test_upstream_is_complete_and_ends_with_start() {
        let (planner, g) = planner(diamond());
        let plan = planner
            .plan(&g, &NodeId::from("f"), &PlanDirection::Upstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["b", "p", "a", "c", "e", "f"]);
        let pos = |n: &str| plan.position(&NodeId::from(n)).unwrap();
        assert!(pos("p") < pos("a"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
        assert!(!plan.contains(&NodeId::from("d")));
    }

    #[tokio::test]
    async fn test_downstream_starts_with_start() {
        let (planner, g) = planner(diamond());
        let plan = planner
            .plan(&g, &NodeId::from("a"), &PlanDirection::Downstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["a", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn test_upstream_and_downstream_share_only_start() {
        let (planner, g) = planner(diamond());
        let start = NodeId::from("c");
        let up = planner.plan(&g, &start, &PlanDirection::Upstream).await.unwrap();
        let down = planner.plan(&g, &start, &PlanDirection::Downstream).await.unwrap();
        let shared: Vec<_> = up.nodes.iter().filter(|n| down.contains(n)).collect();
        assert_eq!(shared, vec![&start]);
    }

    #[tokio::test]
    async fn test_all_is_upstream_then_downstream() {
        let (planner, g) = planner(diamond());
        let plan = planner
            .plan(&g, &NodeId::from("c"), &PlanDirection::All)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["b", "p", "a", "c", "d", "e", "f"]);
    }

    #[tokio::test]
    async fn test_multiple_filters_by_kind() {
        let (planner, g) = planner(diamond());
        let plan = planner
            .plan(
                &g,
                &NodeId::from("a"),
                &PlanDirection::Multiple {
                    kinds: vec![NodeKind::TextGeneration],
                },
            )
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["a", "d", "f"]);

        let plan = planner
            .plan(
                &g,
                &NodeId::from("a"),
                &PlanDirection::Multiple {
                    kinds: vec![NodeKind::ParallelGeneration],
                },
            )
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["e"]);
    }

    #[tokio::test]
    async fn test_multiple_requires_kinds() {
        let (planner, g) = planner(diamond());
        let err = planner
            .plan(&g, &NodeId::from("a"), &PlanDirection::Multiple { kinds: vec![] })
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadloomError::InvalidDirection(_)));
    }

    #[tokio::test]
    async fn test_missing_start_is_not_found() {
        let (planner, g) = planner(scenario_a());
        let err = planner
            .plan(&g, &NodeId::from("ghost"), &PlanDirection::Upstream)
            .await
            .unwrap_err();
        assert!(matches!(err, ThreadloomError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ties_follow_discovery_order() {
        let graph = GraphBuilder::new("g")
            .node("t", NodeKind::ParallelGeneration)
            .node("x", NodeKind::TextGeneration)
            .node("y", NodeKind::TextGeneration)
            .node("z", NodeKind::TextGeneration)
            .edge("t", "y", HandleCategory::Context)
            .edge("t", "x", HandleCategory::Context)
            .edge("t", "z", HandleCategory::Context)
            .build();
        let (planner, g) = planner(graph);
        let plan = planner
            .plan(&g, &NodeId::from("t"), &PlanDirection::Downstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["t", "y", "x", "z"]);
    }

    #[tokio::test]
    async fn test_upstream_cycle_is_broken_and_reported() {
        // a -> b -> c -> a, plus p -> c
        let graph = GraphBuilder::new("g")
            .node("a", NodeKind::TextGeneration)
            .node("b", NodeKind::TextGeneration)
            .node("c", NodeKind::TextGeneration)
            .text_node("p", NodeKind::Prompt, "go")
            .edge("a", "b", HandleCategory::Context)
            .edge("b", "c", HandleCategory::Context)
            .edge("c", "a", HandleCategory::Context)
            .edge("p", "c", HandleCategory::Prompt)
            .build();
        let (planner, g) = planner(graph);
        let plan = planner
            .plan(&g, &NodeId::from("c"), &PlanDirection::Upstream)
            .await
            .unwrap();

        assert_eq!(plan.len(), 4);
        let unique: HashSet<_> = plan.nodes.iter().collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::CycleBroken {
                node: NodeId::from("a")
            }]
        );
        assert_eq!(ids(&plan), vec!["p", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_downstream_cycle_forces_nearest() {
        let graph = GraphBuilder::new("g")
            .node("a", NodeKind::TextGeneration)
            .node("b", NodeKind::TextGeneration)
            .edge("a", "b", HandleCategory::Context)
            .edge("b", "a", HandleCategory::Context)
            .build();
        let (planner, g) = planner(graph);
        let plan = planner
            .plan(&g, &NodeId::from("a"), &PlanDirection::Downstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["a", "b"]);
        assert_eq!(
            plan.warnings,
            vec![PlanWarning::CycleBroken {
                node: NodeId::from("a")
            }]
        );
    }

    #[tokio::test]
    async fn test_dangling_edge_is_skipped() {
        let graph = GraphBuilder::new("g")
            .node("t", NodeKind::TextGeneration)
            .edge("gone", "t", HandleCategory::Context)
            .build();
        let (planner, g) = planner(graph);
        let plan = planner
            .plan(&g, &NodeId::from("t"), &PlanDirection::Upstream)
            .await
            .unwrap();
        assert_eq!(ids(&plan), vec!["t"]);
    }
}
