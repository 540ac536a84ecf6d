use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::graph::{Edge, Graph, Node, Position};
use threadloom_core::traits::GraphStore;
use threadloom_core::types::{
    EdgeDirection, GraphId, NodeId, NodeKind, NodeOutput, SessionState,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS graphs (
        id TEXT PRIMARY KEY,
        title TEXT,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS nodes (
        graph_id TEXT NOT NULL,
        id TEXT NOT NULL,
        kind TEXT NOT NULL,
        pos_x REAL,
        pos_y REAL,
        data TEXT NOT NULL,
        seq INTEGER NOT NULL,
        PRIMARY KEY (graph_id, id)
    );

    CREATE TABLE IF NOT EXISTS edges (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_id TEXT NOT NULL,
        id TEXT NOT NULL,
        source TEXT NOT NULL,
        source_handle TEXT,
        target TEXT NOT NULL,
        target_handle TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(graph_id, source);
    CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(graph_id, target);

    CREATE TABLE IF NOT EXISTS node_outputs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        graph_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        sub_model_id TEXT,
        model TEXT NOT NULL,
        text TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        recorded_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_outputs_node ON node_outputs(graph_id, node_id, id);
";

fn db_err(e: rusqlite::Error) -> ThreadloomError {
    ThreadloomError::Database(e.to_string())
}

/// SQLite-backed graph store.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ThreadloomError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Graph store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ThreadloomError::Database(e.to_string()))?;
        f(&mut conn)
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_kind(s: &str) -> Result<NodeKind> {
    NodeKind::parse(s).ok_or_else(|| ThreadloomError::Database(format!("unknown node kind: {s}")))
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        id: row.get(0)?,
        source: NodeId(row.get(1)?),
        source_handle: row.get(2)?,
        target: NodeId(row.get(3)?),
        target_handle: row.get(4)?,
    })
}

fn load(conn: &Connection, graph: &GraphId) -> Result<Option<Graph>> {
    let title: Option<Option<String>> = conn
        .query_row(
            "SELECT title FROM graphs WHERE id = ?1",
            params![graph.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(title) = title else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, kind, pos_x, pos_y, data FROM nodes
             WHERE graph_id = ?1 ORDER BY seq ASC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![graph.as_str()], |row| {
            let id: String = row.get(0)?;
            let kind: String = row.get(1)?;
            let x: Option<f64> = row.get(2)?;
            let y: Option<f64> = row.get(3)?;
            let data: String = row.get(4)?;
            Ok((id, kind, x, y, data))
        })
        .map_err(db_err)?;

    let mut nodes = Vec::new();
    for row in rows {
        let (id, kind, x, y, data) = row.map_err(db_err)?;
        nodes.push(Node {
            id: NodeId(id),
            kind: parse_kind(&kind)?,
            position: x.zip(y).map(|(x, y)| Position { x, y }),
            data: serde_json::from_str(&data)?,
        });
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, source, source_handle, target, target_handle FROM edges
             WHERE graph_id = ?1 ORDER BY seq ASC",
        )
        .map_err(db_err)?;
    let edges = stmt
        .query_map(params![graph.as_str()], row_to_edge)
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;

    Ok(Some(Graph {
        id: graph.clone(),
        title,
        nodes,
        edges,
    }))
}

fn save(conn: &mut Connection, graph: &Graph) -> Result<()> {
    let tx = conn.transaction().map_err(db_err)?;
    let gid = graph.id.as_str();

    tx.execute(
        "INSERT INTO graphs (id, title, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET title = excluded.title, updated_at = excluded.updated_at",
        params![gid, graph.title, Utc::now().to_rfc3339()],
    )
    .map_err(db_err)?;
    tx.execute("DELETE FROM nodes WHERE graph_id = ?1", params![gid])
        .map_err(db_err)?;
    tx.execute("DELETE FROM edges WHERE graph_id = ?1", params![gid])
        .map_err(db_err)?;

    for (seq, node) in graph.nodes.iter().enumerate() {
        tx.execute(
            "INSERT INTO nodes (graph_id, id, kind, pos_x, pos_y, data, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                gid,
                node.id.as_str(),
                node.kind.as_str(),
                node.position.map(|p| p.x),
                node.position.map(|p| p.y),
                serde_json::to_string(&node.data)?,
                seq as i64,
            ],
        )
        .map_err(db_err)?;
    }
    for edge in &graph.edges {
        tx.execute(
            "INSERT INTO edges (graph_id, id, source, source_handle, target, target_handle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                gid,
                edge.id,
                edge.source.as_str(),
                edge.source_handle,
                edge.target.as_str(),
                edge.target_handle,
            ],
        )
        .map_err(db_err)?;
    }

    tx.commit().map_err(db_err)
}

impl GraphStore for SqliteGraphStore {
    fn node_kind(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Option<NodeKind>>> {
        let graph = graph.clone();
        let node = node.clone();
        Box::pin(async move {
            self.with_conn(|conn| {
                let kind: Option<String> = conn
                    .query_row(
                        "SELECT kind FROM nodes WHERE graph_id = ?1 AND id = ?2",
                        params![graph.as_str(), node.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                kind.as_deref().map(parse_kind).transpose()
            })
        })
    }

    fn incident_edges(
        &self,
        graph: &GraphId,
        node: &NodeId,
        direction: EdgeDirection,
    ) -> BoxFuture<'_, Result<Vec<Edge>>> {
        let graph = graph.clone();
        let node = node.clone();
        let sql = match direction {
            EdgeDirection::Incoming => {
                "SELECT id, source, source_handle, target, target_handle FROM edges
                 WHERE graph_id = ?1 AND target = ?2 ORDER BY seq ASC"
            }
            EdgeDirection::Outgoing => {
                "SELECT id, source, source_handle, target, target_handle FROM edges
                 WHERE graph_id = ?1 AND source = ?2 ORDER BY seq ASC"
            }
        };
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare(sql).map_err(db_err)?;
                let edges = stmt
                    .query_map(params![graph.as_str(), node.as_str()], row_to_edge)
                    .map_err(db_err)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                Ok(edges)
            })
        })
    }

    fn load_graph(&self, graph: &GraphId) -> BoxFuture<'_, Result<Option<Graph>>> {
        let graph = graph.clone();
        Box::pin(async move { self.with_conn(|conn| load(conn, &graph)) })
    }

    fn save_graph(&self, graph: &Graph) -> BoxFuture<'_, Result<()>> {
        let graph = graph.clone();
        Box::pin(async move {
            self.with_conn(|conn| save(conn, &graph))?;
            debug!(graph_id = %graph.id, nodes = graph.nodes.len(), edges = graph.edges.len(), "Graph saved");
            Ok(())
        })
    }

    fn list_graphs(&self) -> BoxFuture<'_, Result<Vec<GraphId>>> {
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id FROM graphs ORDER BY id ASC")
                    .map_err(db_err)?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(db_err)?
                    .map(|r| r.map(GraphId))
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(db_err)?;
                Ok(ids)
            })
        })
    }

    fn record_output(&self, output: &NodeOutput) -> BoxFuture<'_, Result<()>> {
        let output = output.clone();
        Box::pin(async move {
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO node_outputs
                     (graph_id, node_id, sub_model_id, model, text, status, started_at, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        output.graph_id.as_str(),
                        output.node_id.as_str(),
                        output.sub_model_id,
                        output.model,
                        output.text,
                        output.status.as_str(),
                        output.started_at.to_rfc3339(),
                        output.recorded_at.to_rfc3339(),
                    ],
                )
                .map_err(db_err)?;
                Ok(())
            })
        })
    }

    fn outputs(&self, graph: &GraphId, node: &NodeId) -> BoxFuture<'_, Result<Vec<NodeOutput>>> {
        let graph = graph.clone();
        let node = node.clone();
        Box::pin(async move {
            self.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT sub_model_id, model, text, status, started_at, recorded_at FROM node_outputs
                         WHERE graph_id = ?1 AND node_id = ?2 ORDER BY id ASC",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![graph.as_str(), node.as_str()], |row| {
                        let sub: Option<String> = row.get(0)?;
                        let model: String = row.get(1)?;
                        let text: String = row.get(2)?;
                        let status: String = row.get(3)?;
                        let started: String = row.get(4)?;
                        let recorded: String = row.get(5)?;
                        Ok((sub, model, text, status, started, recorded))
                    })
                    .map_err(db_err)?;

                let mut outputs = Vec::new();
                for row in rows {
                    let (sub_model_id, model, text, status, started, recorded) = row.map_err(db_err)?;
                    let recorded_at = parse_timestamp(&recorded);
                    outputs.push(NodeOutput {
                        graph_id: graph.clone(),
                        node_id: node.clone(),
                        sub_model_id,
                        model,
                        text,
                        status: SessionState::parse(&status).unwrap_or(SessionState::Error),
                        started_at: parse_timestamp(&started),
                        recorded_at,
                    });
                }
                Ok(outputs)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadloom_core::HandleCategory;
    use threadloom_test_utils::{scenario_a, GraphBuilder};

    #[tokio::test]
    async fn test_save_and_load_roundtrip_keeps_order() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let graph = GraphBuilder::new("g1")
            .title("Research")
            .text_node("p", NodeKind::Prompt, "Summarize")
            .node_at("b", NodeKind::TextGeneration, 10.0, 20.0)
            .node("a", NodeKind::TextGeneration)
            .edge("p", "b", HandleCategory::Prompt)
            .edge("b", "a", HandleCategory::Context)
            .build();
        store.save_graph(&graph).await.unwrap();

        let loaded = store.load_graph(&graph.id).await.unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Research"));
        let ids: Vec<_> = loaded.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["p", "b", "a"]);
        assert_eq!(loaded.nodes[0].text(), Some("Summarize"));
        assert_eq!(loaded.nodes[1].position, Some(Position { x: 10.0, y: 20.0 }));
        assert_eq!(loaded.edges, graph.edges);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_snapshot() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let mut graph = scenario_a();
        store.save_graph(&graph).await.unwrap();

        graph.edges.clear();
        store.save_graph(&graph).await.unwrap();

        let t1 = NodeId::from("T1");
        assert!(store
            .incident_edges(&graph.id, &t1, EdgeDirection::Incoming)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.list_graphs().await.unwrap(), vec![graph.id.clone()]);
    }

    #[tokio::test]
    async fn test_adjacency_queries() {
        let store = SqliteGraphStore::in_memory().unwrap();
        let graph = scenario_a();
        store.save_graph(&graph).await.unwrap();

        assert_eq!(
            store.node_kind(&graph.id, &NodeId::from("P1")).await.unwrap(),
            Some(NodeKind::Prompt)
        );
        assert_eq!(store.node_kind(&graph.id, &NodeId::from("zz")).await.unwrap(), None);
        let out = store
            .incident_edges(&graph.id, &NodeId::from("P1"), EdgeDirection::Outgoing)
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target_handle, "prompt_T1");
    }

    #[tokio::test]
    async fn test_outputs_persist_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("graphs.db");
        let gid = GraphId::from_string("g1");
        {
            let store = SqliteGraphStore::open(&path).unwrap();
            store
                .record_output(&NodeOutput {
                    graph_id: gid.clone(),
                    node_id: NodeId::from("t1"),
                    sub_model_id: Some("m2".into()),
                    model: "gpt-4o-mini".into(),
                    text: "partial".into(),
                    status: SessionState::Cancelled,
                    started_at: Utc::now(),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let store = SqliteGraphStore::open(&path).unwrap();
        let outs = store.outputs(&gid, &NodeId::from("t1")).await.unwrap();
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].status, SessionState::Cancelled);
        assert_eq!(outs[0].sub_model_id.as_deref(), Some("m2"));
        assert_eq!(outs[0].text, "partial");
    }
}
