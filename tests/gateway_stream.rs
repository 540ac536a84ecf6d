use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use threadloom_core::config::AppConfig;
use threadloom_core::event::EventBus;
use threadloom_core::traits::GraphStore;
use threadloom_core::types::{GraphId, NodeId, NodeKind};
use threadloom_core::HandleCategory;
use threadloom_gateway::{mint_token, GatewayServer};
use threadloom_store::MemoryGraphStore;
use threadloom_test_utils::{scenario_a, scenario_b, test_config, GraphBuilder, MockBackend};

struct Harness {
    addr: SocketAddr,
    store: Arc<dyn GraphStore>,
    shutdown: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_gateway(config: AppConfig, backend: MockBackend) -> Harness {
    let store: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::with_graphs([scenario_a(), scenario_b()]));
    let server = GatewayServer::new(config, store.clone(), Arc::new(backend), Arc::new(EventBus::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.serve(listener, token).await });
    Harness { addr, store, shutdown }
}

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(ws: &mut Socket) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .expect("valid frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_plan_endpoint() {
    let gw = spawn_gateway(test_config(), MockBackend::new(&[])).await;
    let base = format!("http://{}/api/graphs/g-a/plan", gw.addr);
    let http = reqwest::Client::new();

    let body: serde_json::Value = http
        .get(format!("{base}?node_id=T1&direction=upstream"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["nodes"], serde_json::json!(["P1", "T1"]));

    let resp = http
        .get(format!("{base}?node_id=T1&direction=sideways"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = http
        .get(format!("{base}?node_id=nope&direction=self"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_connect_inserts_merge_node() {
    let gw = spawn_gateway(test_config(), MockBackend::new(&[])).await;
    let http = reqwest::Client::new();

    let body: serde_json::Value = http
        .post(format!("http://{}/api/graphs/g-b/connect", gw.addr))
        .json(&serde_json::json!({
            "source": "M2",
            "target": "T1",
            "targetHandle": "context_T1",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"], "merged");
    assert_eq!(body["inserted"], true);

    let graph = gw.store.load_graph(&GraphId::from_string("g-b")).await.unwrap().unwrap();
    let merge = NodeId::from(body["merge"].as_str().unwrap());
    assert!(graph.contains_node(&merge));
    let into_target: Vec<_> = graph.edges.iter().filter(|e| e.target.as_str() == "T1").collect();
    assert_eq!(into_target.len(), 1);
    assert_eq!(into_target[0].source, merge);
}

#[tokio::test]
async fn test_concurrent_connects_keep_every_branch() {
    let gw = spawn_gateway(test_config(), MockBackend::new(&[])).await;
    let graph = GraphBuilder::new("g-c")
        .node_at("M1", NodeKind::TextGeneration, 0.0, 0.0)
        .node_at("M2", NodeKind::TextGeneration, 0.0, 200.0)
        .node_at("M3", NodeKind::TextGeneration, 0.0, 400.0)
        .node_at("T1", NodeKind::TextGeneration, 600.0, 200.0)
        .edge("M1", "T1", HandleCategory::Context)
        .build();
    gw.store.save_graph(&graph).await.unwrap();

    let http = reqwest::Client::new();
    let url = format!("http://{}/api/graphs/g-c/connect", gw.addr);
    let connect = |source: &'static str| {
        http.post(&url)
            .json(&serde_json::json!({
                "source": source,
                "target": "T1",
                "targetHandle": "context_T1",
            }))
            .send()
    };
    let (a, b) = tokio::join!(connect("M2"), connect("M3"));
    assert!(a.unwrap().status().is_success());
    assert!(b.unwrap().status().is_success());

    let graph = gw.store.load_graph(&GraphId::from_string("g-c")).await.unwrap().unwrap();
    let merges: Vec<_> = graph
        .nodes
        .iter()
        .filter(|n| n.kind == NodeKind::ContextMerge)
        .collect();
    assert_eq!(merges.len(), 1);
    let merge = &merges[0].id;

    let mut sources: Vec<_> = graph
        .edges
        .iter()
        .filter(|e| &e.target == merge)
        .map(|e| e.source.as_str())
        .collect();
    sources.sort();
    assert_eq!(sources, ["M1", "M2", "M3"]);

    let into_target: Vec<_> = graph.edges.iter().filter(|e| e.target.as_str() == "T1").collect();
    assert_eq!(into_target.len(), 1);
    assert_eq!(&into_target[0].source, merge);
}

#[tokio::test]
async fn test_run_plan_streams_and_commits_output() {
    let gw = spawn_gateway(test_config(), MockBackend::new(&["Hel", "lo"])).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .unwrap();

    ws.send(Message::text(
        serde_json::json!({
            "type": "run_plan",
            "graphId": "g-a",
            "nodeId": "P1",
            "direction": "downstream",
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let mut chunks = String::new();
    let result = loop {
        let frame = next_frame(&mut ws).await;
        match frame["type"].as_str().unwrap() {
            "stream_chunk" => chunks.push_str(frame["payload"].as_str().unwrap()),
            "stream_end" => assert_eq!(frame["status"], "complete"),
            "plan_result" => break frame,
            other => panic!("unexpected frame {other}: {frame}"),
        }
    };
    assert_eq!(chunks, "Hello");
    assert_eq!(result["plan"]["nodes"], serde_json::json!(["P1", "T1"]));
    assert_eq!(result["run"]["aborted"], false);
    assert_eq!(result["run"]["outcomes"][1]["status"], "complete");

    let outputs = gw
        .store
        .outputs(&GraphId::from_string("g-a"), &NodeId::from("T1"))
        .await
        .unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].text, "Hello");
}

#[tokio::test]
async fn test_cancel_stream_keeps_partial_text() {
    let gw = spawn_gateway(test_config(), MockBackend::hanging(&["par"])).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .unwrap();

    ws.send(Message::text(
        r#"{"type":"start_stream","graphId":"g-a","nodeId":"T1","model":"m"}"#,
    ))
    .await
    .unwrap();
    let chunk = next_frame(&mut ws).await;
    assert_eq!(chunk["type"], "stream_chunk");

    ws.send(Message::text(r#"{"type":"cancel_stream","nodeId":"T1"}"#))
        .await
        .unwrap();
    let end = next_frame(&mut ws).await;
    assert_eq!(end["type"], "stream_end");
    assert_eq!(end["status"], "cancelled");

    // History commit happens before the end frame
    let outputs = gw
        .store
        .outputs(&GraphId::from_string("g-a"), &NodeId::from("T1"))
        .await
        .unwrap();
    assert_eq!(outputs[0].text, "par");
}

#[tokio::test]
async fn test_malformed_and_unknown_messages_get_error_frames() {
    let gw = spawn_gateway(test_config(), MockBackend::new(&[])).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .unwrap();

    ws.send(Message::text("not json")).await.unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "parse_error");

    ws.send(Message::text(
        r#"{"type":"run_plan","graphId":"g-a","nodeId":"ghost","direction":"self"}"#,
    ))
    .await
    .unwrap();
    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["kind"], "not_found");
}

#[tokio::test]
async fn test_token_required_when_secret_configured() {
    let mut config = test_config();
    config.gateway.token_secret = Some("s3cret".into());
    let gw = spawn_gateway(config, MockBackend::new(&[])).await;

    assert!(tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .is_err());

    let token = mint_token("s3cret", "tester", 60, chrono::Utc::now().timestamp());
    let url = format!("ws://{}/ws?token={}", gw.addr, urlencoding::encode(&token));
    assert!(tokio_tungstenite::connect_async(url).await.is_ok());
}
