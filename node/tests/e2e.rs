//! End-to-end mesh behavior over real HTTP on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use weft_node::server::create_router;
use weft_protocol::ai::{
    ChatResponder, CodeExecutor, CodeGenerator, ExecutionOutcome, TemplateGenerator,
    TemplateResponder,
};
use weft_protocol::{MeshConfig, MeshNode};

struct FixedExecutor;

impl CodeExecutor for FixedExecutor {
    fn execute(&self, code: &str, language: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            output: format!("ran `{code}` as {language}"),
            error: String::new(),
            duration_ms: 7.0,
        }
    }
}

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn fast_config(service: &str, caps: &[&str], port: u16, discovery_ports: Vec<u16>) -> MeshConfig {
    MeshConfig {
        node_id: format!("{service}-{port}"),
        service_name: service.into(),
        host: "127.0.0.1".into(),
        port,
        capabilities: caps.iter().map(|s| s.to_string()).collect(),
        discovery_ports,
        announce_interval: Duration::from_millis(200),
        announce_timeout: Duration::from_millis(500),
        ping_timeout: Duration::from_millis(500),
        ..MeshConfig::default()
    }
}

fn spawn_node(config: MeshConfig, listener: TcpListener) -> Arc<MeshNode> {
    let node = MeshNode::with_strategies(
        config,
        Some(Arc::new(TemplateResponder) as Arc<dyn ChatResponder>),
        Some(Arc::new(TemplateGenerator) as Arc<dyn CodeGenerator>),
        Arc::new(FixedExecutor),
    );
    let app = create_router(node.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    node
}

async fn wait_for_peer(client: &reqwest::Client, port: u16, peer_id: &str) {
    let url = format!("http://127.0.0.1:{port}/mesh/peers");
    for _ in 0..50 {
        if let Ok(resp) = client.get(&url).send().await {
            let body: Value = resp.json().await.unwrap();
            let found = body["peers"]
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p["id"] == peer_id);
            if found {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("peer {peer_id} never showed up on port {port}");
}

#[tokio::test]
async fn two_nodes_converge_and_forward_execution() {
    let (listener_a, port_a) = bind().await;
    let (listener_b, port_b) = bind().await;
    let discovery = vec![port_a, port_b];

    let node_a = spawn_node(
        fast_config("python", &["python"], port_a, discovery.clone()),
        listener_a,
    );
    let node_b = spawn_node(
        fast_config("go", &["go"], port_b, discovery),
        listener_b,
    );
    node_a.start().await;
    node_b.start().await;

    let client = reqwest::Client::new();
    wait_for_peer(&client, port_a, &node_b.config.node_id).await;
    wait_for_peer(&client, port_b, &node_a.config.node_id).await;

    // A cannot run go itself, so this is forwarded to B and B's local
    // result is relayed verbatim.
    let reply: Value = client
        .post(format!("http://127.0.0.1:{port_a}/mesh/execute"))
        .json(&json!({ "code": "x", "language": "go", "sessionId": "s1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(reply["success"], true);
    assert_eq!(reply["language"], "go");
    assert_eq!(reply["output"], "ran `x` as go");
    assert_eq!(reply["sessionId"], "s1");
    assert_eq!(reply["executionTime"], 7.0);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn discovery_survives_dead_ports() {
    let (listener_a, port_a) = bind().await;
    let (listener_b, port_b) = bind().await;
    // A port with nothing behind it, probed every round.
    let discovery = vec![59_901, port_a, port_b];

    let node_a = spawn_node(
        fast_config("python", &[], port_a, discovery.clone()),
        listener_a,
    );
    let node_b = spawn_node(fast_config("go", &[], port_b, discovery), listener_b);
    node_a.start().await;
    node_b.start().await;

    let client = reqwest::Client::new();
    wait_for_peer(&client, port_a, &node_b.config.node_id).await;

    // The dead port never becomes a peer.
    let body: Value = client
        .get(format!("http://127.0.0.1:{port_a}/mesh/peers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["peers"].as_array().unwrap().len(), 1);

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test]
async fn unknown_endpoint_returns_structured_payload() {
    let (listener, port) = bind().await;
    let node = spawn_node(fast_config("python", &[], port, vec![]), listener);

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/mesh/nonsense"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Unknown endpoint");
    assert_eq!(body["path"], "/mesh/nonsense");

    node.shutdown().await;
}

#[tokio::test]
async fn metrics_count_all_requests_and_only_faults_as_errors() {
    let (listener, port) = bind().await;
    // No generator installed: a locally targeted generation is a fault.
    let node = MeshNode::with_strategies(
        fast_config("python", &[], port, vec![]),
        None,
        None,
        Arc::new(FixedExecutor),
    );
    let app = create_router(node.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{port}");

    for _ in 0..3 {
        let resp = client.get(format!("{base}/mesh/health")).send().await.unwrap();
        assert!(resp.status().is_success());
    }

    let resp = client
        .post(format!("{base}/mesh/ai/generate"))
        .json(&json!({ "prompt": "x", "language": "python" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);

    let body: Value = client
        .get(format!("{base}/mesh/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // 3 health + 1 faulted generate = 4 counted before the metrics call
    assert_eq!(body["messages"], 4);
    assert_eq!(body["errors"], 1);
    assert!(body["averageResponseTime"].as_f64().unwrap() >= 0.0);

    node.shutdown().await;
}

#[tokio::test]
async fn chat_round_trip_over_http() {
    let (listener, port) = bind().await;
    let node = spawn_node(fast_config("python", &["ai"], port, vec![]), listener);

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("http://127.0.0.1:{port}/mesh/ai/chat"))
        .json(&json!({ "sessionId": "s1", "message": "hello container" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["success"], true);
    assert_eq!(body["model"], "default");
    assert_eq!(body["history"].as_array().unwrap().len(), 2);

    node.shutdown().await;
}
