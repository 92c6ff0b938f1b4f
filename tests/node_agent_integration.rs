use chrono::Utc;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use warden::config::FirewallMode;
use warden::servers::node::blocks::BlockTable;
use warden::servers::node::firewall::Firewall;
use warden::servers::node::reporter::ReporterStats;
use warden::servers::node::NodeState;

const SECRET: &str = "node-secret-1";

async fn start_node() -> (SocketAddr, Arc<NodeState>) {
    let blocks = Arc::new(BlockTable::new(Firewall::new(FirewallMode::None)));
    let state = Arc::new(NodeState::new(
        "test-node",
        SECRET,
        blocks,
        Arc::new(ReporterStats::default()),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = NodeState::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn block(client: &reqwest::Client, addr: SocketAddr, target: &str, duration: u64) -> Value {
    let resp = client
        .post(format!("http://{}/block", addr))
        .json(&json!({"target": target, "duration": duration, "secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_block_then_unblock_leaves_nothing() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    let body = block(&client, addr, "178.176.86.81", 60).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["target"], "178.176.86.81");
    let expires_at = body["expires_at"].as_i64().unwrap();
    assert!(expires_at >= Utc::now().timestamp() + 58);
    assert_eq!(state.blocks.len().await, 1);

    let resp = client
        .post(format!("http://{}/unblock", addr))
        .json(&json!({"target": "178.176.86.81", "secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(state.blocks.is_empty().await, "no rule and no timer may remain");
}

#[tokio::test]
async fn test_unblock_of_unknown_target_succeeds() {
    let (addr, _state) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/unblock", addr))
        .json(&json!({"target": "203.0.113.9", "secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200, "unblock is idempotent");
}

#[tokio::test]
async fn test_wrong_secret_uniform_forbidden() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    let bodies = [
        ("block", json!({"target": "10.0.0.1", "duration": 60, "secret": "wrong"})),
        ("unblock", json!({"target": "10.0.0.1", "secret": "wrong"})),
        ("clear", json!({"secret": "wrong"})),
    ];
    for (endpoint, body) in bodies {
        let resp = client
            .post(format!("http://{}/{}", addr, endpoint))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 403, "endpoint {}", endpoint);
        let bytes = resp.bytes().await.unwrap();
        assert!(bytes.is_empty(), "refusal must not describe anything");
    }
    assert!(state.blocks.is_empty().await);
}

#[tokio::test]
async fn test_bad_target_rejected() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/block", addr))
        .json(&json!({"target": "not-an-address", "duration": 60, "secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], false);

    let resp = client
        .post(format!("http://{}/block", addr))
        .json(&json!({"target": "10.0.0.1", "duration": 0, "secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert!(state.blocks.is_empty().await);
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    let first = block(&client, addr, "10.0.0.1:16708", 60).await;
    let second = block(&client, addr, "10.0.0.1:16708", 60).await;
    assert_eq!(second["ok"], true);
    assert!(second["expires_at"].as_i64().unwrap() >= first["expires_at"].as_i64().unwrap());
    assert_eq!(state.blocks.len().await, 1, "re-delivery must not duplicate");
}

#[tokio::test]
async fn test_shorter_redelivery_does_not_shrink_block() {
    let (addr, _state) = start_node().await;
    let client = reqwest::Client::new();

    let long = block(&client, addr, "10.0.0.1", 300).await;
    let short = block(&client, addr, "10.0.0.1", 5).await;
    assert_eq!(
        short["expires_at"], long["expires_at"],
        "a shorter grant must keep the existing expiry"
    );

    let stats: Value = client
        .get(format!("http://{}/stats", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["blocked"][0]["expires_at"], long["expires_at"]);
}

#[tokio::test]
async fn test_block_expires_on_its_own() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    block(&client, addr, "10.0.0.1", 1).await;
    assert_eq!(state.blocks.len().await, 1);

    let mut expired = false;
    for _ in 0..200 {
        if state.blocks.is_empty().await {
            expired = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(expired, "a one second block must expire within a few seconds");
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let (addr, state) = start_node().await;
    let client = reqwest::Client::new();

    for target in ["10.0.0.1", "10.0.0.2", "10.0.0.3:4000"] {
        block(&client, addr, target, 60).await;
    }
    assert_eq!(state.blocks.len().await, 3);

    let resp = client
        .post(format!("http://{}/clear", addr))
        .json(&json!({"secret": SECRET}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["cleared"], 3);
    assert!(state.blocks.is_empty().await);
}

#[tokio::test]
async fn test_health_reports_node_state() {
    let (addr, _state) = start_node().await;
    let client = reqwest::Client::new();

    block(&client, addr, "10.0.0.1", 60).await;

    let health: Value = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["node"], "test-node");
    assert_eq!(health["blocked"], 1);
    assert!(health["uptime_secs"].as_u64().is_some());
    assert_eq!(health["reporter"]["sent"], 0);
    assert_eq!(health["reporter"]["dropped"], 0);
}

#[tokio::test]
async fn test_stats_lists_blocked_targets() {
    let (addr, _state) = start_node().await;
    let client = reqwest::Client::new();

    block(&client, addr, "10.0.0.1", 60).await;
    block(&client, addr, "10.0.0.2:500", 60).await;

    let stats: Value = client
        .get(format!("http://{}/stats", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let blocked = stats["blocked"].as_array().unwrap();
    let mut targets: Vec<&str> = blocked.iter().map(|b| b["target"].as_str().unwrap()).collect();
    targets.sort_unstable();
    assert_eq!(targets, vec!["10.0.0.1", "10.0.0.2:500"]);
}
