//! Node agent
//!
//! Runs on every VPN node: follows the access log, reports parsed events to
//! the control server, and exposes the enforcement API the control server
//! calls back into. Mutating endpoints authenticate with the fleet secret and
//! reject uniformly - same status, empty body - so a caller probing without
//! the secret learns nothing, not even whether a target was blocked.

pub mod blocks;
pub mod firewall;
pub mod reporter;

use anyhow::Result;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::parser;
use crate::wire::{BlockCommand, ClearCommand, ConnectionEvent, SourceKey, UnblockCommand};
use blocks::BlockTable;
use reporter::ReporterStats;

pub struct NodeState {
    pub name: String,
    secret: String,
    pub blocks: Arc<BlockTable>,
    pub stats: Arc<ReporterStats>,
    pub started_at: Instant,
}

impl NodeState {
    pub fn new(
        name: impl Into<String>,
        secret: impl Into<String>,
        blocks: Arc<BlockTable>,
        stats: Arc<ReporterStats>,
    ) -> Self {
        Self {
            name: name.into(),
            secret: secret.into(),
            blocks,
            stats,
            started_at: Instant::now(),
        }
    }

    fn authorized(&self, presented: &str) -> bool {
        !self.secret.is_empty() && presented == self.secret
    }

    pub fn router(state: Arc<Self>) -> Router {
        Router::new()
            .route("/block", post(handle_block))
            .route("/unblock", post(handle_unblock))
            .route("/clear", post(handle_clear))
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .with_state(state)
    }

    pub async fn run(state: Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("[node] [ready] addr={}", bind_addr);
        axum::serve(listener, Self::router(state)).await?;
        Ok(())
    }
}

/// The one response shape for every authentication failure.
fn reject() -> Response {
    StatusCode::FORBIDDEN.into_response()
}

async fn handle_block(
    State(state): State<Arc<NodeState>>,
    Json(cmd): Json<BlockCommand>,
) -> Response {
    if !state.authorized(&cmd.secret) {
        tracing::warn!("[node] [auth_failed] endpoint=/block");
        return reject();
    }
    let Ok(target) = cmd.target.parse::<SourceKey>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "bad target"})),
        )
            .into_response();
    };
    if cmd.duration == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "bad duration"})),
        )
            .into_response();
    }

    match state
        .blocks
        .apply(target.clone(), Duration::from_secs(cmd.duration))
        .await
    {
        Ok(applied) => Json(json!({
            "ok": true,
            "target": target.to_string(),
            "expires_at": applied.expires_at(),
        }))
        .into_response(),
        Err(err) => {
            tracing::error!("[node] [block_failed] target={} err={}", target, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "firewall"})),
            )
                .into_response()
        }
    }
}

async fn handle_unblock(
    State(state): State<Arc<NodeState>>,
    Json(cmd): Json<UnblockCommand>,
) -> Response {
    if !state.authorized(&cmd.secret) {
        tracing::warn!("[node] [auth_failed] endpoint=/unblock");
        return reject();
    }
    let Ok(target) = cmd.target.parse::<SourceKey>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "bad target"})),
        )
            .into_response();
    };

    // Removing an unblocked key is success: the node already matches the
    // requested state, and the reply must not reveal which case it was.
    match state.blocks.remove(&target).await {
        Ok(_) => Json(json!({"ok": true, "target": target.to_string()})).into_response(),
        Err(err) => {
            tracing::error!("[node] [unblock_failed] target={} err={}", target, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"ok": false, "error": "firewall"})),
            )
                .into_response()
        }
    }
}

async fn handle_clear(
    State(state): State<Arc<NodeState>>,
    Json(cmd): Json<ClearCommand>,
) -> Response {
    if !state.authorized(&cmd.secret) {
        tracing::warn!("[node] [auth_failed] endpoint=/clear");
        return reject();
    }
    let cleared = state.blocks.clear().await;
    Json(json!({"ok": true, "cleared": cleared})).into_response()
}

async fn handle_health(State(state): State<Arc<NodeState>>) -> Response {
    Json(json!({
        "node": state.name,
        "blocked": state.blocks.len().await,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "reporter": {
            "sent": state.stats.sent.load(Ordering::Relaxed),
            "dropped": state.stats.dropped.load(Ordering::Relaxed),
            "errors": state.stats.send_errors.load(Ordering::Relaxed),
            "skipped_lines": state.stats.skipped_lines.load(Ordering::Relaxed),
        },
    }))
    .into_response()
}

async fn handle_stats(State(state): State<Arc<NodeState>>) -> Response {
    let blocked: Vec<_> = state
        .blocks
        .snapshot()
        .await
        .into_iter()
        .map(|(target, expires_at)| {
            json!({"target": target.to_string(), "expires_at": expires_at})
        })
        .collect();
    Json(json!({"node": state.name, "blocked": blocked})).into_response()
}

/// Turn raw log lines into connection events. Lines that do not parse are
/// counted and skipped; the pipeline itself never fails.
pub async fn run_pipeline(
    node_id: String,
    stats: Arc<ReporterStats>,
    mut lines: mpsc::Receiver<String>,
    events: mpsc::Sender<ConnectionEvent>,
) {
    while let Some(line) = lines.recv().await {
        let Some(parsed) = parser::parse_line(&line) else {
            stats.skipped_lines.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("[pipeline] [skipped] line={:?}", line);
            continue;
        };
        let event = ConnectionEvent {
            account_id: parsed.account,
            source_ip: parsed.ip,
            source_port: Some(parsed.port),
            node_id: node_id.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        if events.send(event).await.is_err() {
            return;
        }
    }
}
