//! Control server
//!
//! Central half of the fleet: ingests connection events reported by the node
//! agents, keeps the windowed registry of active sources per account, and
//! spawns a detection pass for every account touched by a batch. Detection
//! and fan-out happen off the ingest path so a slow node never backs up
//! event reporting.

pub mod detect;
pub mod dispatch;

use anyhow::{Context, Result};
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::WardenConfig;
use crate::policy::PolicyClient;
use crate::registry::ConnectionRegistry;
use crate::store::ObservationStore;
use crate::wire::{EventBatch, SourceKey, UnblockCommand};
use detect::ViolationDetector;
use dispatch::EnforcementDispatcher;

pub struct ControlState {
    pub config: WardenConfig,
    pub registry: ConnectionRegistry,
    pub store: ObservationStore,
    pub policy: PolicyClient,
    pub dispatcher: EnforcementDispatcher,
    pub detector: ViolationDetector,
}

impl ControlState {
    pub fn new(config: WardenConfig, store: ObservationStore) -> Result<Self> {
        let registry = ConnectionRegistry::new(config.window_secs);
        let policy =
            PolicyClient::from_config(&config.policy).context("Failed to build policy client")?;
        let dispatcher =
            EnforcementDispatcher::new(&config.nodes, config.node_port, config.secret.clone())
                .context("Failed to build dispatcher")?;
        let detector = ViolationDetector::from_config(&config);
        Ok(Self {
            config,
            registry,
            store,
            policy,
            dispatcher,
            detector,
        })
    }

    fn authorized(&self, presented: &str) -> bool {
        !self.config.secret.is_empty() && presented == self.config.secret
    }

    pub fn router(state: Arc<Self>) -> Router {
        Router::new()
            .route("/events", post(handle_events))
            .route("/unblock", post(handle_unblock))
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .with_state(state)
    }

    pub async fn run(state: Arc<Self>, bind_addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("[control] [ready] addr={}", bind_addr);
        axum::serve(listener, Self::router(state)).await?;
        Ok(())
    }

    /// Replay the persisted observation log into the registry after a
    /// restart. Returns how many rows were loaded.
    pub async fn rebuild_registry(&self) -> Result<usize, sqlx::Error> {
        let cutoff = Utc::now().timestamp() - self.config.window_secs;
        let rows = self.store.load_recent(cutoff).await?;
        let loaded = self.registry.rebuild(rows.into_iter().map(|row| {
            let key = self.config.granularity.key(row.ip, row.port);
            (row.account, key, row.seen_at)
        }));
        Ok(loaded)
    }

    /// Periodic housekeeping: registry eviction, store pruning, detector and
    /// policy-cache map pruning.
    pub fn spawn_sweeper(state: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(state.config.sweep_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp();
                let evicted = state.registry.sweep(now);
                let (cooldowns, issued) = state.detector.prune(now);
                let cache = state.policy.prune_cache(now);
                // keep one extra window of rows so a restart straight after
                // the sweep still rebuilds a full window
                let cutoff = now - state.config.window_secs * 2;
                match state.store.prune(cutoff).await {
                    Ok(removed) => tracing::debug!(
                        "[control] [sweep] evicted={} pruned_rows={} cooldowns={} issued={} cache={}",
                        evicted,
                        removed,
                        cooldowns,
                        issued,
                        cache
                    ),
                    Err(err) => {
                        tracing::warn!("[control] [sweep] store prune failed: {}", err)
                    }
                }
            }
        })
    }
}

/// The one response shape for every authentication failure.
fn reject() -> Response {
    StatusCode::FORBIDDEN.into_response()
}

async fn handle_events(
    State(state): State<Arc<ControlState>>,
    Json(batch): Json<EventBatch>,
) -> Response {
    if !state.authorized(&batch.secret) {
        tracing::warn!("[control] [auth_failed] endpoint=/events node={}", batch.node_id);
        return reject();
    }

    let now = Utc::now().timestamp();
    let mut accepted = Vec::with_capacity(batch.events.len());
    let mut touched: HashSet<String> = HashSet::new();
    for mut ev in batch.events {
        if ev.account_id.is_empty() {
            continue;
        }
        // agent clocks may run ahead; an observation is never newer than now
        ev.timestamp = ev.timestamp.min(now);
        let key = state.config.granularity.key(ev.source_ip, ev.source_port);
        state.registry.record(&ev.account_id, key, ev.timestamp);
        touched.insert(ev.account_id.clone());
        accepted.push(ev);
    }

    if let Err(err) = state.store.append_batch(&accepted).await {
        tracing::warn!("[control] [store_failed] events={} err={}", accepted.len(), err);
    }

    let processed = accepted.len();
    tracing::debug!(
        "[control] [ingest] node={} events={} accounts={}",
        batch.node_id,
        processed,
        touched.len()
    );
    for account in touched {
        tokio::spawn(detect::check_account(Arc::clone(&state), account));
    }

    Json(json!({"ok": true, "processed": processed})).into_response()
}

/// Operator-driven early lift of a block: forget the issued entry so the
/// detector may re-block, then fan the unblock out to every node.
async fn handle_unblock(
    State(state): State<Arc<ControlState>>,
    Json(cmd): Json<UnblockCommand>,
) -> Response {
    if !state.authorized(&cmd.secret) {
        tracing::warn!("[control] [auth_failed] endpoint=/unblock");
        return reject();
    }
    let Ok(target) = cmd.target.parse::<SourceKey>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"ok": false, "error": "bad target"})),
        )
            .into_response();
    };

    state.detector.forget_issued(&target);
    let outcome = state.dispatcher.broadcast_unblock(&target).await;
    Json(json!({
        "ok": true,
        "target": target.to_string(),
        "delivered": outcome.delivered,
        "failed": outcome.failed,
    }))
    .into_response()
}

async fn handle_health(State(state): State<Arc<ControlState>>) -> Response {
    Json(json!({
        "status": "ok",
        "accounts": state.registry.account_count(),
        "sources": state.registry.source_count(),
    }))
    .into_response()
}

async fn handle_stats(State(state): State<Arc<ControlState>>) -> Response {
    let stored_rows = state.store.count().await.unwrap_or(-1);
    Json(json!({
        "window_secs": state.config.window_secs,
        "block_secs": state.config.block_secs,
        "selection": state.config.selection,
        "enforce": state.config.enforce,
        "nodes": state.dispatcher.node_count(),
        "accounts": state.registry.account_count(),
        "sources": state.registry.source_count(),
        "issued_blocks": state.detector.issued_count(),
        "policy_cache": state.policy.cached_entries(),
        "stored_rows": stored_rows,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ConnectionEvent;

    async fn test_state() -> Arc<ControlState> {
        let config = WardenConfig::from_str(
            r#"
secret: "fleet-secret-1"
window_secs: 60
enforce: false
policy:
  mode: static
  default_limit: 2
"#,
        )
        .unwrap();
        let store = ObservationStore::memory().await.unwrap();
        Arc::new(ControlState::new(config, store).unwrap())
    }

    fn batch(secret: &str, events: Vec<ConnectionEvent>) -> EventBatch {
        EventBatch {
            node_id: "helsinki-1".to_string(),
            secret: secret.to_string(),
            events,
        }
    }

    fn event(account: &str, ip: &str, ts: i64) -> ConnectionEvent {
        ConnectionEvent {
            account_id: account.to_string(),
            source_ip: ip.parse().unwrap(),
            source_port: Some(16708),
            node_id: "helsinki-1".to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_ingest_rejects_wrong_secret() {
        let state = test_state().await;
        let now = Utc::now().timestamp();
        let resp = handle_events(
            State(Arc::clone(&state)),
            Json(batch("wrong", vec![event("a1", "10.0.0.1", now)])),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.registry.source_count(), 0, "rejected batch must not record");
    }

    #[tokio::test]
    async fn test_ingest_records_and_persists() {
        let state = test_state().await;
        let now = Utc::now().timestamp();
        let resp = handle_events(
            State(Arc::clone(&state)),
            Json(batch(
                "fleet-secret-1",
                vec![
                    event("a1", "10.0.0.1", now),
                    event("a1", "10.0.0.2", now),
                    event("", "10.0.0.3", now),
                ],
            )),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.registry.active_sources("a1", now).len(), 2);
        assert_eq!(state.store.count().await.unwrap(), 2, "empty account skipped");
    }

    #[tokio::test]
    async fn test_ingest_clamps_future_timestamps() {
        let state = test_state().await;
        let now = Utc::now().timestamp();
        handle_events(
            State(Arc::clone(&state)),
            Json(batch("fleet-secret-1", vec![event("a1", "10.0.0.1", now + 3600)])),
        )
        .await;

        let active = state.registry.active_sources("a1", now + 1);
        assert_eq!(active.len(), 1);
        assert!(active[0].1 <= now + 1, "skewed timestamp must be clamped");
    }

    #[tokio::test]
    async fn test_rebuild_restores_window() {
        let state = test_state().await;
        let now = Utc::now().timestamp();
        state
            .store
            .append_batch(&[
                event("a1", "10.0.0.1", now - 10),
                event("a1", "10.0.0.2", now - 5),
                event("a2", "10.0.0.3", now - 3600),
            ])
            .await
            .unwrap();

        let loaded = state.rebuild_registry().await.unwrap();
        assert_eq!(loaded, 2, "row outside the window stays out");
        assert_eq!(state.registry.active_sources("a1", now).len(), 2);
        assert!(state.registry.active_sources("a2", now).is_empty());
    }
}
