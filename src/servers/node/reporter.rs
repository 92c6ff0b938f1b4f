//! Event reporter
//!
//! Ships parsed connection events to the control server in batches. Delivery
//! is best-effort: a batch is retried with backoff a few times, then dropped
//! with a counter bump - the registry only ever needs the last window of
//! observations, so a lost batch heals itself on the next connection.

use rand::RngExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::wire::{ConnectionEvent, EventBatch};

const SEND_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_JITTER_MS: u64 = 500;

/// Shared counters surfaced by the node health endpoint and the stats log.
#[derive(Debug, Default)]
pub struct ReporterStats {
    /// Events delivered to the control server.
    pub sent: AtomicU64,
    /// Events dropped after exhausting retries.
    pub dropped: AtomicU64,
    /// Failed upload attempts.
    pub send_errors: AtomicU64,
    /// Log lines that parsed to nothing.
    pub skipped_lines: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("upload failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("control server returned status {0}")]
    Status(u16),
}

pub struct EventReporter {
    client: reqwest::Client,
    endpoint: String,
    node_id: String,
    secret: String,
    batch_max: usize,
    flush_interval: Duration,
    stats: Arc<ReporterStats>,
}

impl EventReporter {
    pub fn new(
        server_url: &str,
        node_id: String,
        secret: String,
        batch_max: usize,
        flush_interval: Duration,
        stats: Arc<ReporterStats>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/events", server_url.trim_end_matches('/')),
            node_id,
            secret,
            batch_max,
            flush_interval,
            stats,
        })
    }

    /// Consume events until the channel closes, flushing on size or interval.
    pub async fn run(self, mut rx: mpsc::Receiver<ConnectionEvent>) {
        let mut pending: Vec<ConnectionEvent> = Vec::new();
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(event) => {
                        pending.push(event);
                        if pending.len() >= self.batch_max {
                            self.flush(&mut pending).await;
                            ticker.reset();
                        }
                    }
                    None => {
                        self.flush(&mut pending).await;
                        tracing::info!("[reporter] [stopped]");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(&mut pending).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, pending: &mut Vec<ConnectionEvent>) {
        if pending.is_empty() {
            return;
        }
        let events = dedupe(std::mem::take(pending));
        let count = events.len() as u64;
        let batch = EventBatch {
            node_id: self.node_id.clone(),
            secret: self.secret.clone(),
            events,
        };

        match self.send_with_retry(&batch).await {
            Ok(()) => {
                self.stats.sent.fetch_add(count, Ordering::Relaxed);
                tracing::debug!("[reporter] [flushed] events={}", count);
            }
            Err(err) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                tracing::warn!(
                    "[reporter] [batch_dropped] events={} err={}",
                    count,
                    err
                );
            }
        }
    }

    async fn send_with_retry(&self, batch: &EventBatch) -> Result<(), ReportError> {
        let mut attempt = 1;
        loop {
            match self.send(batch).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "[reporter] [attempt_failed] attempt={} err={}",
                        attempt,
                        err
                    );
                    if attempt >= SEND_ATTEMPTS {
                        return Err(err);
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn send(&self, batch: &EventBatch) -> Result<(), ReportError> {
        let resp = self.client.post(&self.endpoint).json(batch).send().await?;
        if !resp.status().is_success() {
            return Err(ReportError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s... plus up to half a second.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Collapse duplicate (account, source) pairs inside one batch, keeping the
/// newest timestamp. One chatty connection can emit dozens of identical lines
/// per flush interval; the registry only cares about the last one.
fn dedupe(events: Vec<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut newest: HashMap<(String, String, Option<u16>), ConnectionEvent> = HashMap::new();
    for event in events {
        let key = (
            event.account_id.clone(),
            event.source_ip.to_string(),
            event.source_port,
        );
        match newest.get(&key) {
            Some(existing) if existing.timestamp >= event.timestamp => {}
            _ => {
                newest.insert(key, event);
            }
        }
    }
    newest.into_values().collect()
}
