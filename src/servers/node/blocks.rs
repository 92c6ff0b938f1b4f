//! Active block table
//!
//! Every mutation of block state - apply, extend, expire, unblock, clear -
//! goes through the table mutex, with the firewall call made while the lock is
//! held. Rule state and table state therefore never diverge, and a key can
//! never have two live expiry timers: re-applying with a longer duration
//! aborts the old timer first, and a generation counter keeps an already-fired
//! old timer from tearing down its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::firewall::{Firewall, FirewallError};
use crate::wire::SourceKey;

struct ActiveBlock {
    expires_at_ms: i64,
    generation: u64,
    timer: JoinHandle<()>,
}

/// What a block request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// New rule installed.
    Blocked { expires_at: i64 },
    /// Key was blocked already; expiry pushed out.
    Extended { expires_at: i64 },
    /// Key was blocked already with at least as much time left.
    Unchanged { expires_at: i64 },
}

impl Applied {
    /// Expiry in unix seconds, whichever variant.
    pub fn expires_at(&self) -> i64 {
        match self {
            Applied::Blocked { expires_at }
            | Applied::Extended { expires_at }
            | Applied::Unchanged { expires_at } => *expires_at,
        }
    }
}

pub struct BlockTable {
    firewall: Firewall,
    inner: Mutex<HashMap<SourceKey, ActiveBlock>>,
    next_generation: AtomicU64,
}

impl BlockTable {
    pub fn new(firewall: Firewall) -> Self {
        Self {
            firewall,
            inner: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Block `target` for `duration`. Re-delivery is idempotent: a shorter or
    /// equal grant leaves the existing block untouched, a longer one replaces
    /// the timer.
    pub async fn apply(
        self: &Arc<Self>,
        target: SourceKey,
        duration: Duration,
    ) -> Result<Applied, FirewallError> {
        let expires_at_ms =
            chrono::Utc::now().timestamp_millis() + duration.as_millis() as i64;
        let mut blocks = self.inner.lock().await;

        if let Some(active) = blocks.get_mut(&target) {
            if expires_at_ms <= active.expires_at_ms {
                tracing::debug!("[node] [block_unchanged] target={}", target);
                return Ok(Applied::Unchanged {
                    expires_at: active.expires_at_ms / 1000,
                });
            }
            active.timer.abort();
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            active.generation = generation;
            active.expires_at_ms = expires_at_ms;
            active.timer = self.spawn_expiry(target.clone(), duration, generation);
            tracing::info!(
                "[node] [block_extended] target={} secs={}",
                target,
                duration.as_secs()
            );
            return Ok(Applied::Extended {
                expires_at: expires_at_ms / 1000,
            });
        }

        self.firewall.insert(&target).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.spawn_expiry(target.clone(), duration, generation);
        blocks.insert(
            target.clone(),
            ActiveBlock {
                expires_at_ms,
                generation,
                timer,
            },
        );
        tracing::info!(
            "[node] [blocked] target={} secs={}",
            target,
            duration.as_secs()
        );
        Ok(Applied::Blocked {
            expires_at: expires_at_ms / 1000,
        })
    }

    /// Unblock `target`: cancel its timer, drop the rule. Returns whether the
    /// key was blocked at all.
    pub async fn remove(&self, target: &SourceKey) -> Result<bool, FirewallError> {
        let mut blocks = self.inner.lock().await;
        let Some(active) = blocks.remove(target) else {
            return Ok(false);
        };
        active.timer.abort();
        self.firewall.remove(target).await?;
        tracing::info!("[node] [unblocked] target={}", target);
        Ok(true)
    }

    /// Drop every block. Firewall failures are logged and skipped so one bad
    /// rule cannot strand the rest. Returns how many entries were cleared.
    pub async fn clear(&self) -> usize {
        let mut blocks = self.inner.lock().await;
        let mut cleared = 0;
        for (target, active) in blocks.drain() {
            active.timer.abort();
            if let Err(err) = self.firewall.remove(&target).await {
                tracing::warn!("[node] [clear_failed] target={} err={}", target, err);
            }
            cleared += 1;
        }
        if cleared > 0 {
            tracing::info!("[node] [cleared] count={}", cleared);
        }
        cleared
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Blocked targets with their expiry in unix seconds.
    pub async fn snapshot(&self) -> Vec<(SourceKey, i64)> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(k, a)| (k.clone(), a.expires_at_ms / 1000))
            .collect()
    }

    fn spawn_expiry(
        self: &Arc<Self>,
        target: SourceKey,
        duration: Duration,
        generation: u64,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            table.expire(&target, generation).await;
        })
    }

    /// Timer callback. Only acts if the entry still belongs to this timer's
    /// generation; an aborted-but-already-fired timer finds a newer generation
    /// and backs off.
    async fn expire(&self, target: &SourceKey, generation: u64) {
        let mut blocks = self.inner.lock().await;
        let current = blocks
            .get(target)
            .is_some_and(|active| active.generation == generation);
        if !current {
            return;
        }
        blocks.remove(target);
        if let Err(err) = self.firewall.remove(target).await {
            tracing::warn!("[node] [expire_failed] target={} err={}", target, err);
        }
        tracing::info!("[node] [block_expired] target={}", target);
    }
}
