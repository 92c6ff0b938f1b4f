//! Active-connection registry
//!
//! Tracks, per account, which sources were seen inside the detection window.
//! Hot path: every ingested event lands here and every detection pass reads
//! from here, so accounts are spread over a fixed set of mutex shards keyed by
//! account hash. A source is active while `now - last_seen <= window`.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use crate::wire::SourceKey;

const SHARD_COUNT: usize = 16;

type AccountSources = HashMap<String, HashMap<SourceKey, i64>>;

pub struct ConnectionRegistry {
    shards: Vec<Mutex<AccountSources>>,
    window_secs: i64,
}

impl ConnectionRegistry {
    pub fn new(window_secs: i64) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            shards,
            window_secs,
        }
    }

    pub fn window_secs(&self) -> i64 {
        self.window_secs
    }

    fn shard(&self, account: &str) -> &Mutex<AccountSources> {
        let mut hasher = DefaultHasher::new();
        account.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Record an observation. Re-seeing a known source refreshes its
    /// `last_seen` instead of adding a duplicate; out-of-order events never
    /// move `last_seen` backwards.
    pub fn record(&self, account: &str, key: SourceKey, seen_at: i64) {
        let mut shard = self.shard(account).lock().unwrap();
        let sources = shard.entry(account.to_string()).or_default();
        let last_seen = sources.entry(key).or_insert(seen_at);
        *last_seen = (*last_seen).max(seen_at);
    }

    /// Snapshot of the account's active sources as (key, last_seen) pairs.
    /// Entries that have aged out of the window are evicted on the way.
    pub fn active_sources(&self, account: &str, now: i64) -> Vec<(SourceKey, i64)> {
        let cutoff = now - self.window_secs;
        let mut shard = self.shard(account).lock().unwrap();
        let Some(sources) = shard.get_mut(account) else {
            return Vec::new();
        };
        sources.retain(|_, last_seen| *last_seen >= cutoff);
        if sources.is_empty() {
            shard.remove(account);
            return Vec::new();
        }
        sources.iter().map(|(k, seen)| (k.clone(), *seen)).collect()
    }

    /// Evict every aged-out source and every emptied account.
    /// Returns how many source entries were removed.
    pub fn sweep(&self, now: i64) -> usize {
        let cutoff = now - self.window_secs;
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            for sources in shard.values_mut() {
                let before = sources.len();
                sources.retain(|_, last_seen| *last_seen >= cutoff);
                evicted += before - sources.len();
            }
            shard.retain(|_, sources| !sources.is_empty());
        }
        evicted
    }

    /// Bulk-load observations, typically replayed from the store after a
    /// restart. Returns how many rows were loaded.
    pub fn rebuild<I>(&self, rows: I) -> usize
    where
        I: IntoIterator<Item = (String, SourceKey, i64)>,
    {
        let mut loaded = 0;
        for (account, key, seen_at) in rows {
            self.record(&account, key, seen_at);
            loaded += 1;
        }
        loaded
    }

    pub fn account_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn source_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().values().map(HashMap::len).sum::<usize>())
            .sum()
    }
}
