//! Violation detection
//!
//! One pass per account, spawned off the ingest path: snapshot the account's
//! active sources, compare against its device limit, pick the sources that
//! have to go and hand them to the dispatcher. Two dampers keep an over-limit
//! account from turning into a block storm: a per-account cooldown between
//! enforcement rounds, and a memory of already-issued blocks so a target is
//! not re-sent while its rule still has the full grant left.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{SelectionPolicy, WardenConfig};
use crate::wire::SourceKey;

use super::ControlState;

pub struct ViolationDetector {
    selection: SelectionPolicy,
    enforce: bool,
    block_secs: u64,
    cooldown_secs: i64,
    /// account -> unix seconds of the last enforcement round.
    recently_enforced: Mutex<HashMap<String, i64>>,
    /// target -> expiry of the block last dispatched for it.
    issued: Mutex<HashMap<SourceKey, i64>>,
}

impl ViolationDetector {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            selection: config.selection,
            enforce: config.enforce,
            block_secs: config.block_secs,
            cooldown_secs: config.cooldown_secs,
            recently_enforced: Mutex::new(HashMap::new()),
            issued: Mutex::new(HashMap::new()),
        }
    }

    fn cooling_down(&self, account: &str, now: i64) -> bool {
        self.recently_enforced
            .lock()
            .unwrap()
            .get(account)
            .is_some_and(|at| now - at < self.cooldown_secs)
    }

    fn mark_enforced(&self, account: &str, now: i64) {
        self.recently_enforced
            .lock()
            .unwrap()
            .insert(account.to_string(), now);
    }

    /// Drop targets whose previously issued block still has at least a full
    /// grant left. Anything shorter gets re-sent; the node side extends.
    fn suppress_issued(&self, targets: Vec<SourceKey>, now: i64) -> Vec<SourceKey> {
        let issued = self.issued.lock().unwrap();
        let grant = self.block_secs as i64;
        targets
            .into_iter()
            .filter(|key| {
                issued
                    .get(key)
                    .is_none_or(|expires_at| expires_at - now < grant)
            })
            .collect()
    }

    fn note_issued(&self, target: &SourceKey, expires_at: i64) {
        self.issued.lock().unwrap().insert(target.clone(), expires_at);
    }

    /// Drop the issued-block memory for a manually unblocked target so the
    /// next detection pass may block it again.
    pub fn forget_issued(&self, target: &SourceKey) {
        self.issued.lock().unwrap().remove(target);
    }

    /// Drop expired cooldown and issued-block entries.
    /// Returns (cooldowns dropped, issued entries dropped).
    pub fn prune(&self, now: i64) -> (usize, usize) {
        let mut recent = self.recently_enforced.lock().unwrap();
        let before = recent.len();
        recent.retain(|_, at| now - *at < self.cooldown_secs);
        let cooldowns = before - recent.len();
        drop(recent);

        let mut issued = self.issued.lock().unwrap();
        let before = issued.len();
        issued.retain(|_, expires_at| *expires_at > now);
        (cooldowns, before - issued.len())
    }

    pub fn issued_count(&self) -> usize {
        self.issued.lock().unwrap().len()
    }
}

/// Pick which sources of an over-limit account get blocked.
///
/// Ties on `last_seen` are broken by the key itself so repeated passes over
/// the same snapshot pick the same targets.
pub fn select_targets(
    policy: SelectionPolicy,
    mut active: Vec<(SourceKey, i64)>,
    limit: usize,
) -> Vec<SourceKey> {
    if active.len() <= limit {
        return Vec::new();
    }
    active.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let excess = active.len() - limit;
    match policy {
        SelectionPolicy::Newest => active
            .iter()
            .rev()
            .take(excess)
            .map(|(key, _)| key.clone())
            .collect(),
        SelectionPolicy::Oldest => active
            .iter()
            .take(excess)
            .map(|(key, _)| key.clone())
            .collect(),
        SelectionPolicy::All => active.into_iter().map(|(key, _)| key).collect(),
    }
}

/// Full detection pass for one account.
pub async fn check_account(state: Arc<ControlState>, account: String) {
    let now = Utc::now().timestamp();
    let detector = &state.detector;

    if detector.cooling_down(&account, now) {
        tracing::debug!("[detect] [cooldown] account={}", account);
        return;
    }

    let active = state.registry.active_sources(&account, now);
    if active.len() <= 1 {
        return;
    }

    let limit = match state.policy.device_limit(&account, now).await {
        Ok(Some(limit)) => limit as usize,
        Ok(None) => {
            tracing::trace!("[detect] [unlimited] account={}", account);
            return;
        }
        Err(err) => {
            // Unknown limit is neither allow-all nor deny-all: skip this
            // round and let a later pass retry once the policy source is back.
            tracing::warn!("[detect] [limit_unavailable] account={} err={}", account, err);
            return;
        }
    };

    if active.len() <= limit {
        return;
    }

    tracing::warn!(
        "[detect] [violation] account={} active={} limit={}",
        account,
        active.len(),
        limit
    );

    let targets = select_targets(detector.selection, active, limit);
    let targets = detector.suppress_issued(targets, now);
    if targets.is_empty() {
        tracing::debug!("[detect] [already_issued] account={}", account);
        return;
    }

    if !detector.enforce {
        for target in &targets {
            tracing::info!("[detect] [dry_run] account={} target={}", account, target);
        }
        detector.mark_enforced(&account, now);
        return;
    }

    let mut issued = 0;
    for target in &targets {
        let outcome = state
            .dispatcher
            .broadcast_block(target, detector.block_secs)
            .await;
        if outcome.any_delivered() {
            detector.note_issued(target, now + detector.block_secs as i64);
            issued += 1;
        } else {
            tracing::error!(
                "[detect] [dispatch_failed] account={} target={} nodes={}",
                account,
                target,
                outcome.failed
            );
        }
    }
    if issued > 0 {
        detector.mark_enforced(&account, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> SourceKey {
        s.parse().unwrap()
    }

    fn detector(yaml: &str) -> ViolationDetector {
        ViolationDetector::from_config(&WardenConfig::from_str(yaml).unwrap())
    }

    fn snapshot() -> Vec<(SourceKey, i64)> {
        vec![
            (key("10.0.0.1"), 1000),
            (key("10.0.0.2"), 1005),
            (key("10.0.0.3"), 1010),
        ]
    }

    #[test]
    fn test_select_newest_blocks_latest_arrivals() {
        let targets = select_targets(SelectionPolicy::Newest, snapshot(), 2);
        assert_eq!(targets, vec![key("10.0.0.3")]);

        let targets = select_targets(SelectionPolicy::Newest, snapshot(), 1);
        assert_eq!(targets, vec![key("10.0.0.3"), key("10.0.0.2")]);
    }

    #[test]
    fn test_select_oldest_blocks_earliest_arrivals() {
        let targets = select_targets(SelectionPolicy::Oldest, snapshot(), 2);
        assert_eq!(targets, vec![key("10.0.0.1")]);
    }

    #[test]
    fn test_select_all_blocks_everything() {
        let targets = select_targets(SelectionPolicy::All, snapshot(), 2);
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_select_within_limit_is_empty() {
        assert!(select_targets(SelectionPolicy::Newest, snapshot(), 3).is_empty());
        assert!(select_targets(SelectionPolicy::All, snapshot(), 3).is_empty());
        assert!(select_targets(SelectionPolicy::Newest, Vec::new(), 1).is_empty());
    }

    #[test]
    fn test_select_breaks_timestamp_ties_deterministically() {
        let tied = vec![
            (key("10.0.0.2"), 1000),
            (key("10.0.0.1"), 1000),
            (key("10.0.0.3"), 1000),
        ];
        let first = select_targets(SelectionPolicy::Newest, tied.clone(), 2);
        let second = select_targets(SelectionPolicy::Newest, tied, 2);
        assert_eq!(first, second);
        assert_eq!(first, vec![key("10.0.0.3")]);
    }

    #[test]
    fn test_cooldown_gate() {
        let det = detector("secret: \"fleet-secret-1\"\ncooldown_secs: 30\n");
        assert!(!det.cooling_down("a1", 1000));

        det.mark_enforced("a1", 1000);
        assert!(det.cooling_down("a1", 1010));
        assert!(det.cooling_down("a1", 1029));
        assert!(!det.cooling_down("a1", 1030));
        assert!(!det.cooling_down("a2", 1010), "cooldown is per account");
    }

    #[test]
    fn test_suppress_freshly_issued_target() {
        let det = detector("secret: \"fleet-secret-1\"\nblock_secs: 60\n");
        det.note_issued(&key("10.0.0.3"), 1060);

        // same instant: full grant left, suppressed
        let kept = det.suppress_issued(vec![key("10.0.0.3"), key("10.0.0.2")], 1000);
        assert_eq!(kept, vec![key("10.0.0.2")]);

        // a second later the remaining TTL is below a full grant: re-send
        let kept = det.suppress_issued(vec![key("10.0.0.3")], 1001);
        assert_eq!(kept, vec![key("10.0.0.3")]);
    }

    #[test]
    fn test_forget_issued_lifts_suppression() {
        let det = detector("secret: \"fleet-secret-1\"\nblock_secs: 60\n");
        det.note_issued(&key("10.0.0.3"), 1060);
        assert!(det.suppress_issued(vec![key("10.0.0.3")], 1000).is_empty());

        det.forget_issued(&key("10.0.0.3"));
        let kept = det.suppress_issued(vec![key("10.0.0.3")], 1000);
        assert_eq!(kept, vec![key("10.0.0.3")]);
        assert_eq!(det.issued_count(), 0);
    }

    #[test]
    fn test_prune_drops_expired_entries() {
        let det = detector("secret: \"fleet-secret-1\"\ncooldown_secs: 30\nblock_secs: 60\n");
        det.mark_enforced("a1", 1000);
        det.note_issued(&key("10.0.0.3"), 1060);
        assert_eq!(det.prune(1010), (0, 0));

        det.mark_enforced("a2", 1100);
        det.note_issued(&key("10.0.0.4"), 1200);
        let (cooldowns, issued) = det.prune(1130);
        assert_eq!(cooldowns, 1, "a1 cooldown long over");
        assert_eq!(issued, 1, "10.0.0.3 block long expired");
        assert_eq!(det.issued_count(), 1);
    }
}
