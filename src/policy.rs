//! Device-limit policy client
//!
//! The per-account limit on concurrent sources lives outside this system:
//! either in the subscription panel (fetched over HTTP with a bearer token) or
//! pinned in the config file for fleets without a panel. Lookups go through a
//! TTL cache; a failed lookup is negatively cached for a short period and
//! reported as an error so the detector defers instead of guessing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{PolicyConfig, PolicyMode};

/// Failed lookups are not retried for this long.
const FAILURE_TTL_SECS: i64 = 15;
/// Hard cap on cached accounts; the cache is cleared if a prune cannot get
/// back under it.
const CACHE_MAX_ENTRIES: usize = 65_536;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("policy service returned status {status} for account {account}")]
    Status { status: u16, account: String },
    #[error("policy lookup for {account} failed recently, deferring")]
    Cooling { account: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachedLimit {
    Known(Option<u32>),
    Unavailable,
}

struct CacheEntry {
    value: CachedLimit,
    fetched_at: i64,
}

enum LimitSource {
    Static {
        limits: HashMap<String, u32>,
        default_limit: u32,
    },
    Http {
        client: reqwest::Client,
        base_url: String,
        token: String,
    },
}

pub struct PolicyClient {
    source: LimitSource,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_secs: i64,
}

/// Panel semantics: a limit of zero means "unlimited".
fn normalize(limit: u32) -> Option<u32> {
    if limit == 0 {
        None
    } else {
        Some(limit)
    }
}

impl PolicyClient {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, reqwest::Error> {
        let source = match config.mode {
            PolicyMode::Static => LimitSource::Static {
                limits: config.limits.clone(),
                default_limit: config.default_limit,
            },
            PolicyMode::Http => LimitSource::Http {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()?,
                base_url: config.url.trim_end_matches('/').to_string(),
                token: config.token.clone(),
            },
        };
        Ok(Self {
            source,
            cache: Mutex::new(HashMap::new()),
            cache_secs: config.cache_secs,
        })
    }

    /// The account's concurrent-source limit. `Ok(None)` means no limit is
    /// configured; `Err` means the answer is unknown right now and enforcement
    /// must be deferred.
    pub async fn device_limit(
        &self,
        account: &str,
        now: i64,
    ) -> Result<Option<u32>, PolicyError> {
        if let Some(cached) = self.cache_get(account, now) {
            return match cached {
                CachedLimit::Known(limit) => Ok(limit),
                CachedLimit::Unavailable => Err(PolicyError::Cooling {
                    account: account.to_string(),
                }),
            };
        }

        match self.fetch(account).await {
            Ok(limit) => {
                self.cache_put(account, CachedLimit::Known(limit), now);
                Ok(limit)
            }
            Err(err) => {
                self.cache_put(account, CachedLimit::Unavailable, now);
                Err(err)
            }
        }
    }

    async fn fetch(&self, account: &str) -> Result<Option<u32>, PolicyError> {
        match &self.source {
            LimitSource::Static {
                limits,
                default_limit,
            } => Ok(normalize(
                limits.get(account).copied().unwrap_or(*default_limit),
            )),
            LimitSource::Http {
                client,
                base_url,
                token,
            } => {
                let url = format!("{}/api/users/by-id/{}", base_url, account);
                let resp = client
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(PolicyError::Status {
                        status: resp.status().as_u16(),
                        account: account.to_string(),
                    });
                }
                let body: serde_json::Value = resp.json().await?;
                // Newer panels nest the user under "response"; older ones
                // return it at the top level.
                let user = body.get("response").unwrap_or(&body);
                let limit = user
                    .get("hwidDeviceLimit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32;
                Ok(normalize(limit))
            }
        }
    }

    fn cache_get(&self, account: &str, now: i64) -> Option<CachedLimit> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(account)?;
        let ttl = match entry.value {
            CachedLimit::Known(_) => self.cache_secs,
            CachedLimit::Unavailable => FAILURE_TTL_SECS,
        };
        if now - entry.fetched_at < ttl {
            Some(entry.value)
        } else {
            None
        }
    }

    fn cache_put(&self, account: &str, value: CachedLimit, now: i64) {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            account.to_string(),
            CacheEntry {
                value,
                fetched_at: now,
            },
        );
        if cache.len() > CACHE_MAX_ENTRIES {
            let cache_secs = self.cache_secs;
            cache.retain(|_, e| now - e.fetched_at < cache_secs);
            if cache.len() > CACHE_MAX_ENTRIES {
                tracing::warn!("[policy] [cache_reset] entries={}", cache.len());
                cache.clear();
            }
        }
    }

    /// Drop expired cache entries; called from the sweep task.
    pub fn prune_cache(&self, now: i64) -> usize {
        let mut cache = self.cache.lock().unwrap();
        let before = cache.len();
        let cache_secs = self.cache_secs;
        cache.retain(|_, e| {
            let ttl = match e.value {
                CachedLimit::Known(_) => cache_secs,
                CachedLimit::Unavailable => FAILURE_TTL_SECS,
            };
            now - e.fetched_at < ttl
        });
        before - cache.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
