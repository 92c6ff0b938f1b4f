//! Enforcement dispatcher
//!
//! A violating source may be connected through any node in the fleet, so every
//! command fans out to all of them concurrently. Delivery to at least one node
//! counts as success. Nodes that are down eat their timeout without holding
//! the others back.

use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::wire::{BlockCommand, SourceKey, UnblockCommand};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct NodeEndpoint {
    name: String,
    url: String,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn any_delivered(&self) -> bool {
        self.delivered > 0
    }
}

pub struct EnforcementDispatcher {
    client: reqwest::Client,
    endpoints: Vec<NodeEndpoint>,
    secret: String,
}

/// Node addresses in the registry may be a bare host (the fleet node port
/// applies), host:port, or a full http URL. A bare IPv6 address gets
/// bracketed before the port is appended.
fn node_url(addr: &str, node_port: u16) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return addr.trim_end_matches('/').to_string();
    }
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return match ip {
            IpAddr::V6(_) => format!("http://[{}]:{}", ip, node_port),
            IpAddr::V4(_) => format!("http://{}:{}", ip, node_port),
        };
    }
    if addr.contains(':') {
        return format!("http://{}", addr);
    }
    format!("http://{}:{}", addr, node_port)
}

impl EnforcementDispatcher {
    pub fn new(
        nodes: &HashMap<String, String>,
        node_port: u16,
        secret: String,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(CALL_TIMEOUT).build()?;
        let mut endpoints: Vec<NodeEndpoint> = nodes
            .iter()
            .map(|(name, addr)| NodeEndpoint {
                name: name.clone(),
                url: node_url(addr, node_port),
            })
            .collect();
        endpoints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self {
            client,
            endpoints,
            secret,
        })
    }

    pub fn node_count(&self) -> usize {
        self.endpoints.len()
    }

    pub async fn broadcast_block(&self, target: &SourceKey, duration: u64) -> DispatchOutcome {
        let cmd = BlockCommand {
            target: target.to_string(),
            duration,
            secret: self.secret.clone(),
        };
        let outcome = self.broadcast("/block", cmd).await;
        tracing::info!(
            "[dispatch] [block] target={} secs={} delivered={} failed={}",
            target,
            duration,
            outcome.delivered,
            outcome.failed
        );
        outcome
    }

    pub async fn broadcast_unblock(&self, target: &SourceKey) -> DispatchOutcome {
        let cmd = UnblockCommand {
            target: target.to_string(),
            secret: self.secret.clone(),
        };
        let outcome = self.broadcast("/unblock", cmd).await;
        tracing::info!(
            "[dispatch] [unblock] target={} delivered={} failed={}",
            target,
            outcome.delivered,
            outcome.failed
        );
        outcome
    }

    async fn broadcast<T>(&self, path: &'static str, cmd: T) -> DispatchOutcome
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let mut calls = JoinSet::new();
        for endpoint in &self.endpoints {
            let client = self.client.clone();
            let name = endpoint.name.clone();
            let url = format!("{}{}", endpoint.url, path);
            let cmd = cmd.clone();
            calls.spawn(async move {
                match client.post(&url).json(&cmd).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        tracing::debug!("[dispatch] [delivered] node={}", name);
                        true
                    }
                    Ok(resp) => {
                        tracing::warn!(
                            "[dispatch] [rejected] node={} status={}",
                            name,
                            resp.status().as_u16()
                        );
                        false
                    }
                    Err(err) => {
                        tracing::warn!("[dispatch] [unreachable] node={} err={}", name, err);
                        false
                    }
                }
            });
        }

        let mut outcome = DispatchOutcome {
            delivered: 0,
            failed: 0,
        };
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(true) => outcome.delivered += 1,
                _ => outcome.failed += 1,
            }
        }
        outcome
    }
}
