//! Wire types shared by the control server and the node agents.
//!
//! Everything here crosses an HTTP boundary as JSON, so field names are part
//! of the protocol. Keep them stable.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// A blockable source identifier: an IP, optionally narrowed to one source port.
///
/// Rendered as `"203.0.113.9"` or `"203.0.113.9:16708"`; IPv6 with a port uses
/// the bracketed form `"[2001:db8::1]:16708"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl SourceKey {
    pub fn ip(ip: IpAddr) -> Self {
        Self { ip, port: None }
    }

    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port: Some(port),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.port) {
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{}]:{}", ip, port),
            (ip, Some(port)) => write!(f, "{}:{}", ip, port),
            (ip, None) => write!(f, "{}", ip),
        }
    }
}

/// Error parsing a [`SourceKey`] from its string form.
#[derive(Debug, thiserror::Error)]
#[error("invalid source key: {0:?}")]
pub struct ParseKeyError(pub String);

impl FromStr for SourceKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Bare address first: covers IPv4 and unbracketed IPv6.
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(SourceKey::ip(ip));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseKeyError(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| ParseKeyError(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseKeyError(s.to_string()))?;
        Ok(SourceKey::ip_port(ip, port))
    }
}

impl Serialize for SourceKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SourceKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One observed connection: an account seen from a source on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub account_id: String,
    pub source_ip: IpAddr,
    pub source_port: Option<u16>,
    pub node_id: String,
    /// Unix seconds, stamped by the agent when the line was parsed.
    pub timestamp: i64,
}

/// Batch upload from a node agent to the control server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub node_id: String,
    pub secret: String,
    pub events: Vec<ConnectionEvent>,
}

/// Block order sent to a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockCommand {
    /// Source key in string form; parsed node-side after auth.
    pub target: String,
    /// Seconds until the rule is removed again.
    pub duration: u64,
    pub secret: String,
}

/// Unblock order sent to a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockCommand {
    pub target: String,
    pub secret: String,
}

/// Drop-everything order sent to a node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearCommand {
    pub secret: String,
}
