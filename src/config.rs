//! Fleet configuration module
//!
//! Parses and manages the warden configuration from YAML files.
//! One file describes the whole fleet: the control server and every node agent
//! read the same config, so an operator can rsync a single file around.
//!
//! Uses serde_yaml for automatic parsing - just define the struct and serde
//! handles all the parsing, validation, and type conversion.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

use crate::wire::SourceKey;

/// Minimum length accepted for the shared secret.
pub const SECRET_MIN_LEN: usize = 8;

/// Which sources get blocked when an account is over its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// Block the most recently seen sources beyond the allowance.
    Newest,
    /// Block the longest-lived sources beyond the allowance.
    Oldest,
    /// Block every active source of the offending account.
    All,
}

/// Whether blocks key on the IP alone or on IP plus source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceGranularity {
    Ip,
    IpPort,
}

impl SourceGranularity {
    /// Build the registry/enforcement key for an observed source.
    pub fn key(&self, ip: IpAddr, port: Option<u16>) -> SourceKey {
        match self {
            SourceGranularity::Ip => SourceKey::ip(ip),
            SourceGranularity::IpPort => SourceKey { ip, port },
        }
    }
}

/// Firewall backend used by the node agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallMode {
    /// Mutate the kernel filter via the iptables binary.
    Iptables,
    /// Log the mutation and do nothing (staging / dry runs).
    None,
}

/// Where per-account device limits come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Limits listed directly in this file.
    Static,
    /// Limits fetched from the panel API.
    Http,
}

/// Main fleet configuration
///
/// This struct is automatically parsed from YAML by serde.
/// Just add a field here, and serde handles the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    // ============================================
    // Shared
    // ============================================
    /// Shared secret presented on every mutating call between fleet members.
    pub secret: String,

    /// Seconds a source stays "active" after its last observation.
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,

    /// Seconds a block rule stays installed.
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,

    /// Block key granularity: by IP, or by IP plus source port.
    #[serde(default = "default_granularity")]
    pub granularity: SourceGranularity,

    /// Port every node agent listens on for control calls.
    #[serde(default = "default_node_port")]
    pub node_port: u16,

    // ============================================
    // Control Server
    // ============================================
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// SQLite file backing the observation log.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Seconds between re-enforcements of the same account.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,

    /// Seconds between registry/store/cache sweep passes.
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,

    /// Which sources to block when an account is over its limit.
    #[serde(default = "default_selection")]
    pub selection: SelectionPolicy,

    /// When false, violations are detected and logged but never dispatched.
    #[serde(default = "default_enforce")]
    pub enforce: bool,

    /// Node registry: name → address. Address may carry an explicit port,
    /// otherwise `node_port` applies.
    #[serde(default)]
    pub nodes: HashMap<String, String>,

    /// Device-limit source.
    #[serde(default)]
    pub policy: PolicyConfig,

    // ============================================
    // Node Agent
    // ============================================
    #[serde(default)]
    pub node: NodeConfig,
}

/// Device-limit source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_policy_mode")]
    pub mode: PolicyMode,

    /// Panel base URL (http mode).
    #[serde(default)]
    pub url: String,

    /// Panel bearer token (http mode).
    #[serde(default)]
    pub token: String,

    /// Seconds a fetched limit is served from cache.
    #[serde(default = "default_policy_cache_secs")]
    pub cache_secs: i64,

    /// Per-account limits (static mode). 0 means unlimited.
    #[serde(default)]
    pub limits: HashMap<String, u32>,

    /// Limit applied to accounts missing from `limits` (static mode).
    /// 0 means unlimited.
    #[serde(default)]
    pub default_limit: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: default_policy_mode(),
            url: String::new(),
            token: String::new(),
            cache_secs: default_policy_cache_secs(),
            limits: HashMap::new(),
            default_limit: 0,
        }
    }
}

/// Node-agent-only configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's name as reported with every event batch.
    #[serde(default)]
    pub name: String,

    /// Control server base URL, e.g. `http://10.0.0.2:5000`.
    #[serde(default)]
    pub server_url: String,

    /// Access log followed by the tailer.
    #[serde(default = "default_log_path")]
    pub log_path: String,

    #[serde(default = "default_firewall")]
    pub firewall: FirewallMode,

    /// Events per upload batch before an early flush.
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,

    /// Seconds between reporter flushes.
    #[serde(default = "default_flush_secs")]
    pub flush_secs: u64,

    /// Milliseconds between tailer polls at EOF.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            server_url: String::new(),
            log_path: default_log_path(),
            firewall: default_firewall(),
            batch_max: default_batch_max(),
            flush_secs: default_flush_secs(),
            poll_ms: default_poll_ms(),
        }
    }
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_window_secs() -> i64 {
    60
}

fn default_block_secs() -> u64 {
    60
}

fn default_granularity() -> SourceGranularity {
    SourceGranularity::Ip
}

fn default_node_port() -> u16 {
    5001
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5000
}

fn default_db_path() -> String {
    "warden.db".to_string()
}

fn default_cooldown_secs() -> i64 {
    30
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_selection() -> SelectionPolicy {
    SelectionPolicy::Newest
}

fn default_enforce() -> bool {
    true
}

fn default_policy_mode() -> PolicyMode {
    PolicyMode::Static
}

fn default_policy_cache_secs() -> i64 {
    300
}

fn default_log_path() -> String {
    "/var/log/xray/access.log".to_string()
}

fn default_firewall() -> FirewallMode {
    FirewallMode::Iptables
}

fn default_batch_max() -> usize {
    500
}

fn default_flush_secs() -> u64 {
    2
}

fn default_poll_ms() -> u64 {
    500
}

impl WardenConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: WardenConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: WardenConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values shared by both binaries
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.secret.is_empty(), "secret cannot be empty");
        anyhow::ensure!(
            self.secret.len() >= SECRET_MIN_LEN,
            "secret too short: {} chars (min {})",
            self.secret.len(),
            SECRET_MIN_LEN
        );
        anyhow::ensure!(self.window_secs > 0, "window_secs must be positive");
        anyhow::ensure!(self.block_secs > 0, "block_secs must be positive");
        anyhow::ensure!(self.node_port != 0, "node_port cannot be 0");
        anyhow::ensure!(self.listen_port != 0, "listen_port cannot be 0");
        anyhow::ensure!(self.sweep_secs > 0, "sweep_secs must be positive");
        anyhow::ensure!(self.cooldown_secs >= 0, "cooldown_secs cannot be negative");

        if self.policy.mode == PolicyMode::Http {
            anyhow::ensure!(
                !self.policy.url.is_empty(),
                "policy.url is required in http mode"
            );
        }
        anyhow::ensure!(
            self.policy.cache_secs > 0,
            "policy.cache_secs must be positive"
        );

        for (name, addr) in &self.nodes {
            anyhow::ensure!(!name.is_empty(), "node name cannot be empty");
            anyhow::ensure!(!addr.is_empty(), "node address for {} cannot be empty", name);
        }

        Ok(())
    }

    /// Extra checks for the control server binary.
    pub fn validate_control(&self) -> Result<()> {
        anyhow::ensure!(!self.listen_ip.is_empty(), "listen_ip cannot be empty");
        anyhow::ensure!(!self.db_path.is_empty(), "db_path cannot be empty");
        if self.enforce {
            anyhow::ensure!(
                !self.nodes.is_empty(),
                "nodes cannot be empty while enforce is on"
            );
        }
        Ok(())
    }

    /// Extra checks for the node agent binary.
    pub fn validate_node(&self) -> Result<()> {
        anyhow::ensure!(!self.node.name.is_empty(), "node.name cannot be empty");
        anyhow::ensure!(
            !self.node.server_url.is_empty(),
            "node.server_url cannot be empty"
        );
        anyhow::ensure!(!self.node.log_path.is_empty(), "node.log_path cannot be empty");
        anyhow::ensure!(self.node.batch_max > 0, "node.batch_max must be positive");
        anyhow::ensure!(self.node.flush_secs > 0, "node.flush_secs must be positive");
        anyhow::ensure!(self.node.poll_ms > 0, "node.poll_ms must be positive");
        Ok(())
    }
}
