//! Warden - fleet connection limiter
//!
//! Per-account concurrent-connection enforcement for a fleet of proxy nodes.
//! Node agents tail access logs and report connection events; the control
//! server tracks each account's active sources inside a sliding window and
//! dispatches time-limited blocks for the sources beyond the account's limit.

/// Fleet configuration (one YAML file for every member)
pub mod config;
/// Access-log line parsing
pub mod parser;
/// Device-limit lookup (static table or panel API)
pub mod policy;
/// Windowed account -> active-source registry
pub mod registry;
/// Server implementations (control server, node agent)
pub mod servers;
/// Durable observation log
pub mod store;
/// Log file follower
pub mod tailer;
/// Wire types shared by both ends
pub mod wire;
