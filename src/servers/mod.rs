//! Server process implementations
//!
//! The two processes:
//! - control_server: ingestion, registry, detection, dispatch (central)
//! - node_agent: log tailing, reporting, enforcement (one per VPN node)

pub mod control;
pub mod node;
