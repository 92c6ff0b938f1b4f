//! Firewall rule backend
//!
//! Block rules are plain DROP entries in the INPUT chain, keyed by source
//! address and optionally narrowed by source port. Insertion is guarded by an
//! `iptables -C` probe so re-delivered commands never stack duplicate rules.
//! The `none` backend logs instead of executing, for staging and tests.

use std::process::Stdio;
use tokio::process::Command;

use crate::config::FirewallMode;
use crate::wire::SourceKey;

const IPTABLES: &str = "iptables";
const CHAIN: &str = "INPUT";

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} {action} exited with code {code}")]
    Exited {
        program: String,
        action: &'static str,
        code: i32,
    },
}

pub struct Firewall {
    mode: FirewallMode,
}

/// Match arguments for one source key: `-s <ip>` plus, when the key carries a
/// port, `-p tcp --sport <port>`, ending in `-j DROP`.
fn rule_args(target: &SourceKey) -> Vec<String> {
    let mut args = vec!["-s".to_string(), target.ip.to_string()];
    if let Some(port) = target.port {
        args.push("-p".to_string());
        args.push("tcp".to_string());
        args.push("--sport".to_string());
        args.push(port.to_string());
    }
    args.push("-j".to_string());
    args.push("DROP".to_string());
    args
}

impl Firewall {
    pub fn new(mode: FirewallMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FirewallMode {
        self.mode
    }

    /// Install the drop rule for `target` unless it is already present.
    pub async fn insert(&self, target: &SourceKey) -> Result<(), FirewallError> {
        if self.mode == FirewallMode::None {
            tracing::debug!("[firewall] [skip_insert] target={}", target);
            return Ok(());
        }

        let rule = rule_args(target);
        if self.rule_exists(&rule).await? {
            tracing::debug!("[firewall] [present] target={}", target);
            return Ok(());
        }

        let status = Command::new(IPTABLES)
            .arg("-I")
            .arg(CHAIN)
            .args(&rule)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| FirewallError::Spawn {
                program: IPTABLES.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(FirewallError::Exited {
                program: IPTABLES.to_string(),
                action: "insert",
                code: status.code().unwrap_or(-1),
            });
        }
        tracing::info!("[firewall] [inserted] target={}", target);
        Ok(())
    }

    /// Remove the drop rule for `target`. Removing a rule that is not there
    /// is not an error; the kernel state already matches the intent.
    pub async fn remove(&self, target: &SourceKey) -> Result<(), FirewallError> {
        if self.mode == FirewallMode::None {
            tracing::debug!("[firewall] [skip_remove] target={}", target);
            return Ok(());
        }

        let status = Command::new(IPTABLES)
            .arg("-D")
            .arg(CHAIN)
            .args(rule_args(target))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| FirewallError::Spawn {
                program: IPTABLES.to_string(),
                source,
            })?;
        if status.success() {
            tracing::info!("[firewall] [removed] target={}", target);
        } else {
            tracing::debug!("[firewall] [not_present] target={}", target);
        }
        Ok(())
    }

    async fn rule_exists(&self, rule: &[String]) -> Result<bool, FirewallError> {
        let status = Command::new(IPTABLES)
            .arg("-C")
            .arg(CHAIN)
            .args(rule)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|source| FirewallError::Spawn {
                program: IPTABLES.to_string(),
                source,
            })?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args_ip_only() {
        let target: SourceKey = "178.176.86.81".parse().unwrap();
        assert_eq!(
            rule_args(&target),
            vec!["-s", "178.176.86.81", "-j", "DROP"]
        );
    }

    #[test]
    fn test_rule_args_ip_port() {
        let target: SourceKey = "178.176.86.81:16708".parse().unwrap();
        assert_eq!(
            rule_args(&target),
            vec!["-s", "178.176.86.81", "-p", "tcp", "--sport", "16708", "-j", "DROP"]
        );
    }

    #[tokio::test]
    async fn test_none_mode_never_executes() {
        let fw = Firewall::new(FirewallMode::None);
        let target: SourceKey = "10.0.0.1".parse().unwrap();
        fw.insert(&target).await.unwrap();
        fw.remove(&target).await.unwrap();
    }
}
