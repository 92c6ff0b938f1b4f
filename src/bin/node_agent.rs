use anyhow::{Context, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use warden::config::WardenConfig;
use warden::servers::node::blocks::BlockTable;
use warden::servers::node::firewall::Firewall;
use warden::servers::node::reporter::{EventReporter, ReporterStats};
use warden::servers::node::{run_pipeline, NodeState};
use warden::tailer::LogTailer;

const STATS_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut conf_file = "conf/warden.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: node_agent [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config: WardenConfig = {
        let content = std::fs::read_to_string(&conf_file)
            .with_context(|| format!("Cannot read config: {}", conf_file))?;
        WardenConfig::from_str(&content)
            .with_context(|| format!("Cannot parse config: {}", conf_file))?
    };
    config.validate_node()?;

    let firewall = Firewall::new(config.node.firewall);
    let blocks = Arc::new(BlockTable::new(firewall));
    let stats = Arc::new(ReporterStats::default());

    let (line_tx, line_rx) = mpsc::channel(1024);
    let (event_tx, event_rx) = mpsc::channel(1024);

    let tailer = LogTailer::new(
        &config.node.log_path,
        Duration::from_millis(config.node.poll_ms),
    );
    tokio::spawn(tailer.run(line_tx));

    tokio::spawn(run_pipeline(
        config.node.name.clone(),
        Arc::clone(&stats),
        line_rx,
        event_tx,
    ));

    let reporter = EventReporter::new(
        &config.node.server_url,
        config.node.name.clone(),
        config.secret.clone(),
        config.node.batch_max,
        Duration::from_secs(config.node.flush_secs),
        Arc::clone(&stats),
    )
    .context("Cannot build reporter client")?;
    tokio::spawn(reporter.run(event_rx));

    tracing::info!(
        "[node] [started] name={} log={} firewall={:?} server={}",
        config.node.name,
        config.node.log_path,
        config.node.firewall,
        config.node.server_url
    );

    let bind = format!("0.0.0.0:{}", config.node_port);
    let state = Arc::new(NodeState::new(
        config.node.name.clone(),
        config.secret.clone(),
        Arc::clone(&blocks),
        Arc::clone(&stats),
    ));

    let stats_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(STATS_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::info!(
                "[node] [stats] sent={} dropped={} errors={} skipped={} blocked={}",
                stats_state.stats.sent.load(Ordering::Relaxed),
                stats_state.stats.dropped.load(Ordering::Relaxed),
                stats_state.stats.send_errors.load(Ordering::Relaxed),
                stats_state.stats.skipped_lines.load(Ordering::Relaxed),
                stats_state.blocks.len().await
            );
        }
    });

    tokio::select! {
        result = NodeState::run(Arc::clone(&state), &bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            // leave no orphan drop rules behind
            let cleared = state.blocks.clear().await;
            tracing::info!("[node] [stopped] cleared={}", cleared);
        }
    }
    Ok(())
}
