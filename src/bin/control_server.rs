use anyhow::{Context, Result};
use std::sync::Arc;
use warden::config::WardenConfig;
use warden::servers::control::ControlState;
use warden::store::ObservationStore;

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
                println!("Usage: control_server [--conf FILE]");
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
    config.validate_control()?;

    let store = ObservationStore::open(&config.db_path)
        .await
        .with_context(|| format!("Cannot open store: {}", config.db_path))?;

    let bind = format!("{}:{}", config.listen_ip, config.listen_port);
    let state = Arc::new(ControlState::new(config, store)?);

    let restored = state
        .rebuild_registry()
        .await
        .context("Cannot rebuild registry from store")?;
    tracing::info!(
        "[control] [started] nodes={} restored={} window={}s enforce={}",
        state.dispatcher.node_count(),
        restored,
        state.config.window_secs,
        state.config.enforce
    );

    ControlState::spawn_sweeper(Arc::clone(&state));

    tokio::select! {
        result = ControlState::run(state, &bind) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[control] [stopped] interrupt received");
        }
    }
    Ok(())
}
