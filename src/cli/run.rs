use crate::agent::{Agent, AgentError};
use crate::config::parse::load_config;
use std::path::{Path, PathBuf};
use tracing::info;

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/udpshipper/config.yml");
            eprintln!("  /etc/udpshipper/config.yml");
            eprintln!("\nUse --config <path> to specify a config file, or run 'udpshipper config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_agent(&config_path).await.map_err(|e| e.into())
}

async fn run_agent(config_path: &Path) -> Result<(), AgentError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let agent = Agent::start(config).await?;
    info!(destination = %agent.destination(), "Agent started, press Ctrl+C to shutdown");

    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    let report = agent.stop().await?;
    info!(
        scans = report.crawler.scans,
        harvesters_aborted = report.crawler.harvesters_aborted,
        sent = report.publisher.sent,
        datagrams = report.publisher.datagrams,
        retries = report.publisher.retries,
        dropped = report.publisher.dropped,
        truncated = report.publisher.truncated,
        split = report.publisher.split,
        "Final statistics"
    );
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
