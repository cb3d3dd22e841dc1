//! Vigil agent binary.
//!
//! Loads configuration (first argument, then `VIGIL_CONFIG`, then the default
//! config path; a missing file means defaults), runs the agent until SIGINT
//! or SIGTERM, and exits non-zero if orderly shutdown overruns its deadline.

use std::path::PathBuf;
use vigil::agent::{Agent, Collaborators, SHUTDOWN_DEADLINE};
use vigil::config::AgentConfig;

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("VIGIL_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(AgentConfig::default_config_path)
}

fn load_config(path: &std::path::Path) -> anyhow::Result<AgentConfig> {
    if path.exists() {
        AgentConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))
    } else {
        Ok(AgentConfig::default())
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = load_config(&path)?;
    let _log_guard = vigil::logging::init_tracing(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        server = %config.server.url,
        "vigil agent starting"
    );

    let collaborators = Collaborators::defaults(&config);
    let agent = Agent::new(config, collaborators).map_err(|e| {
        tracing::error!(error = %e, "agent failed to initialise");
        anyhow::anyhow!("agent failed to initialise: {e}")
    })?;
    agent.start().await?;

    wait_for_signal().await;

    if tokio::time::timeout(SHUTDOWN_DEADLINE, agent.shutdown())
        .await
        .is_err()
    {
        tracing::error!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "shutdown overran its deadline, forcing exit"
        );
        std::process::exit(1);
    }

    tracing::info!("vigil agent shut down cleanly");
    Ok(())
}
