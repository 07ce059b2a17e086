//! Strategy Agent - runs trading strategies against paper or live venues
//!
//! On startup the agent:
//! 1. Loads `.env` and the agent settings
//! 2. Opens the strategy repository and runs migrations
//! 3. Resumes strategies that were running when the process last stopped
//! 4. Starts the strategy file given in the settings, if any
//! 5. Runs until ctrl-c, then stops every strategy

use anyhow::Context;
use std::sync::Arc;
use tracing::{error, info, warn};

use strategy_agent::config::{AgentSettings, UserRequest};
use strategy_agent::persistence::StrategyRepository;
use strategy_agent::runner::{autoresume, Lifecycle, RunnerSettings, StrategyManager};
use strategy_agent::runtime::RuntimeOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Starting Strategy Agent...");

    let settings = AgentSettings::load().context("failed to load agent settings")?;
    info!("Database: {}", settings.database_url);
    ensure_data_dir(&settings.database_url)?;

    let repo = StrategyRepository::connect(&settings.database_url).await?;
    repo.migrate().await?;

    let lifecycle = Arc::new(Lifecycle::new());
    let manager = StrategyManager::new(repo.clone(), RunnerSettings::from(&settings));

    if settings.autoresume {
        match autoresume(&lifecycle, &repo, &manager).await {
            Ok(count) => info!("Autoresume started {} strategies", count),
            Err(e) => error!("Autoresume failed: {:#}", e),
        }
    }

    if let Some(path) = &settings.strategy_file {
        let request = UserRequest::from_yaml_file(path)
            .with_context(|| format!("failed to load strategy file {}", path.display()))?;
        let strategy_id = manager.start(request, RuntimeOptions::default()).await?;
        info!("Started strategy {} from {}", strategy_id, path.display());
    }

    if manager.running_ids().await.is_empty() {
        warn!("No strategies running; waiting for ctrl-c");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    lifecycle.begin_shutdown();

    for (strategy_id, outcome) in manager.shutdown().await {
        match outcome {
            Ok(reason) => info!("Strategy {} stopped: {}", strategy_id, reason.as_str()),
            Err(e) => error!("Strategy {} did not stop cleanly: {:#}", strategy_id, e),
        }
    }

    info!("Strategy Agent stopped");
    Ok(())
}

/// Create the parent directory of a file-backed sqlite URL
fn ensure_data_dir(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(())
}
