use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use colony_compression::CompressionEngine;
use colony_eventstream::EventStream;
use colony_inference::HeuristicInferenceClient;
use colony_messaging::LoopbackTransport;
use colony_observability::{
    canonical_logs_dir_from_root, init_process_logging, ColonyProcessKind,
};
use colony_orchestrator::runtime_config::CompressionThresholdsConfig;
use colony_orchestrator::{
    AlwaysAliveLiveness, LocalWorkerExecutor, NullFundingProtocol, Orchestrator, RuntimeConfig,
};
use colony_store::Store;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "colony")]
#[command(about = "Colony agent runtime")]
struct Cli {
    /// Path to the RuntimeConfig JSON file. Missing is not an error — the
    /// defaults plus any COLONY_* environment overrides still run.
    #[arg(long, env = "COLONY_CONFIG", default_value = "colony.json")]
    config: PathBuf,

    /// Runs a single tick (plus one compression evaluation) and exits.
    /// Useful for tests and scripted invocations.
    #[arg(long, default_value_t = false)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::load(&cli.config)
        .await
        .context("loading runtime config")?;

    let logs_dir = canonical_logs_dir_from_root(&config.workspace_root);
    let (_guard, log_info) =
        init_process_logging(ColonyProcessKind::Runtime, &logs_dir, config.log_retention_days)
            .context("initializing logging")?;
    info!(
        logs_dir = %log_info.logs_dir,
        retention_days = log_info.retention_days,
        "colony runtime starting"
    );

    tokio::fs::create_dir_all(&config.workspace_root).await?;
    let store = Arc::new(Store::open(&config.database_path).await?);

    let transport = Arc::new(LoopbackTransport::new(store.clone()));
    let inference = Arc::new(HeuristicInferenceClient);
    let workers = Arc::new(LocalWorkerExecutor);
    let funding = Arc::new(NullFundingProtocol);
    let liveness = Arc::new(AlwaysAliveLiveness);

    let self_address = Some("orchestrator:self".to_string());
    let orchestrator_config = config.to_orchestrator_config(self_address.clone());

    let mut orchestrator = Orchestrator::new(
        store.clone(),
        transport,
        inference.clone(),
        workers,
        true,
        funding,
        liveness,
        config.workspace_root.clone(),
        orchestrator_config,
    );

    let agent_address = self_address.unwrap_or_else(|| "orchestrator:self".to_string());
    let mut compression_engine = CompressionEngine::new(
        store.clone(),
        inference,
        config.workspace_root.clone(),
        agent_address.clone(),
        config.context_window_tokens,
    )
    .with_thresholds(to_compression_thresholds(&config.compression_thresholds));

    let idle_poll_interval = Duration::from_secs(config.idle_poll_interval_secs);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        orchestrator.tick().await?;

        let utilization = EventStream::new(&store)
            .current_utilization(&agent_address, config.context_window_tokens)
            .await?;
        let plan = compression_engine.evaluate(utilization);
        if !plan.is_empty() {
            compression_engine.execute(plan).await?;
        }

        if cli.once {
            break;
        }

        if orchestrator.idle_with_no_active_goals().await? {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::time::sleep(idle_poll_interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT, shutting down");
                        break;
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        break;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                tokio::select! {
                    _ = tokio::time::sleep(idle_poll_interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    info!("colony runtime exiting");
    Ok(())
}

fn to_compression_thresholds(
    config: &CompressionThresholdsConfig,
) -> colony_compression::CompressionThresholds {
    colony_compression::CompressionThresholds {
        stage1: config.stage1,
        stage2: config.stage2,
        stage3: config.stage3,
        stage4: config.stage4,
        stage5: config.stage5,
    }
}
