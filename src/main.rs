use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;

use agent_pool::config::{CommandConfig, PoolConfig, SourceConfig};
use agent_pool::error::Result;
use agent_pool::pool::{
    BroadcastObserver, CommandExecutor, ObserverSet, PoolScheduler, PoolSummary, TracingObserver,
};
use agent_pool::registry::DescriptorDirSource;
use agent_pool::shutdown::install_shutdown_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let summary = run().await.context("agent pool failed")?;
    eprintln!(
        "\n   Done: {} launched, {} succeeded, {} failed (peak {} concurrent)",
        summary.launched, summary.succeeded, summary.failed, summary.peak_active
    );
    Ok(())
}

async fn run() -> Result<PoolSummary> {
    let pool_config = PoolConfig::from_env()?;
    let source_config = SourceConfig::from_env();
    let command_config = CommandConfig::from_env()?;

    eprintln!("🤖 Agent Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Target: {} agents", pool_config.target);
    eprintln!(
        "   Descriptors: {}/{}*{}",
        source_config.descriptor_dir.display(),
        source_config.prefix,
        source_config.suffix
    );
    if !source_config.allowlist.is_empty() {
        eprintln!("   Allowed: {}", source_config.allowlist.join(", "));
    }
    eprintln!("   Command: {}", command_config.command);
    eprintln!("   Logs: {}", command_config.log_dir.display());
    eprintln!(
        "   Pacing: stagger {:?}, settle {:?}, idle {:?}, timeout {}",
        pool_config.stagger_delay,
        pool_config.settle_delay,
        pool_config.idle_backoff,
        pool_config
            .job_timeout
            .map(|t| format!("{t:?}"))
            .unwrap_or_else(|| "none".to_string())
    );
    eprintln!("   Selection: {}\n", pool_config.selection);

    let source = Arc::new(DescriptorDirSource::from_config(&source_config));
    let executor = Arc::new(CommandExecutor::new(command_config));

    let mut observers = ObserverSet::new().with(Arc::new(TracingObserver::new()));
    let events_task = if std::env::var("AGENT_POOL_EVENTS").is_ok_and(|v| v == "json") {
        let broadcast = BroadcastObserver::new();
        let mut rx = broadcast.subscribe();
        observers.push(Arc::new(broadcast));
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize pool event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event stream lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    } else {
        None
    };

    let scheduler = PoolScheduler::from_source(pool_config, source, executor, Arc::new(observers));
    let cancel = install_shutdown_handler();
    let summary = scheduler.run(cancel).await?;

    // Closing the broadcast channel lets the event printer finish.
    drop(scheduler);
    if let Some(handle) = events_task {
        let _ = handle.await;
    }
    Ok(summary)
}
