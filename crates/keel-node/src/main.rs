//! keel-node entry point.

use anyhow::Context;

use keel_node::{app, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keel_telemetry::init_logging().context("telemetry init")?;

    let config = NodeConfig::load().context("config load")?;
    tracing::info!(
        contracts = config.chain.contracts.len(),
        confirmations = config.chain.confirmations,
        "Starting keel node"
    );

    app::run(config).await.context("node run")?;
    Ok(())
}
