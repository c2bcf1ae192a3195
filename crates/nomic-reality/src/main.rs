//! Reality Node binary
//!
//! Authoritative orchestrator for a self-modifying game of Nomic.

use nomic_reality::{RealityConfig, RealityNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reality_node=info,nomic_reality=info,nomic_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Reality Node");

    let config = RealityConfig::from_env()?;

    let node = RealityNode::new(config).await?;
    node.run().await?;

    Ok(())
}
