//! millraced: daemon wrapping the millrace CDC projection engine.
//!
//! Reads its configuration from the environment, runs the pipeline until
//! Ctrl-C or SIGTERM, and exits 0 on a clean shutdown. Startup
//! misconfiguration or an exhausted connection retry budget exits
//! non-zero; per-cycle worker errors never terminate the process.

use millrace::{orchestrator, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    orchestrator::run(cfg).await?;
    Ok(())
}
