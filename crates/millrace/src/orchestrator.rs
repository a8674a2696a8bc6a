//! Process orchestration: pools, bootstrap, worker lifecycle, shutdown.
//!
//! Spawns one long-lived task per ingestor and enabled projection worker.
//! Workers are independent: a failing cycle in one never affects the
//! others, and nothing short of the shutdown signal stops any of them.
//! Shutdown is cooperative: a broadcast fan-out that every worker
//! observes at its next cycle boundary, followed by a bounded join and
//! pool close.

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::ingest::Ingestor;
use crate::metadata::MetadataRepository;
use crate::projections::{
    KpiWorker, OrdersLatestWorker, KPI_CAPTURES, LATEST_CAPTURES, PROJECTION_ORDERS_KPI,
    PROJECTION_ORDERS_LATEST,
};
use crate::staging::{Capture, StagingRepository};
use crate::tds::Pool;

const SOURCE_POOL_SIZE: usize = 8;
const SERVING_POOL_SIZE: usize = 16;
const OPEN_ATTEMPTS: u32 = 30;
const OPEN_INITIAL_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the pipeline until a shutdown signal (Ctrl-C or SIGTERM) arrives.
///
/// Returns an error only for startup failures: unparseable DSNs, an
/// exhausted connection retry budget or a failed bootstrap. Once the
/// workers are up, per-cycle errors stay inside the workers.
pub async fn run(cfg: Config) -> Result<()> {
    let source = Pool::open(
        &cfg.source_dsn,
        SOURCE_POOL_SIZE,
        OPEN_ATTEMPTS,
        OPEN_INITIAL_DELAY,
    )
    .await?;
    info!(server = source.redacted_dsn(), "source store connected");

    let serving = Pool::open(
        &cfg.serving_dsn,
        SERVING_POOL_SIZE,
        OPEN_ATTEMPTS,
        OPEN_INITIAL_DELAY,
    )
    .await?;
    info!(server = serving.redacted_dsn(), "serving store connected");

    let metadata = MetadataRepository::new(serving.clone());
    let staging = StagingRepository::new(serving.clone());

    let mut projections: Vec<(&str, &[Capture])> = Vec::new();
    if cfg.enable_proj_orders_kpi {
        projections.push((PROJECTION_ORDERS_KPI, &KPI_CAPTURES));
    }
    if cfg.enable_proj_orders_latest {
        projections.push((PROJECTION_ORDERS_LATEST, &LATEST_CAPTURES));
    }
    metadata
        .ensure_bootstrap(&cfg.source_name, &Capture::ALL, &projections)
        .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    for capture in Capture::ALL {
        let ingestor = Ingestor::new(
            source.clone(),
            serving.clone(),
            metadata.clone(),
            staging.clone(),
            cfg.source_name.clone(),
            capture,
            cfg.cdc_batch_max_rows,
            cfg.poll_interval,
        );
        tasks.push(tokio::spawn(ingestor.run(shutdown_tx.subscribe())));
    }

    if cfg.enable_proj_orders_kpi {
        let worker = KpiWorker::new(
            serving.clone(),
            metadata.clone(),
            staging.clone(),
            cfg.source_name.clone(),
            cfg.projection_interval,
            cfg.projection_recompute_window,
        );
        tasks.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }
    if cfg.enable_proj_orders_latest {
        let worker = OrdersLatestWorker::new(
            serving.clone(),
            metadata.clone(),
            staging.clone(),
            cfg.source_name.clone(),
            cfg.projection_interval,
        );
        tasks.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
    }

    info!(workers = tasks.len(), "pipeline started");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(tasks)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    error!(error = %e, "worker task panicked");
                }
            }
        }
        Err(_) => {
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "shutdown timed out, abandoning workers");
        }
    }

    serving.close().await;
    source.close().await;
    info!("pipeline stopped");
    Ok(())
}

/// Wait for Ctrl-C or, on Unix, SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
