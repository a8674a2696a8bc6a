//! Latest-state order projection.
//!
//! The projection is "the current row of every live order". The staged
//! replay is authoritative, so each cycle truncates the projection table
//! and rewrites the full snapshot inside one transaction; there is no
//! incremental deletion bookkeeping, and readers only ever see complete
//! snapshots.
//!
//! Unlike the KPI view, an unknown customer segment stays `NULL` here: the
//! projection reports state, not group-by buckets.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::engine::{opt_utc_at, AnalyticsSession};
use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::metadata::{MetadataRepository, ProjectionStatus};
use crate::staging::{CustomerChange, OrderChange, StagingRepository};
use crate::tds::Pool;

use super::{
    has_deltas_since, LatestOrderRow, COLLAPSE_VIEWS, LATEST_CAPTURES, PROJECTION_ORDERS_LATEST,
};

const SNAPSHOT_VIEW: &str = "\
CREATE VIEW orders_snapshot AS
SELECT
  o.order_id,
  o.customer_id,
  c.segment,
  o.amount,
  o.status,
  o.created_at,
  o.updated_at,
  o.lsn
FROM orders_current o
LEFT JOIN customers_current c ON c.customer_id = o.customer_id;
";

/// Execute the latest-state transform for one cycle's staged inputs.
pub fn compute_orders_latest(
    orders: &[OrderChange],
    customers: &[CustomerChange],
) -> Result<Vec<LatestOrderRow>> {
    let session = AnalyticsSession::open()?;
    session.load_orders(orders)?;
    session.load_customers(customers)?;
    session.install_views(COLLAPSE_VIEWS)?;
    session.install_views(SNAPSHOT_VIEW)?;

    session.query_rows(
        "SELECT order_id, customer_id, segment, amount, status, created_at, updated_at, lsn \
         FROM orders_snapshot \
         ORDER BY order_id;",
        |row| {
            Ok(LatestOrderRow {
                order_id: row.get(0)?,
                customer_id: row.get(1)?,
                segment: row.get(2)?,
                amount: row.get(3)?,
                status: row.get(4)?,
                created_at: opt_utc_at(row, 5)?,
                updated_at: opt_utc_at(row, 6)?,
                source_lsn: Lsn::from_bytes(&row.get::<_, Vec<u8>>(7)?),
            })
        },
    )
}

/// Full-rebuild projection worker for the latest-state order view.
pub struct OrdersLatestWorker {
    serving: Pool,
    metadata: MetadataRepository,
    staging: StagingRepository,
    source_name: String,
    interval: Duration,
}

impl OrdersLatestWorker {
    /// Create the latest-state worker.
    pub fn new(
        serving: Pool,
        metadata: MetadataRepository,
        staging: StagingRepository,
        source_name: String,
        interval: Duration,
    ) -> Self {
        Self {
            serving,
            metadata,
            staging,
            source_name,
            interval,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            projection = PROJECTION_ORDERS_LATEST,
            "projection worker started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(
                            projection = PROJECTION_ORDERS_LATEST,
                            error = %e,
                            "projection cycle failed"
                        );
                        if let Err(me) = self
                            .metadata
                            .mark_projection_error(PROJECTION_ORDERS_LATEST, &e.to_string())
                            .await
                        {
                            warn!(
                                projection = PROJECTION_ORDERS_LATEST,
                                error = %me,
                                "unable to record projection error"
                            );
                        }
                    }
                }
            }
        }

        info!(
            projection = PROJECTION_ORDERS_LATEST,
            "projection worker stopped"
        );
    }

    /// One projection cycle.
    pub async fn run_once(&self) -> Result<()> {
        let cutoff = self
            .metadata
            .min_ingestion_watermark(&self.source_name, &LATEST_CAPTURES)
            .await?;
        if cutoff.is_zero() {
            return Ok(());
        }

        let checkpoints = self
            .metadata
            .projection_checkpoints(PROJECTION_ORDERS_LATEST, &LATEST_CAPTURES)
            .await?;
        if !has_deltas_since(&self.staging, &checkpoints, cutoff).await? {
            return Ok(());
        }

        let orders = self.staging.load_orders_all(cutoff).await?;
        let customers = self.staging.load_customers_all(cutoff).await?;

        let latest_rows =
            tokio::task::spawn_blocking(move || compute_orders_latest(&orders, &customers))
                .await
                .map_err(|e| Error::Task(format!("latest transform: {e}")))??;

        let mut conn = self.serving.get().await?;
        let mut tx = conn.begin().await?;

        let res = async {
            tx.execute("DELETE FROM dbo.proj_orders_latest;", &[]).await?;

            for row in &latest_rows {
                tx.execute(
                    "INSERT INTO dbo.proj_orders_latest \
                       (order_id, customer_id, segment, amount, status, created_at, updated_at, __source_lsn) \
                     VALUES (@P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8);",
                    &[
                        &row.order_id,
                        &row.customer_id,
                        &row.segment,
                        &row.amount,
                        &row.status,
                        &row.created_at.map(|t| t.naive_utc()),
                        &row.updated_at.map(|t| t.naive_utc()),
                        &row.source_lsn,
                    ],
                )
                .await?;
            }

            for capture in checkpoints.keys() {
                self.metadata
                    .update_projection_checkpoint_tx(
                        &mut tx,
                        PROJECTION_ORDERS_LATEST,
                        *capture,
                        cutoff,
                    )
                    .await?;
            }
            self.metadata
                .upsert_projection_metadata_tx(
                    &mut tx,
                    PROJECTION_ORDERS_LATEST,
                    cutoff,
                    ProjectionStatus::Ok,
                    None,
                )
                .await
        }
        .await;

        match res {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(projection = PROJECTION_ORDERS_LATEST, error = %rb, "rollback failed");
                }
                return Err(e);
            }
        }

        info!(
            projection = PROJECTION_ORDERS_LATEST,
            rows = latest_rows.len(),
            as_of_lsn = %cutoff,
            "projection built"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::ChangeOp;
    use chrono::{DateTime, TimeZone, Utc};

    fn lsn(b: u8) -> Lsn {
        Lsn::from_bytes(&[b])
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn order(
        l: u8,
        seq: u8,
        op: ChangeOp,
        id: i64,
        amount: f64,
        status: &str,
    ) -> OrderChange {
        OrderChange {
            lsn: lsn(l),
            seqval: lsn(seq),
            op,
            order_id: id,
            customer_id: Some(1),
            amount: Some(amount),
            status: Some(status.into()),
            created_at: Some(ts(12, 0)),
            updated_at: None,
        }
    }

    fn customer(l: u8, id: i32, segment: Option<&str>) -> CustomerChange {
        CustomerChange {
            lsn: lsn(l),
            seqval: lsn(0x01),
            op: ChangeOp::Insert,
            customer_id: id,
            segment: segment.map(str::to_string),
            is_active: Some(true),
            updated_at: None,
        }
    }

    #[test]
    fn test_deleted_key_has_no_row() {
        // Insert, update, delete: the latest version is a delete, so the
        // key vanishes from the snapshot.
        let orders = vec![
            order(0x01, 0x01, ChangeOp::Insert, 100, 50.0, "open"),
            order(0x02, 0x01, ChangeOp::UpdateAfter, 100, 70.0, "open"),
            order(0x03, 0x01, ChangeOp::Delete, 100, 70.0, "open"),
        ];
        let rows = compute_orders_latest(&orders, &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_latest_values_and_lsn() {
        let orders = vec![
            order(0x01, 0x01, ChangeOp::Insert, 100, 50.0, "open"),
            order(0x02, 0x01, ChangeOp::UpdateBefore, 100, 50.0, "open"),
            order(0x02, 0x02, ChangeOp::UpdateAfter, 100, 70.0, "paid"),
        ];
        let customers = vec![customer(0x01, 1, Some("SMB"))];

        let rows = compute_orders_latest(&orders, &customers).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_id, 100);
        assert_eq!(rows[0].amount, Some(70.0));
        assert_eq!(rows[0].status.as_deref(), Some("paid"));
        assert_eq!(rows[0].segment.as_deref(), Some("SMB"));
        assert_eq!(rows[0].source_lsn, lsn(0x02));
    }

    #[test]
    fn test_unknown_segment_stays_null() {
        let orders = vec![order(0x01, 0x01, ChangeOp::Insert, 100, 50.0, "open")];
        let rows = compute_orders_latest(&orders, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment, None);
    }

    #[test]
    fn test_snapshot_is_ordered_by_key() {
        let orders = vec![
            order(0x01, 0x01, ChangeOp::Insert, 300, 10.0, "open"),
            order(0x02, 0x01, ChangeOp::Insert, 100, 20.0, "open"),
            order(0x03, 0x01, ChangeOp::Insert, 200, 30.0, "open"),
        ];
        let rows = compute_orders_latest(&orders, &[]).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.order_id).collect();
        assert_eq!(ids, vec![100, 200, 300]);
    }

    #[test]
    fn test_deleted_customer_leaves_null_segment() {
        let orders = vec![order(0x01, 0x01, ChangeOp::Insert, 100, 50.0, "open")];
        let customers = vec![
            customer(0x01, 1, Some("SMB")),
            CustomerChange {
                lsn: lsn(0x02),
                seqval: lsn(0x01),
                op: ChangeOp::Delete,
                customer_id: 1,
                segment: Some("SMB".into()),
                is_active: Some(true),
                updated_at: None,
            },
        ];
        let rows = compute_orders_latest(&orders, &customers).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment, None);
    }
}
