//! Per-minute, per-segment order KPI projection.
//!
//! Rebuilds a bounded recent window every cycle: orders and customers are
//! collapsed to their latest versions, orders are enriched with the
//! customer segment (`'UNKNOWN'` when absent so group-by stays stable),
//! and order counts/sums are joined with payment sums per minute bucket.
//! The recompute window trades CPU for correctness under late-arriving
//! updates and deletes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::engine::{utc_at, AnalyticsSession};
use crate::error::{Error, Result};
use crate::metadata::{MetadataRepository, ProjectionStatus};
use crate::staging::{CustomerChange, OrderChange, PaymentChange, StagingRepository};
use crate::tds::Pool;

use super::{
    floor_to_minute, has_deltas_since, KpiRow, COLLAPSE_VIEWS, KPI_CAPTURES, PROJECTION_ORDERS_KPI,
};

const KPI_VIEWS: &str = "\
CREATE VIEW payments_ranked AS
SELECT
  lsn, seqval, op, payment_id, order_id, paid_amount, paid_at,
  ROW_NUMBER() OVER (PARTITION BY payment_id ORDER BY lsn DESC, seqval DESC) AS rn
FROM payments_delta
WHERE op IN (1, 2, 4);

CREATE VIEW payments_current AS
SELECT * FROM payments_ranked WHERE rn = 1 AND op <> 1;

CREATE VIEW orders_enriched AS
SELECT
  date_trunc('minute', o.created_at) AS minute_bucket,
  COALESCE(c.segment, 'UNKNOWN') AS segment,
  o.order_id,
  COALESCE(o.amount, 0) AS amount
FROM orders_current o
LEFT JOIN customers_current c ON c.customer_id = o.customer_id
WHERE o.created_at >= (SELECT window_start FROM projection_params LIMIT 1);

CREATE VIEW payments_enriched AS
SELECT
  date_trunc('minute', p.paid_at) AS minute_bucket,
  COALESCE(c.segment, 'UNKNOWN') AS segment,
  COALESCE(p.paid_amount, 0) AS paid_amount
FROM payments_current p
JOIN orders_current o ON o.order_id = p.order_id
LEFT JOIN customers_current c ON c.customer_id = o.customer_id
WHERE p.paid_at >= (SELECT window_start FROM projection_params LIMIT 1);

CREATE VIEW kpi_orders AS
SELECT
  minute_bucket,
  segment,
  COUNT(DISTINCT order_id) AS orders_count,
  COALESCE(SUM(amount), 0) AS orders_amount_sum
FROM orders_enriched
GROUP BY minute_bucket, segment;

CREATE VIEW kpi_payments AS
SELECT
  minute_bucket,
  segment,
  COALESCE(SUM(paid_amount), 0) AS paid_amount_sum
FROM payments_enriched
GROUP BY minute_bucket, segment;

CREATE VIEW kpi_rollup AS
SELECT
  COALESCE(o.minute_bucket, p.minute_bucket) AS minute_bucket,
  COALESCE(o.segment, p.segment) AS segment,
  COALESCE(o.orders_count, 0) AS orders_count,
  COALESCE(o.orders_amount_sum, 0) AS orders_amount_sum,
  COALESCE(p.paid_amount_sum, 0) AS paid_amount_sum
FROM kpi_orders o
FULL OUTER JOIN kpi_payments p
  ON o.minute_bucket = p.minute_bucket AND o.segment = p.segment;
";

/// Execute the KPI transform for one cycle's staged inputs.
///
/// Pure with respect to the serving store: opens a private engine session,
/// loads the given rows and returns the `(bucket >= window_start)` rollup.
pub fn compute_kpi(
    window_start: DateTime<Utc>,
    orders: &[OrderChange],
    customers: &[CustomerChange],
    payments: &[PaymentChange],
) -> Result<Vec<KpiRow>> {
    let session = AnalyticsSession::open()?;
    session.set_window_start(window_start)?;
    session.load_orders(orders)?;
    session.load_customers(customers)?;
    session.load_payments(payments)?;
    session.install_views(COLLAPSE_VIEWS)?;
    session.install_views(KPI_VIEWS)?;

    session.query_rows(
        "SELECT minute_bucket, segment, orders_count, orders_amount_sum, paid_amount_sum \
         FROM kpi_rollup \
         ORDER BY minute_bucket, segment;",
        |row| {
            Ok(KpiRow {
                minute_bucket: utc_at(row, 0)?,
                segment: row.get(1)?,
                orders_count: row.get(2)?,
                orders_amount_sum: row.get(3)?,
                paid_amount_sum: row.get(4)?,
            })
        },
    )
}

/// Windowed-recompute projection worker for the order KPI view.
pub struct KpiWorker {
    serving: Pool,
    metadata: MetadataRepository,
    staging: StagingRepository,
    source_name: String,
    interval: Duration,
    recompute_window: Duration,
}

impl KpiWorker {
    /// Create the KPI worker.
    pub fn new(
        serving: Pool,
        metadata: MetadataRepository,
        staging: StagingRepository,
        source_name: String,
        interval: Duration,
        recompute_window: Duration,
    ) -> Self {
        Self {
            serving,
            metadata,
            staging,
            source_name,
            interval,
            recompute_window,
        }
    }

    /// Run until the shutdown signal fires. A failed cycle flags the
    /// projection ERROR (best-effort) and the worker keeps polling.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(projection = PROJECTION_ORDERS_KPI, "projection worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(
                            projection = PROJECTION_ORDERS_KPI,
                            error = %e,
                            "projection cycle failed"
                        );
                        if let Err(me) = self
                            .metadata
                            .mark_projection_error(PROJECTION_ORDERS_KPI, &e.to_string())
                            .await
                        {
                            warn!(
                                projection = PROJECTION_ORDERS_KPI,
                                error = %me,
                                "unable to record projection error"
                            );
                        }
                    }
                }
            }
        }

        info!(projection = PROJECTION_ORDERS_KPI, "projection worker stopped");
    }

    /// One projection cycle.
    pub async fn run_once(&self) -> Result<()> {
        let cutoff = self
            .metadata
            .min_ingestion_watermark(&self.source_name, &KPI_CAPTURES)
            .await?;
        if cutoff.is_zero() {
            return Ok(());
        }

        let checkpoints = self
            .metadata
            .projection_checkpoints(PROJECTION_ORDERS_KPI, &KPI_CAPTURES)
            .await?;
        if !has_deltas_since(&self.staging, &checkpoints, cutoff).await? {
            return Ok(());
        }

        let window_start = floor_to_minute(Utc::now()) - self.recompute_window;
        let orders = self.staging.load_orders_all(cutoff).await?;
        let customers = self.staging.load_customers_all(cutoff).await?;
        let payments = self
            .staging
            .load_payments_window(window_start, cutoff)
            .await?;

        let kpi_rows = tokio::task::spawn_blocking(move || {
            compute_kpi(window_start, &orders, &customers, &payments)
        })
        .await
        .map_err(|e| Error::Task(format!("kpi transform: {e}")))??;

        let mut conn = self.serving.get().await?;
        let mut tx = conn.begin().await?;

        let res = async {
            tx.execute(
                "DELETE FROM dbo.proj_orders_kpi_by_minute_segment WHERE minute_bucket >= @P1;",
                &[&window_start.naive_utc()],
            )
            .await?;

            for row in &kpi_rows {
                tx.execute(
                    "INSERT INTO dbo.proj_orders_kpi_by_minute_segment \
                       (minute_bucket, segment, orders_count, orders_amount_sum, paid_amount_sum) \
                     VALUES (@P1, @P2, @P3, @P4, @P5);",
                    &[
                        &row.minute_bucket.naive_utc(),
                        &row.segment,
                        &row.orders_count,
                        &row.orders_amount_sum,
                        &row.paid_amount_sum,
                    ],
                )
                .await?;
            }

            for capture in checkpoints.keys() {
                self.metadata
                    .update_projection_checkpoint_tx(
                        &mut tx,
                        PROJECTION_ORDERS_KPI,
                        *capture,
                        cutoff,
                    )
                    .await?;
            }
            self.metadata
                .upsert_projection_metadata_tx(
                    &mut tx,
                    PROJECTION_ORDERS_KPI,
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
                    warn!(projection = PROJECTION_ORDERS_KPI, error = %rb, "rollback failed");
                }
                return Err(e);
            }
        }

        info!(
            projection = PROJECTION_ORDERS_KPI,
            rows = kpi_rows.len(),
            window_start = %window_start,
            as_of_lsn = %cutoff,
            "projection built"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use crate::staging::ChangeOp;
    use chrono::TimeZone;

    fn lsn(b: u8) -> Lsn {
        Lsn::from_bytes(&[b])
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn customer(l: u8, op: ChangeOp, id: i32, segment: Option<&str>) -> CustomerChange {
        CustomerChange {
            lsn: lsn(l),
            seqval: lsn(0x01),
            op,
            customer_id: id,
            segment: segment.map(str::to_string),
            is_active: Some(true),
            updated_at: None,
        }
    }

    fn order(
        l: u8,
        seq: u8,
        op: ChangeOp,
        id: i64,
        customer_id: i32,
        amount: f64,
        created: DateTime<Utc>,
    ) -> OrderChange {
        OrderChange {
            lsn: lsn(l),
            seqval: lsn(seq),
            op,
            order_id: id,
            customer_id: Some(customer_id),
            amount: Some(amount),
            status: Some("open".into()),
            created_at: Some(created),
            updated_at: None,
        }
    }

    fn payment(l: u8, op: ChangeOp, id: i64, order_id: i64, amount: f64, paid: DateTime<Utc>) -> PaymentChange {
        PaymentChange {
            lsn: lsn(l),
            seqval: lsn(0x01),
            op,
            payment_id: id,
            order_id: Some(order_id),
            paid_amount: Some(amount),
            paid_at: Some(paid),
        }
    }

    #[test]
    fn test_windowed_recompute_ignores_old_orders() {
        // now = 12:10:30, window = 15 min, window_start = 11:55. An order
        // created at 11:00 stays outside the rebuilt interval.
        let window_start = ts(11, 55);
        let customers = vec![customer(0x01, ChangeOp::Insert, 1, Some("SMB"))];
        let orders = vec![
            order(0x02, 0x01, ChangeOp::Insert, 10, 1, 40.0, ts(11, 0)),
            order(0x03, 0x01, ChangeOp::Insert, 11, 1, 100.0, ts(12, 5)),
        ];

        let rows = compute_kpi(window_start, &orders, &customers, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].minute_bucket, ts(12, 5));
        assert_eq!(rows[0].segment, "SMB");
        assert_eq!(rows[0].orders_count, 1);
        assert_eq!(rows[0].orders_amount_sum, 100.0);
        assert_eq!(rows[0].paid_amount_sum, 0.0);
    }

    #[test]
    fn test_collapse_uses_latest_version() {
        // Insert then update (pre- and post-image): only the post-image
        // amount counts, once.
        let window_start = ts(11, 55);
        let customers = vec![customer(0x01, ChangeOp::Insert, 1, Some("ENT"))];
        let orders = vec![
            order(0x02, 0x01, ChangeOp::Insert, 10, 1, 50.0, ts(12, 0)),
            order(0x03, 0x01, ChangeOp::UpdateBefore, 10, 1, 50.0, ts(12, 0)),
            order(0x03, 0x02, ChangeOp::UpdateAfter, 10, 1, 70.0, ts(12, 0)),
        ];

        let rows = compute_kpi(window_start, &orders, &customers, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].orders_count, 1);
        assert_eq!(rows[0].orders_amount_sum, 70.0);
    }

    #[test]
    fn test_deleted_orders_drop_out() {
        let window_start = ts(11, 55);
        let customers = vec![customer(0x01, ChangeOp::Insert, 1, Some("SMB"))];
        let orders = vec![
            order(0x02, 0x01, ChangeOp::Insert, 10, 1, 50.0, ts(12, 0)),
            order(0x04, 0x01, ChangeOp::Delete, 10, 1, 50.0, ts(12, 0)),
        ];

        let rows = compute_kpi(window_start, &orders, &customers, &[]).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_missing_customer_becomes_unknown_segment() {
        let window_start = ts(11, 55);
        let orders = vec![order(0x02, 0x01, ChangeOp::Insert, 10, 99, 25.0, ts(12, 1))];

        let rows = compute_kpi(window_start, &orders, &[], &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].segment, "UNKNOWN");
    }

    #[test]
    fn test_payments_join_orders_and_zero_fill() {
        let window_start = ts(11, 55);
        let customers = vec![customer(0x01, ChangeOp::Insert, 1, Some("SMB"))];
        // Order created before the window; its payment lands inside it.
        let orders = vec![order(0x02, 0x01, ChangeOp::Insert, 10, 1, 80.0, ts(10, 0))];
        let payments = vec![payment(0x03, ChangeOp::Insert, 500, 10, 80.0, ts(12, 2))];

        let rows = compute_kpi(window_start, &orders, &customers, &payments).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].minute_bucket, ts(12, 2));
        assert_eq!(rows[0].segment, "SMB");
        assert_eq!(rows[0].orders_count, 0, "order bucket is outside the window");
        assert_eq!(rows[0].orders_amount_sum, 0.0);
        assert_eq!(rows[0].paid_amount_sum, 80.0);
    }

    #[test]
    fn test_orders_and_payments_merge_on_bucket_and_segment() {
        let window_start = ts(11, 55);
        let customers = vec![customer(0x01, ChangeOp::Insert, 1, Some("SMB"))];
        let orders = vec![order(0x02, 0x01, ChangeOp::Insert, 10, 1, 60.0, ts(12, 3))];
        let payments = vec![payment(0x03, ChangeOp::Insert, 500, 10, 60.0, ts(12, 3))];

        let rows = compute_kpi(window_start, &orders, &customers, &payments).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].orders_count, 1);
        assert_eq!(rows[0].orders_amount_sum, 60.0);
        assert_eq!(rows[0].paid_amount_sum, 60.0);
    }
}
