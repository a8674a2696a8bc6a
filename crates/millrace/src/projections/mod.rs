//! Projection workers: analytical materialized views over the staged
//! change streams.
//!
//! Every worker follows the same protocol. At cycle start it derives the
//! cross-stream cutoff (minimum ingestion watermark over its bound
//! captures) and holds it fixed for the whole cycle; it short-circuits when
//! no bound stream has deltas past its checkpoint; it rebuilds inside the
//! embedded engine; and it commits projection rows, checkpoint advances and
//! metadata in one serving-side transaction. Readers therefore only ever
//! see the previous committed build or the new one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::staging::{Capture, StagingRepository};

mod kpi;
mod latest;

pub use kpi::{compute_kpi, KpiWorker};
pub use latest::{compute_orders_latest, OrdersLatestWorker};

/// Name of the per-minute/segment order KPI projection.
pub const PROJECTION_ORDERS_KPI: &str = "orders_kpi_by_minute_segment";

/// Name of the latest-state order projection.
pub const PROJECTION_ORDERS_LATEST: &str = "orders_latest";

/// Captures the KPI projection joins across.
pub const KPI_CAPTURES: [Capture; 3] = Capture::ALL;

/// Captures the latest-state projection joins across.
pub const LATEST_CAPTURES: [Capture; 2] = [Capture::Customers, Capture::Orders];

/// One output row of the KPI projection, grain `(minute, segment)`.
#[derive(Debug, Clone, PartialEq)]
pub struct KpiRow {
    pub minute_bucket: DateTime<Utc>,
    pub segment: String,
    pub orders_count: i64,
    pub orders_amount_sum: f64,
    pub paid_amount_sum: f64,
}

/// One output row of the latest-state projection, grain `order_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct LatestOrderRow {
    pub order_id: i64,
    pub customer_id: Option<i32>,
    pub segment: Option<String>,
    pub amount: Option<f64>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub source_lsn: Lsn,
}

/// Floor a timestamp to its minute.
pub(crate) fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(ts)
}

/// Whether any bound stream has rows in `(checkpoint, cutoff]`.
pub(crate) async fn has_deltas_since(
    staging: &StagingRepository,
    checkpoints: &BTreeMap<Capture, Lsn>,
    cutoff: Lsn,
) -> Result<bool> {
    for (capture, from) in checkpoints {
        if staging.has_deltas(*capture, *from, cutoff).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Collapse-to-latest over orders and customers: per business key, rank by
/// `(lsn DESC, seqval DESC)` across ops {delete, insert, update-after}
/// (update-before pre-images are excluded before ranking) and keep the top
/// row unless it is a delete.
pub(crate) const COLLAPSE_VIEWS: &str = "\
CREATE VIEW orders_ranked AS
SELECT
  lsn, seqval, op, order_id, customer_id, amount, status, created_at, updated_at,
  ROW_NUMBER() OVER (PARTITION BY order_id ORDER BY lsn DESC, seqval DESC) AS rn
FROM orders_delta
WHERE op IN (1, 2, 4);

CREATE VIEW orders_current AS
SELECT * FROM orders_ranked WHERE rn = 1 AND op <> 1;

CREATE VIEW customers_ranked AS
SELECT
  lsn, seqval, op, customer_id, segment, is_active, updated_at,
  ROW_NUMBER() OVER (PARTITION BY customer_id ORDER BY lsn DESC, seqval DESC) AS rn
FROM customers_delta
WHERE op IN (1, 2, 4);

CREATE VIEW customers_current AS
SELECT * FROM customers_ranked WHERE rn = 1 AND op <> 1;
";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_floor_to_minute() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 10, 30).unwrap();
        assert_eq!(
            floor_to_minute(ts),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 10, 0).unwrap()
        );

        let exact = Utc.with_ymd_and_hms(2024, 5, 1, 12, 10, 0).unwrap();
        assert_eq!(floor_to_minute(exact), exact);
    }
}
