//! Staging repository: the append-only durable copy of each change stream.
//!
//! One staging table per capture instance, unique on
//! `(lsn, seqval, business_key)`. Inserts are conditional so ingestor
//! retries after a crash are deduplicated by replay rather than by
//! coordination. Bulk loads feed the projection workers and are always
//! ordered `(lsn, seqval)` ascending and bounded by the caller's cutoff
//! LSN, so a projection can never observe changes beyond the frontier it
//! records.

use chrono::{DateTime, Utc};
use tiberius::Row;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::tds::{Pool, Tx};

// ============================================================================
// Capture instances
// ============================================================================

/// The per-table change streams this engine ingests.
///
/// Each capture owns its staging-table name; table names never come from
/// runtime input, which keeps the one dynamically assembled query
/// (`has_deltas`) free of identifier injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capture {
    /// `dbo_customers`: customer dimension changes.
    Customers,
    /// `dbo_orders`: order fact changes.
    Orders,
    /// `dbo_payments`: payment fact changes.
    Payments,
}

impl Capture {
    /// All capture instances, in checkpoint iteration order.
    pub const ALL: [Capture; 3] = [Capture::Customers, Capture::Orders, Capture::Payments];

    /// The source-side capture instance name.
    pub fn instance_name(self) -> &'static str {
        match self {
            Capture::Customers => "dbo_customers",
            Capture::Orders => "dbo_orders",
            Capture::Payments => "dbo_payments",
        }
    }

    /// The serving-side staging table fed by this capture.
    pub fn staging_table(self) -> &'static str {
        match self {
            Capture::Customers => "dbo.stg_cdc_customers",
            Capture::Orders => "dbo.stg_cdc_orders",
            Capture::Payments => "dbo.stg_cdc_payments",
        }
    }

    /// Reverse lookup from a stored capture instance name.
    pub fn from_instance_name(name: &str) -> Option<Capture> {
        Capture::ALL
            .into_iter()
            .find(|c| c.instance_name() == name)
    }
}

impl std::fmt::Display for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.instance_name())
    }
}

// ============================================================================
// Change rows
// ============================================================================

/// CDC operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    /// Row deleted.
    Delete,
    /// Row inserted.
    Insert,
    /// Pre-image of an update.
    UpdateBefore,
    /// Post-image of an update.
    UpdateAfter,
}

impl ChangeOp {
    /// Decode a source operation code (1=delete, 2=insert, 3=update-before,
    /// 4=update-after).
    pub fn from_code(code: i64) -> Option<ChangeOp> {
        match code {
            1 => Some(ChangeOp::Delete),
            2 => Some(ChangeOp::Insert),
            3 => Some(ChangeOp::UpdateBefore),
            4 => Some(ChangeOp::UpdateAfter),
            _ => None,
        }
    }

    /// The wire code for this operation.
    pub fn code(self) -> u8 {
        match self {
            ChangeOp::Delete => 1,
            ChangeOp::Insert => 2,
            ChangeOp::UpdateBefore => 3,
            ChangeOp::UpdateAfter => 4,
        }
    }
}

/// A customer change row.
#[derive(Debug, Clone)]
pub struct CustomerChange {
    pub lsn: Lsn,
    pub seqval: Lsn,
    pub op: ChangeOp,
    pub customer_id: i32,
    pub segment: Option<String>,
    pub is_active: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// An order change row.
#[derive(Debug, Clone)]
pub struct OrderChange {
    pub lsn: Lsn,
    pub seqval: Lsn,
    pub op: ChangeOp,
    pub order_id: i64,
    pub customer_id: Option<i32>,
    pub amount: Option<f64>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A payment change row.
#[derive(Debug, Clone)]
pub struct PaymentChange {
    pub lsn: Lsn,
    pub seqval: Lsn,
    pub op: ChangeOp,
    pub payment_id: i64,
    pub order_id: Option<i64>,
    pub paid_amount: Option<f64>,
    pub paid_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Row decoding
// ============================================================================
//
// Both the source CDC functions and the staging loads project columns in the
// same positional layout (lsn, seqval, op, payload…), so one decoder per
// variant serves both sides. Integer and float columns are probed across
// widths because the source functions surface INT where the staging tables
// store TINYINT.

pub(crate) fn lsn_at(row: &Row, idx: usize) -> Result<Lsn> {
    let bytes: Option<&[u8]> = row
        .try_get(idx)
        .map_err(|e| Error::query(format!("column {idx}: {e}")))?;
    match bytes {
        Some(b) => Ok(Lsn::from_bytes(b)),
        None => Err(Error::query(format!("column {idx}: NULL LSN"))),
    }
}

fn opt_i64_at(row: &Row, idx: usize) -> Option<i64> {
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Some(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Some(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Some(i64::from(v));
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Some(v);
    }
    None
}

fn opt_i32_at(row: &Row, idx: usize) -> Option<i32> {
    opt_i64_at(row, idx).and_then(|v| i32::try_from(v).ok())
}

fn opt_f64_at(row: &Row, idx: usize) -> Option<f64> {
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Some(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Some(f64::from(v));
    }
    None
}

fn opt_string_at(row: &Row, idx: usize) -> Option<String> {
    row.try_get::<&str, _>(idx)
        .ok()
        .flatten()
        .map(str::to_string)
}

fn opt_bool_at(row: &Row, idx: usize) -> Option<bool> {
    row.try_get::<bool, _>(idx).ok().flatten()
}

fn opt_datetime_at(row: &Row, idx: usize) -> Option<DateTime<Utc>> {
    row.try_get::<chrono::NaiveDateTime, _>(idx)
        .ok()
        .flatten()
        .map(|dt| dt.and_utc())
}

/// The raw operation code at the conventional column position, if readable.
pub(crate) fn raw_op_code(row: &Row) -> Option<i64> {
    opt_i64_at(row, 2)
}

fn op_at(row: &Row, idx: usize) -> Result<ChangeOp> {
    let code = opt_i64_at(row, idx)
        .ok_or_else(|| Error::query(format!("column {idx}: NULL operation code")))?;
    ChangeOp::from_code(code)
        .ok_or_else(|| Error::query(format!("unsupported CDC operation code {code}")))
}

pub(crate) fn decode_customer(row: &Row) -> Result<CustomerChange> {
    Ok(CustomerChange {
        lsn: lsn_at(row, 0)?,
        seqval: lsn_at(row, 1)?,
        op: op_at(row, 2)?,
        customer_id: opt_i32_at(row, 3)
            .ok_or_else(|| Error::query("customer change without customer_id"))?,
        segment: opt_string_at(row, 4),
        is_active: opt_bool_at(row, 5),
        updated_at: opt_datetime_at(row, 6),
    })
}

pub(crate) fn decode_order(row: &Row) -> Result<OrderChange> {
    Ok(OrderChange {
        lsn: lsn_at(row, 0)?,
        seqval: lsn_at(row, 1)?,
        op: op_at(row, 2)?,
        order_id: opt_i64_at(row, 3)
            .ok_or_else(|| Error::query("order change without order_id"))?,
        customer_id: opt_i32_at(row, 4),
        amount: opt_f64_at(row, 5),
        status: opt_string_at(row, 6),
        created_at: opt_datetime_at(row, 7),
        updated_at: opt_datetime_at(row, 8),
    })
}

pub(crate) fn decode_payment(row: &Row) -> Result<PaymentChange> {
    Ok(PaymentChange {
        lsn: lsn_at(row, 0)?,
        seqval: lsn_at(row, 1)?,
        op: op_at(row, 2)?,
        payment_id: opt_i64_at(row, 3)
            .ok_or_else(|| Error::query("payment change without payment_id"))?,
        order_id: opt_i64_at(row, 4),
        paid_amount: opt_f64_at(row, 5),
        paid_at: opt_datetime_at(row, 6),
    })
}

// ============================================================================
// Repository
// ============================================================================

/// Staging-table access over the serving pool.
#[derive(Clone)]
pub struct StagingRepository {
    pool: Pool,
}

impl StagingRepository {
    /// Create a repository over the serving pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert customer change rows, skipping rows whose
    /// `(lsn, seqval, customer_id)` already exists. Rows are applied in
    /// input order.
    pub async fn insert_customers_tx(
        &self,
        tx: &mut Tx<'_>,
        rows: &[CustomerChange],
    ) -> Result<()> {
        for row in rows {
            tx.execute(
                "INSERT INTO dbo.stg_cdc_customers \
                   (lsn, seqval, op, customer_id, segment, is_active, updated_at) \
                 SELECT @P1, @P2, @P3, @P4, @P5, @P6, @P7 \
                 WHERE NOT EXISTS ( \
                   SELECT 1 FROM dbo.stg_cdc_customers \
                   WHERE lsn = @P1 AND seqval = @P2 AND customer_id = @P4 \
                 );",
                &[
                    &row.lsn,
                    &row.seqval,
                    &row.op.code(),
                    &row.customer_id,
                    &row.segment,
                    &row.is_active,
                    &row.updated_at.map(|t| t.naive_utc()),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Insert order change rows idempotently, in input order.
    pub async fn insert_orders_tx(&self, tx: &mut Tx<'_>, rows: &[OrderChange]) -> Result<()> {
        for row in rows {
            tx.execute(
                "INSERT INTO dbo.stg_cdc_orders \
                   (lsn, seqval, op, order_id, customer_id, amount, status, created_at, updated_at) \
                 SELECT @P1, @P2, @P3, @P4, @P5, @P6, @P7, @P8, @P9 \
                 WHERE NOT EXISTS ( \
                   SELECT 1 FROM dbo.stg_cdc_orders \
                   WHERE lsn = @P1 AND seqval = @P2 AND order_id = @P4 \
                 );",
                &[
                    &row.lsn,
                    &row.seqval,
                    &row.op.code(),
                    &row.order_id,
                    &row.customer_id,
                    &row.amount,
                    &row.status,
                    &row.created_at.map(|t| t.naive_utc()),
                    &row.updated_at.map(|t| t.naive_utc()),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Insert payment change rows idempotently, in input order.
    pub async fn insert_payments_tx(&self, tx: &mut Tx<'_>, rows: &[PaymentChange]) -> Result<()> {
        for row in rows {
            tx.execute(
                "INSERT INTO dbo.stg_cdc_payments \
                   (lsn, seqval, op, payment_id, order_id, paid_amount, paid_at) \
                 SELECT @P1, @P2, @P3, @P4, @P5, @P6, @P7 \
                 WHERE NOT EXISTS ( \
                   SELECT 1 FROM dbo.stg_cdc_payments \
                   WHERE lsn = @P1 AND seqval = @P2 AND payment_id = @P4 \
                 );",
                &[
                    &row.lsn,
                    &row.seqval,
                    &row.op.code(),
                    &row.payment_id,
                    &row.order_id,
                    &row.paid_amount,
                    &row.paid_at.map(|t| t.naive_utc()),
                ],
            )
            .await?;
        }
        Ok(())
    }

    /// Whether any staged row of `capture` satisfies `from < lsn <= to`.
    ///
    /// The half-open low bound matches the ingestor's "next LSN" advance: a
    /// checkpoint equal to the cutoff means nothing new.
    pub async fn has_deltas(&self, capture: Capture, from: Lsn, to: Lsn) -> Result<bool> {
        let sql = format!(
            "SELECT TOP (1) 1 FROM {} WHERE lsn > @P1 AND lsn <= @P2;",
            capture.staging_table()
        );
        let mut conn = self.pool.get().await?;
        let rows = conn.query(&sql, &[&from, &to]).await?;
        Ok(!rows.is_empty())
    }

    /// Load every staged customer change with `lsn <= up_to`.
    pub async fn load_customers_all(&self, up_to: Lsn) -> Result<Vec<CustomerChange>> {
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT lsn, seqval, op, customer_id, segment, is_active, updated_at \
                 FROM dbo.stg_cdc_customers \
                 WHERE lsn <= @P1 \
                 ORDER BY lsn, seqval;",
                &[&up_to],
            )
            .await?;
        rows.iter().map(decode_customer).collect()
    }

    /// Load every staged order change with `lsn <= up_to`.
    pub async fn load_orders_all(&self, up_to: Lsn) -> Result<Vec<OrderChange>> {
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT lsn, seqval, op, order_id, customer_id, amount, status, created_at, updated_at \
                 FROM dbo.stg_cdc_orders \
                 WHERE lsn <= @P1 \
                 ORDER BY lsn, seqval;",
                &[&up_to],
            )
            .await?;
        rows.iter().map(decode_order).collect()
    }

    /// Load staged payment changes with `paid_at >= since` and `lsn <= up_to`.
    pub async fn load_payments_window(
        &self,
        since: DateTime<Utc>,
        up_to: Lsn,
    ) -> Result<Vec<PaymentChange>> {
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT lsn, seqval, op, payment_id, order_id, paid_amount, paid_at \
                 FROM dbo.stg_cdc_payments \
                 WHERE paid_at >= @P1 AND lsn <= @P2 \
                 ORDER BY lsn, seqval;",
                &[&since.naive_utc(), &up_to],
            )
            .await?;
        rows.iter().map(decode_payment).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_op_codes() {
        assert_eq!(ChangeOp::from_code(1), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::from_code(2), Some(ChangeOp::Insert));
        assert_eq!(ChangeOp::from_code(3), Some(ChangeOp::UpdateBefore));
        assert_eq!(ChangeOp::from_code(4), Some(ChangeOp::UpdateAfter));
        assert_eq!(ChangeOp::from_code(0), None);
        assert_eq!(ChangeOp::from_code(5), None);

        for op in [
            ChangeOp::Delete,
            ChangeOp::Insert,
            ChangeOp::UpdateBefore,
            ChangeOp::UpdateAfter,
        ] {
            assert_eq!(ChangeOp::from_code(i64::from(op.code())), Some(op));
        }
    }

    #[test]
    fn test_capture_names_round_trip() {
        for capture in Capture::ALL {
            assert_eq!(
                Capture::from_instance_name(capture.instance_name()),
                Some(capture)
            );
            assert!(capture.staging_table().starts_with("dbo.stg_cdc_"));
        }
        assert_eq!(Capture::from_instance_name("dbo_unknown"), None);
    }

    #[test]
    fn test_capture_order_is_stable() {
        let mut sorted = Capture::ALL;
        sorted.sort();
        assert_eq!(sorted, Capture::ALL);
    }
}
