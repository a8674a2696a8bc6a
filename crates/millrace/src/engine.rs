//! Embedded analytical engine host.
//!
//! Each projection cycle opens a private in-memory DuckDB session, loads
//! the staged change rows it needs, installs its transform views and
//! extracts typed output rows. Nothing survives the cycle: the session is
//! dropped with the worker's stack frame, which keeps the host stateless
//! and the transform deterministic given its inputs.
//!
//! Boundary conventions: LSN and seqval travel as 10-byte BLOBs so the
//! engine ranks them with the same unsigned byte order the stores use;
//! timestamps are normalized to naive UTC; nullable payload columns pass
//! through `Option`.

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{params, Connection};

use crate::error::Result;
use crate::staging::{CustomerChange, OrderChange, PaymentChange};

/// Delta-table schema mirroring the staging shapes, plus the parameter
/// table transforms read their window bound from.
const CHANGE_SCHEMA: &str = "\
CREATE TABLE orders_delta (
  lsn BLOB,
  seqval BLOB,
  op UTINYINT,
  order_id BIGINT,
  customer_id INTEGER,
  amount DOUBLE,
  status VARCHAR,
  created_at TIMESTAMP,
  updated_at TIMESTAMP
);
CREATE TABLE customers_delta (
  lsn BLOB,
  seqval BLOB,
  op UTINYINT,
  customer_id INTEGER,
  segment VARCHAR,
  is_active BOOLEAN,
  updated_at TIMESTAMP
);
CREATE TABLE payments_delta (
  lsn BLOB,
  seqval BLOB,
  op UTINYINT,
  payment_id BIGINT,
  order_id BIGINT,
  paid_amount DOUBLE,
  paid_at TIMESTAMP
);
CREATE TABLE projection_params (
  window_start TIMESTAMP
);
";

/// A single-cycle analytical session.
pub struct AnalyticsSession {
    conn: Connection,
}

impl AnalyticsSession {
    /// Open an in-memory session with the change schema installed.
    pub fn open() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CHANGE_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Set the recompute window bound read by windowed transforms.
    pub fn set_window_start(&self, window_start: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO projection_params (window_start) VALUES (?);",
            params![window_start.naive_utc()],
        )?;
        Ok(())
    }

    /// Bulk-load customer change rows.
    pub fn load_customers(&self, rows: &[CustomerChange]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO customers_delta \
               (lsn, seqval, op, customer_id, segment, is_active, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?);",
        )?;
        for row in rows {
            stmt.execute(params![
                row.lsn.as_bytes().to_vec(),
                row.seqval.as_bytes().to_vec(),
                row.op.code(),
                row.customer_id,
                row.segment,
                row.is_active,
                naive(row.updated_at),
            ])?;
        }
        Ok(())
    }

    /// Bulk-load order change rows.
    pub fn load_orders(&self, rows: &[OrderChange]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO orders_delta \
               (lsn, seqval, op, order_id, customer_id, amount, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?);",
        )?;
        for row in rows {
            stmt.execute(params![
                row.lsn.as_bytes().to_vec(),
                row.seqval.as_bytes().to_vec(),
                row.op.code(),
                row.order_id,
                row.customer_id,
                row.amount,
                row.status,
                naive(row.created_at),
                naive(row.updated_at),
            ])?;
        }
        Ok(())
    }

    /// Bulk-load payment change rows.
    pub fn load_payments(&self, rows: &[PaymentChange]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO payments_delta \
               (lsn, seqval, op, payment_id, order_id, paid_amount, paid_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?);",
        )?;
        for row in rows {
            stmt.execute(params![
                row.lsn.as_bytes().to_vec(),
                row.seqval.as_bytes().to_vec(),
                row.op.code(),
                row.payment_id,
                row.order_id,
                row.paid_amount,
                naive(row.paid_at),
            ])?;
        }
        Ok(())
    }

    /// Install transform views (a semicolon-separated batch).
    pub fn install_views(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a query and map each result row into a typed value.
    pub fn query_rows<T, F>(&self, sql: &str, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&duckdb::Row<'_>) -> duckdb::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let mapped = stmt.query_map([], map)?;
        let mut out = Vec::new();
        for row in mapped {
            out.push(row?);
        }
        Ok(out)
    }
}

fn naive(ts: Option<DateTime<Utc>>) -> Option<NaiveDateTime> {
    ts.map(|t| t.naive_utc())
}

/// Read a required TIMESTAMP column as UTC.
pub(crate) fn utc_at(row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<DateTime<Utc>> {
    Ok(row.get::<_, NaiveDateTime>(idx)?.and_utc())
}

/// Read a nullable TIMESTAMP column as UTC.
pub(crate) fn opt_utc_at(
    row: &duckdb::Row<'_>,
    idx: usize,
) -> duckdb::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<NaiveDateTime>>(idx)?
        .map(|dt| dt.and_utc()))
}
