//! Source-store CDC access.
//!
//! The source exposes its change log through three primitives per database:
//! window bounds (`sys.fn_cdc_get_min_lsn` / `sys.fn_cdc_get_max_lsn`), a
//! "next LSN" function (`sys.fn_cdc_increment_lsn`) and per-capture ordered
//! change functions (`cdc.fn_cdc_get_all_changes_<capture>`). Because the
//! increment primitive is available, fetch windows are closed `[from, to]`
//! end to end.
//!
//! The change functions reject windows that drifted outside the retained
//! log (for example after the capture job trimmed it). Those errors are
//! classified and treated as "nothing to fetch this cycle"; anything else
//! propagates.

use tracing::warn;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::staging::{
    decode_customer, decode_order, decode_payment, Capture, CustomerChange, OrderChange,
    PaymentChange,
};
use crate::tds::PooledConn;

/// Error fragments SQL Server emits for out-of-window CDC queries.
const WINDOW_ERROR_PATTERNS: [&str; 3] = [
    "insufficient number of arguments",
    "start lsn",
    "cannot be greater than",
];

/// A per-cycle client over a borrowed source connection.
pub struct SourceClient {
    conn: PooledConn,
}

impl SourceClient {
    /// Wrap a borrowed source connection.
    pub fn new(conn: PooledConn) -> Self {
        Self { conn }
    }

    /// The `(min, max)` bounds of the currently retained change window for
    /// a capture, or `None` when either side is NULL (capture not yet
    /// active, or log empty).
    pub async fn lsn_bounds(&mut self, capture: Capture) -> Result<Option<(Lsn, Lsn)>> {
        let sql = format!(
            "SELECT sys.fn_cdc_get_min_lsn('{}'), sys.fn_cdc_get_max_lsn();",
            capture.instance_name()
        );
        let rows = self.conn.query(&sql, &[]).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let min: Option<&[u8]> = row
            .try_get(0)
            .map_err(|e| Error::query(format!("min lsn: {e}")))?;
        let max: Option<&[u8]> = row
            .try_get(1)
            .map_err(|e| Error::query(format!("max lsn: {e}")))?;

        match (min, max) {
            (Some(min), Some(max)) => Ok(Some((Lsn::from_bytes(min), Lsn::from_bytes(max)))),
            _ => Ok(None),
        }
    }

    /// The smallest LSN strictly greater than `lsn`, or `None` when the
    /// source returns NULL (treated by callers as "nothing to do").
    pub async fn increment_lsn(&mut self, lsn: Lsn) -> Result<Option<Lsn>> {
        let rows = self
            .conn
            .query("SELECT sys.fn_cdc_increment_lsn(@P1);", &[&lsn])
            .await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let bytes: Option<&[u8]> = row
            .try_get(0)
            .map_err(|e| Error::query(format!("increment lsn: {e}")))?;
        Ok(bytes.map(Lsn::from_bytes))
    }

    /// Fetch customer changes in `[from, to]`, ordered `(lsn, seqval)`.
    pub async fn fetch_customers(
        &mut self,
        from: Lsn,
        to: Lsn,
        max_rows: u32,
    ) -> Result<Vec<CustomerChange>> {
        let rows = self
            .fetch_changes(
                Capture::Customers,
                "customer_id, segment, is_active, updated_at",
                from,
                to,
                max_rows,
            )
            .await?;
        decode_rows(rows, Capture::Customers, decode_customer)
    }

    /// Fetch order changes in `[from, to]`, ordered `(lsn, seqval)`.
    pub async fn fetch_orders(
        &mut self,
        from: Lsn,
        to: Lsn,
        max_rows: u32,
    ) -> Result<Vec<OrderChange>> {
        let rows = self
            .fetch_changes(
                Capture::Orders,
                "order_id, customer_id, amount, status, created_at, updated_at",
                from,
                to,
                max_rows,
            )
            .await?;
        decode_rows(rows, Capture::Orders, decode_order)
    }

    /// Fetch payment changes in `[from, to]`, ordered `(lsn, seqval)`.
    pub async fn fetch_payments(
        &mut self,
        from: Lsn,
        to: Lsn,
        max_rows: u32,
    ) -> Result<Vec<PaymentChange>> {
        let rows = self
            .fetch_changes(
                Capture::Payments,
                "payment_id, order_id, paid_amount, paid_at",
                from,
                to,
                max_rows,
            )
            .await?;
        decode_rows(rows, Capture::Payments, decode_payment)
    }

    async fn fetch_changes(
        &mut self,
        capture: Capture,
        payload_columns: &str,
        from: Lsn,
        to: Lsn,
        max_rows: u32,
    ) -> Result<Vec<tiberius::Row>> {
        // The capture instance is part of the function name and cannot be
        // parameterized; it comes from the static Capture enum.
        let sql = format!(
            "SELECT TOP (@P1) __$start_lsn, __$seqval, __$operation, {payload} \
             FROM cdc.fn_cdc_get_all_changes_{instance}(@P2, @P3, N'all') \
             ORDER BY __$start_lsn, __$seqval;",
            payload = payload_columns,
            instance = capture.instance_name(),
        );
        let max = i32::try_from(max_rows).unwrap_or(i32::MAX);

        match self.conn.query(&sql, &[&max, &from, &to]).await {
            Ok(rows) => Ok(rows),
            Err(e) if is_window_error(&e) => {
                warn!(capture = %capture, error = %e, "cdc window query rejected, skipping cycle");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether an error is a CDC window-bound rejection rather than a real
/// failure.
pub fn is_window_error(err: &Error) -> bool {
    is_window_error_text(&err.to_string())
}

fn is_window_error_text(text: &str) -> bool {
    let lowered = text.to_ascii_lowercase();
    WINDOW_ERROR_PATTERNS.iter().any(|p| lowered.contains(p))
}

fn decode_rows<T>(
    rows: Vec<tiberius::Row>,
    capture: Capture,
    decode: impl Fn(&tiberius::Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Some(code) = crate::staging::raw_op_code(row) {
            if crate::staging::ChangeOp::from_code(code).is_none() {
                warn!(capture = %capture, code, "skipping change row with unknown operation code");
                continue;
            }
        }
        out.push(decode(row)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_error_classification() {
        assert!(is_window_error_text(
            "An insufficient number of arguments were supplied for the procedure or function cdc.fn_cdc_get_all_changes_dbo_orders."
        ));
        assert!(is_window_error_text(
            "The start LSN specified is invalid for the capture instance."
        ));
        assert!(is_window_error_text(
            "the value CANNOT BE GREATER THAN the current maximum LSN"
        ));
        assert!(!is_window_error_text("deadlock victim"));
        assert!(!is_window_error_text("login failed for user 'sa'"));
    }

    #[test]
    fn test_window_error_wraps_engine_error() {
        let err = Error::query("start LSN greater than max LSN");
        assert!(is_window_error(&err));
        let err = Error::query("syntax error near SELECT");
        assert!(!is_window_error(&err));
    }
}
