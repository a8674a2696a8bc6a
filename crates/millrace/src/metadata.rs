//! Metadata repository: ingestion watermarks, projection checkpoints and
//! projection metadata in the serving store.
//!
//! Watermarks and checkpoints are monotone non-decreasing and only move
//! inside the same transaction as the writes they describe; the read side
//! of this repository therefore always observes a consistent frontier.

use std::collections::BTreeMap;

use tiberius::ToSql;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lsn::Lsn;
use crate::staging::Capture;
use crate::tds::{Pool, Tx};

/// Upper bound for `last_error` text, matching the fixed-width column.
const MAX_LAST_ERROR_CHARS: usize = 3_900;

/// Projection lifecycle status recorded in `ctl_projection_metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionStatus {
    /// Bootstrapped, never built.
    Init,
    /// Last cycle committed successfully.
    Ok,
    /// Last cycle failed; serving data is at its previous committed state.
    Error,
}

impl ProjectionStatus {
    /// The stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionStatus::Init => "INIT",
            ProjectionStatus::Ok => "OK",
            ProjectionStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn truncate_last_error(text: &str) -> String {
    text.chars().take(MAX_LAST_ERROR_CHARS).collect()
}

/// Control-table access over the serving pool.
#[derive(Clone)]
pub struct MetadataRepository {
    pool: Pool,
}

impl MetadataRepository {
    /// Create a repository over the serving pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Idempotently seed control rows for every configured capture and
    /// projection: zero-LSN watermarks, zero-LSN checkpoints and an `INIT`
    /// metadata row per projection. Safe to call on every startup.
    pub async fn ensure_bootstrap(
        &self,
        source: &str,
        captures: &[Capture],
        projections: &[(&str, &[Capture])],
    ) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let mut tx = conn.begin().await?;

        let res = async {
            for capture in captures {
                tx.execute(
                    "INSERT INTO dbo.ctl_ingestion_watermarks \
                       (source_name, capture_instance, last_ingested_lsn, updated_at) \
                     SELECT @P1, @P2, @P3, SYSUTCDATETIME() \
                     WHERE NOT EXISTS ( \
                       SELECT 1 FROM dbo.ctl_ingestion_watermarks \
                       WHERE source_name = @P1 AND capture_instance = @P2 \
                     );",
                    &[&source, &capture.instance_name(), &Lsn::ZERO],
                )
                .await?;
            }

            for (projection, bound) in projections {
                for capture in *bound {
                    tx.execute(
                        "INSERT INTO dbo.ctl_projection_checkpoints \
                           (projection_name, capture_instance, last_consumed_lsn, updated_at) \
                         SELECT @P1, @P2, @P3, SYSUTCDATETIME() \
                         WHERE NOT EXISTS ( \
                           SELECT 1 FROM dbo.ctl_projection_checkpoints \
                           WHERE projection_name = @P1 AND capture_instance = @P2 \
                         );",
                        &[projection, &capture.instance_name(), &Lsn::ZERO],
                    )
                    .await?;
                }

                tx.execute(
                    "INSERT INTO dbo.ctl_projection_metadata (projection_name, status) \
                     SELECT @P1, @P2 \
                     WHERE NOT EXISTS ( \
                       SELECT 1 FROM dbo.ctl_projection_metadata WHERE projection_name = @P1 \
                     );",
                    &[projection, &ProjectionStatus::Init.as_str()],
                )
                .await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        match res {
            Ok(()) => {
                tx.commit().await?;
                debug!(source, captures = captures.len(), "bootstrap rows ensured");
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Read the last ingested LSN for a capture; zero when absent.
    pub async fn ingestion_watermark(&self, source: &str, capture: Capture) -> Result<Lsn> {
        let mut conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT last_ingested_lsn FROM dbo.ctl_ingestion_watermarks \
                 WHERE source_name = @P1 AND capture_instance = @P2;",
                &[&source, &capture.instance_name()],
            )
            .await?;
        match rows.first() {
            Some(row) => crate::staging::lsn_at(row, 0),
            None => Ok(Lsn::ZERO),
        }
    }

    /// The cross-stream cutoff: minimum watermark across `captures`.
    ///
    /// Fails with [`Error::InvalidArgument`] on an empty capture list; a
    /// minimum over nothing would silently unbound the projection frontier.
    pub async fn min_ingestion_watermark(
        &self,
        source: &str,
        captures: &[Capture],
    ) -> Result<Lsn> {
        if captures.is_empty() {
            return Err(Error::invalid_argument("captures cannot be empty"));
        }

        let placeholders: Vec<String> = (0..captures.len())
            .map(|i| format!("@P{}", i + 2))
            .collect();
        let sql = format!(
            "SELECT MIN(last_ingested_lsn) FROM dbo.ctl_ingestion_watermarks \
             WHERE source_name = @P1 AND capture_instance IN ({});",
            placeholders.join(", ")
        );

        let names: Vec<&str> = captures.iter().map(|c| c.instance_name()).collect();
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(captures.len() + 1);
        params.push(&source);
        for name in &names {
            params.push(name);
        }

        let mut conn = self.pool.get().await?;
        let rows = conn.query(&sql, &params).await?;
        let bytes: Option<&[u8]> = match rows.first() {
            Some(row) => row
                .try_get(0)
                .map_err(|e| Error::query(format!("min watermark: {e}")))?,
            None => None,
        };
        Ok(bytes.map(Lsn::from_bytes).unwrap_or(Lsn::ZERO))
    }

    /// Advance a capture's watermark inside the caller's transaction.
    pub async fn update_ingestion_watermark_tx(
        &self,
        tx: &mut Tx<'_>,
        source: &str,
        capture: Capture,
        lsn: Lsn,
    ) -> Result<()> {
        tx.execute(
            "UPDATE dbo.ctl_ingestion_watermarks \
             SET last_ingested_lsn = @P3, updated_at = SYSUTCDATETIME() \
             WHERE source_name = @P1 AND capture_instance = @P2;",
            &[&source, &capture.instance_name(), &lsn],
        )
        .await?;
        Ok(())
    }

    /// Read a projection's per-capture checkpoints; absent entries default
    /// to zero. The map iterates in stable capture order.
    pub async fn projection_checkpoints(
        &self,
        projection: &str,
        captures: &[Capture],
    ) -> Result<BTreeMap<Capture, Lsn>> {
        let mut result: BTreeMap<Capture, Lsn> =
            captures.iter().map(|c| (*c, Lsn::ZERO)).collect();
        if captures.is_empty() {
            return Ok(result);
        }

        let placeholders: Vec<String> = (0..captures.len())
            .map(|i| format!("@P{}", i + 2))
            .collect();
        let sql = format!(
            "SELECT capture_instance, last_consumed_lsn FROM dbo.ctl_projection_checkpoints \
             WHERE projection_name = @P1 AND capture_instance IN ({});",
            placeholders.join(", ")
        );

        let names: Vec<&str> = captures.iter().map(|c| c.instance_name()).collect();
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(captures.len() + 1);
        params.push(&projection);
        for name in &names {
            params.push(name);
        }

        let mut conn = self.pool.get().await?;
        let rows = conn.query(&sql, &params).await?;
        for row in &rows {
            let name: Option<&str> = row
                .try_get(0)
                .map_err(|e| Error::query(format!("checkpoint capture: {e}")))?;
            let Some(capture) = name.and_then(Capture::from_instance_name) else {
                continue;
            };
            result.insert(capture, crate::staging::lsn_at(row, 1)?);
        }
        Ok(result)
    }

    /// Advance a projection checkpoint inside the caller's transaction.
    pub async fn update_projection_checkpoint_tx(
        &self,
        tx: &mut Tx<'_>,
        projection: &str,
        capture: Capture,
        lsn: Lsn,
    ) -> Result<()> {
        tx.execute(
            "UPDATE dbo.ctl_projection_checkpoints \
             SET last_consumed_lsn = @P3, updated_at = SYSUTCDATETIME() \
             WHERE projection_name = @P1 AND capture_instance = @P2;",
            &[&projection, &capture.instance_name(), &lsn],
        )
        .await?;
        Ok(())
    }

    /// Upsert the projection metadata row inside the caller's transaction,
    /// stamping `as_of_time` and `built_at` to now.
    pub async fn upsert_projection_metadata_tx(
        &self,
        tx: &mut Tx<'_>,
        projection: &str,
        as_of_lsn: Lsn,
        status: ProjectionStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let last_error = last_error.map(str::trim).filter(|s| !s.is_empty());

        let affected = tx
            .execute(
                "UPDATE dbo.ctl_projection_metadata \
                 SET as_of_lsn = @P2, as_of_time = SYSUTCDATETIME(), \
                     built_at = SYSUTCDATETIME(), status = @P3, last_error = @P4 \
                 WHERE projection_name = @P1;",
                &[&projection, &as_of_lsn, &status.as_str(), &last_error],
            )
            .await?;
        if affected > 0 {
            return Ok(());
        }

        tx.execute(
            "INSERT INTO dbo.ctl_projection_metadata \
               (projection_name, as_of_lsn, as_of_time, built_at, status, last_error) \
             VALUES (@P1, @P2, SYSUTCDATETIME(), SYSUTCDATETIME(), @P3, @P4);",
            &[&projection, &as_of_lsn, &status.as_str(), &last_error],
        )
        .await?;
        Ok(())
    }

    /// Best-effort ERROR flag, written outside any transaction so it
    /// survives the rollback of the cycle that failed. The text is
    /// truncated to the column's bounded length.
    pub async fn mark_projection_error(&self, projection: &str, text: &str) -> Result<()> {
        let truncated = truncate_last_error(text);
        let mut conn = self.pool.get().await?;
        conn.execute(
            "UPDATE dbo.ctl_projection_metadata \
             SET status = @P2, last_error = @P3, built_at = SYSUTCDATETIME() \
             WHERE projection_name = @P1;",
            &[&projection, &ProjectionStatus::Error.as_str(), &truncated],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(ProjectionStatus::Init.as_str(), "INIT");
        assert_eq!(ProjectionStatus::Ok.as_str(), "OK");
        assert_eq!(ProjectionStatus::Error.as_str(), "ERROR");
    }

    #[test]
    fn test_last_error_truncation() {
        let short = truncate_last_error("boom");
        assert_eq!(short, "boom");

        let long: String = "x".repeat(10_000);
        let truncated = truncate_last_error(&long);
        assert_eq!(truncated.chars().count(), MAX_LAST_ERROR_CHARS);
    }

    #[test]
    fn test_last_error_truncation_respects_char_boundaries() {
        let long: String = "é".repeat(5_000);
        let truncated = truncate_last_error(&long);
        assert_eq!(truncated.chars().count(), MAX_LAST_ERROR_CHARS);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
