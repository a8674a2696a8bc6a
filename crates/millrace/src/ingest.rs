//! CDC ingestor: one polling worker per capture instance.
//!
//! Each cycle reads the capture's watermark, asks the source for its
//! retained window, fetches at most `batch_max_rows` ordered changes and
//! commits them into staging together with the watermark advance in a
//! single serving-side transaction. Delivery to staging is at-least-once;
//! the staging unique constraint turns replays into no-ops, so a crash
//! between fetch and commit costs nothing but a refetch.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lsn::Lsn;
use crate::metadata::MetadataRepository;
use crate::source::SourceClient;
use crate::staging::{Capture, CustomerChange, OrderChange, PaymentChange, StagingRepository};
use crate::tds::Pool;

/// One fetched batch, tagged by capture variant.
enum ChangeBatch {
    Customers(Vec<CustomerChange>),
    Orders(Vec<OrderChange>),
    Payments(Vec<PaymentChange>),
}

impl ChangeBatch {
    fn len(&self) -> usize {
        match self {
            ChangeBatch::Customers(rows) => rows.len(),
            ChangeBatch::Orders(rows) => rows.len(),
            ChangeBatch::Payments(rows) => rows.len(),
        }
    }

    /// The LSN of the last row, which becomes the new watermark.
    fn end_lsn(&self) -> Option<Lsn> {
        match self {
            ChangeBatch::Customers(rows) => rows.last().map(|r| r.lsn),
            ChangeBatch::Orders(rows) => rows.last().map(|r| r.lsn),
            ChangeBatch::Payments(rows) => rows.last().map(|r| r.lsn),
        }
    }
}

/// Where a cycle should resume relative to the retained source window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    /// Never ingested, or the retained window moved past the watermark.
    FromWindowStart,
    /// Watermark is inside the window; continue after it.
    AfterWatermark,
}

fn resume_point(last: Lsn, window_min: Lsn) -> Resume {
    if last.is_zero() || last < window_min {
        Resume::FromWindowStart
    } else {
        Resume::AfterWatermark
    }
}

/// Polling ingestion worker for a single capture instance.
pub struct Ingestor {
    source: Pool,
    serving: Pool,
    metadata: MetadataRepository,
    staging: StagingRepository,
    source_name: String,
    capture: Capture,
    batch_max_rows: u32,
    interval: Duration,
}

impl Ingestor {
    /// Create an ingestor for `capture`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Pool,
        serving: Pool,
        metadata: MetadataRepository,
        staging: StagingRepository,
        source_name: String,
        capture: Capture,
        batch_max_rows: u32,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            serving,
            metadata,
            staging,
            source_name,
            capture,
            batch_max_rows,
            interval,
        }
    }

    /// Run until the shutdown signal fires. Cycle errors are logged and
    /// retried on the next tick; they never escape the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(capture = %self.capture, "ingestor started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(
                            capture = %self.capture,
                            error = %e,
                            retriable = e.is_retriable(),
                            "ingestion cycle failed"
                        );
                    }
                }
            }
        }

        info!(capture = %self.capture, "ingestor stopped");
    }

    /// One ingestion cycle.
    pub async fn run_once(&self) -> Result<()> {
        let last = self
            .metadata
            .ingestion_watermark(&self.source_name, self.capture)
            .await?;

        let mut src = SourceClient::new(self.source.get().await?);
        let Some((window_min, window_max)) = src.lsn_bounds(self.capture).await? else {
            return Ok(());
        };

        let from = match resume_point(last, window_min) {
            Resume::FromWindowStart => {
                if !last.is_zero() {
                    // Retention outran the watermark: changes between the
                    // watermark and the window start are lost.
                    warn!(
                        capture = %self.capture,
                        watermark = %last,
                        window_min = %window_min,
                        "source log truncated past watermark, re-ingesting from window start"
                    );
                }
                window_min
            }
            Resume::AfterWatermark => match src.increment_lsn(last).await? {
                Some(next) => next,
                None => {
                    debug!(capture = %self.capture, "source returned no next LSN");
                    return Ok(());
                }
            },
        };

        if from > window_max {
            return Ok(());
        }

        let batch = self.fetch_batch(&mut src, from, window_max).await?;
        let Some(end_lsn) = batch.end_lsn() else {
            return Ok(());
        };

        // Return the source connection before opening the serving-side
        // transaction; a worker holds at most one connection per store.
        drop(src);

        self.persist(&batch, end_lsn).await?;
        debug!(
            capture = %self.capture,
            rows = batch.len(),
            end_lsn = %end_lsn,
            "ingested cdc batch"
        );
        Ok(())
    }

    async fn fetch_batch(
        &self,
        src: &mut SourceClient,
        from: Lsn,
        to: Lsn,
    ) -> Result<ChangeBatch> {
        let max = self.batch_max_rows;
        Ok(match self.capture {
            Capture::Customers => ChangeBatch::Customers(src.fetch_customers(from, to, max).await?),
            Capture::Orders => ChangeBatch::Orders(src.fetch_orders(from, to, max).await?),
            Capture::Payments => ChangeBatch::Payments(src.fetch_payments(from, to, max).await?),
        })
    }

    /// Staging insert and watermark advance, atomically.
    async fn persist(&self, batch: &ChangeBatch, end_lsn: Lsn) -> Result<()> {
        let mut conn = self.serving.get().await?;
        let mut tx = conn.begin().await?;

        let res = async {
            match batch {
                ChangeBatch::Customers(rows) => {
                    self.staging.insert_customers_tx(&mut tx, rows).await?;
                }
                ChangeBatch::Orders(rows) => {
                    self.staging.insert_orders_tx(&mut tx, rows).await?;
                }
                ChangeBatch::Payments(rows) => {
                    self.staging.insert_payments_tx(&mut tx, rows).await?;
                }
            }
            self.metadata
                .update_ingestion_watermark_tx(&mut tx, &self.source_name, self.capture, end_lsn)
                .await
        }
        .await;

        match res {
            Ok(()) => tx.commit().await,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(capture = %self.capture, error = %rb, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(b: u8) -> Lsn {
        Lsn::from_bytes(&[b])
    }

    #[test]
    fn test_resume_bootstrap_from_zero() {
        assert_eq!(resume_point(Lsn::ZERO, lsn(0x05)), Resume::FromWindowStart);
    }

    #[test]
    fn test_resume_after_truncation() {
        // Watermark fell behind the retained window: restart at window min.
        assert_eq!(resume_point(lsn(0x02), lsn(0x05)), Resume::FromWindowStart);
    }

    #[test]
    fn test_resume_inside_window() {
        assert_eq!(resume_point(lsn(0x05), lsn(0x05)), Resume::AfterWatermark);
        assert_eq!(resume_point(lsn(0x09), lsn(0x05)), Resume::AfterWatermark);
    }

    #[test]
    fn test_batch_end_lsn_is_last_row() {
        let batch = ChangeBatch::Customers(vec![
            CustomerChange {
                lsn: lsn(0x01),
                seqval: lsn(0x01),
                op: crate::staging::ChangeOp::Insert,
                customer_id: 1,
                segment: None,
                is_active: None,
                updated_at: None,
            },
            CustomerChange {
                lsn: lsn(0x02),
                seqval: lsn(0x01),
                op: crate::staging::ChangeOp::Insert,
                customer_id: 2,
                segment: None,
                is_active: None,
                updated_at: None,
            },
        ]);
        assert_eq!(batch.end_lsn(), Some(lsn(0x02)));
        assert_eq!(batch.len(), 2);

        let empty = ChangeBatch::Orders(Vec::new());
        assert_eq!(empty.end_lsn(), None);
    }
}
