//! # millrace: CDC ingestion and projection engine
//!
//! Transforms a transactional database's change log into analytical
//! materialized views held in a separate serving store, with second-scale
//! latency and deterministic, progress-preserving restarts.
//!
//! ## Architecture
//!
//! ```text
//! source change log ──► ingestors (one per capture instance)
//!                           │  poll by LSN window, idempotent append
//!                           ▼
//!                    staging tables ──► projection workers
//!                                           │  cutoff = min(watermarks)
//!                                           │  collapse-to-latest in DuckDB
//!                                           ▼
//!                           projection tables + checkpoints + metadata
//! ```
//!
//! The progress protocol is LSN-based: each ingestor commits staged rows
//! and its watermark atomically; each projection worker derives a
//! cross-stream cutoff at cycle start, rebuilds, and commits rows,
//! checkpoints and metadata atomically. Watermarks and checkpoints are
//! monotone, staging is deduplicated by `(lsn, seqval, business_key)`, and
//! a killed process resumes from its last committed frontier.
//!
//! ## Crate layout
//!
//! - [`lsn`]: the 10-byte ordered LSN token
//! - [`config`]: environment configuration contract
//! - [`tds`]: SQL Server connectivity, transactions and pooling
//! - [`metadata`] / [`staging`]: serving-store repositories
//! - [`source`]: source-store CDC primitives
//! - [`ingest`]: per-capture polling ingestors
//! - [`engine`]: per-cycle embedded DuckDB host
//! - [`projections`]: KPI and latest-state workers
//! - [`orchestrator`]: pools, bootstrap, worker lifecycle and shutdown

pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod lsn;
pub mod metadata;
pub mod orchestrator;
pub mod projections;
pub mod source;
pub mod staging;
pub mod tds;

pub use config::Config;
pub use error::{Error, Result};
pub use lsn::Lsn;
pub use metadata::{MetadataRepository, ProjectionStatus};
pub use staging::{Capture, ChangeOp, StagingRepository};
