//! Engine configuration from the process environment.
//!
//! Variable names are the operational contract:
//!
//! | Name | Meaning | Default |
//! |---|---|---|
//! | `SOURCE_DSN` | connection string to the source store | required |
//! | `SERVING_DSN` | connection string to the serving store | required |
//! | `SOURCE_NAME` | logical source label | `source1` |
//! | `POLL_INTERVAL_SECONDS` | ingestor cycle period | `5` |
//! | `CDC_BATCH_MAX_ROWS` | max rows per ingestor fetch | `5000` |
//! | `PROJECTION_INTERVAL_SECONDS` | projection cycle period | `15` |
//! | `PROJECTION_RECOMPUTE_WINDOW_MINUTES` | aggregate rebuild window | `15` |
//! | `ENABLE_PROJ_ORDERS_KPI` | enable the aggregate worker | `true` |
//! | `ENABLE_PROJ_ORDERS_LATEST` | enable the latest-state worker | `false` |
//! | `LOG_LEVEL` | `debug`/`info`/`warn`/`error` | `info` |
//!
//! Missing DSNs and non-positive numeric values fail startup; malformed
//! numerics and booleans fall back to their defaults.

use std::time::Duration;

use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// DSN of the source store (where CDC change tables live).
    pub source_dsn: String,
    /// DSN of the serving store (staging, control and projection tables).
    pub serving_dsn: String,
    /// Logical source label recorded in watermark rows.
    pub source_name: String,
    /// Ingestor cycle period.
    pub poll_interval: Duration,
    /// Maximum rows per ingestor fetch.
    pub cdc_batch_max_rows: u32,
    /// Projection worker cycle period.
    pub projection_interval: Duration,
    /// Bounded recent interval the aggregate projection rebuilds each cycle.
    pub projection_recompute_window: Duration,
    /// Enable the per-minute/segment order KPI projection.
    pub enable_proj_orders_kpi: bool,
    /// Enable the latest-state order projection.
    pub enable_proj_orders_latest: bool,
    /// Log level: `debug`, `info`, `warn` or `error`.
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process environment and validate it.
    pub fn from_env() -> Result<Self> {
        let cfg = Config {
            source_dsn: get_string("SOURCE_DSN", ""),
            serving_dsn: get_string("SERVING_DSN", ""),
            source_name: get_string("SOURCE_NAME", "source1"),
            poll_interval: Duration::from_secs(get_i64("POLL_INTERVAL_SECONDS", 5).max(0) as u64),
            cdc_batch_max_rows: get_i64("CDC_BATCH_MAX_ROWS", 5000).clamp(0, i64::from(u32::MAX))
                as u32,
            projection_interval: Duration::from_secs(
                get_i64("PROJECTION_INTERVAL_SECONDS", 15).max(0) as u64,
            ),
            projection_recompute_window: Duration::from_secs(
                60 * get_i64("PROJECTION_RECOMPUTE_WINDOW_MINUTES", 15).max(0) as u64,
            ),
            enable_proj_orders_kpi: get_bool("ENABLE_PROJ_ORDERS_KPI", true),
            enable_proj_orders_latest: get_bool("ENABLE_PROJ_ORDERS_LATEST", false),
            log_level: normalize_log_level(&get_string("LOG_LEVEL", "info")),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.source_dsn.is_empty() {
            return Err(Error::config("SOURCE_DSN is required"));
        }
        if self.serving_dsn.is_empty() {
            return Err(Error::config("SERVING_DSN is required"));
        }
        if self.cdc_batch_max_rows == 0 {
            return Err(Error::config("CDC_BATCH_MAX_ROWS must be > 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("POLL_INTERVAL_SECONDS must be > 0"));
        }
        if self.projection_interval.is_zero() {
            return Err(Error::config("PROJECTION_INTERVAL_SECONDS must be > 0"));
        }
        if self.projection_recompute_window.is_zero() {
            return Err(Error::config(
                "PROJECTION_RECOMPUTE_WINDOW_MINUTES must be > 0",
            ));
        }
        Ok(())
    }
}

fn get_string(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

/// Negative values pass through so `validate` can reject them explicitly;
/// malformed values fall back.
fn get_i64(key: &str, fallback: i64) -> i64 {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

fn get_bool(key: &str, fallback: bool) -> bool {
    let v = match std::env::var(key) {
        Ok(v) => v.trim().to_ascii_lowercase(),
        Err(_) => return fallback,
    };
    match v.as_str() {
        "1" | "true" | "yes" | "y" | "on" => true,
        "0" | "false" | "no" | "n" | "off" => false,
        _ => fallback,
    }
}

fn normalize_log_level(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        l @ ("debug" | "info" | "warn" | "error") => l.to_string(),
        _ => "info".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "SOURCE_DSN",
            "SERVING_DSN",
            "SOURCE_NAME",
            "POLL_INTERVAL_SECONDS",
            "CDC_BATCH_MAX_ROWS",
            "PROJECTION_INTERVAL_SECONDS",
            "PROJECTION_RECOMPUTE_WINDOW_MINUTES",
            "ENABLE_PROJ_ORDERS_KPI",
            "ENABLE_PROJ_ORDERS_LATEST",
            "LOG_LEVEL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("SOURCE_DSN", "sqlserver://sa:pw@localhost:1433/src");
        std::env::set_var("SERVING_DSN", "sqlserver://sa:pw@localhost:1434/serve");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.source_name, "source1");
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.cdc_batch_max_rows, 5000);
        assert_eq!(cfg.projection_interval, Duration::from_secs(15));
        assert_eq!(cfg.projection_recompute_window, Duration::from_secs(900));
        assert!(cfg.enable_proj_orders_kpi);
        assert!(!cfg.enable_proj_orders_latest);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_missing_dsn_is_fatal() {
        clear_env();
        std::env::set_var("SERVING_DSN", "sqlserver://sa:pw@localhost:1434/serve");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("SOURCE_DSN"));
    }

    #[test]
    #[serial]
    fn test_non_positive_numeric_rejected() {
        clear_env();
        std::env::set_var("SOURCE_DSN", "sqlserver://sa:pw@localhost:1433/src");
        std::env::set_var("SERVING_DSN", "sqlserver://sa:pw@localhost:1434/serve");
        std::env::set_var("POLL_INTERVAL_SECONDS", "0");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("POLL_INTERVAL_SECONDS"));

        std::env::set_var("POLL_INTERVAL_SECONDS", "-3");
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_malformed_values_fall_back() {
        clear_env();
        std::env::set_var("SOURCE_DSN", "sqlserver://sa:pw@localhost:1433/src");
        std::env::set_var("SERVING_DSN", "sqlserver://sa:pw@localhost:1434/serve");
        std::env::set_var("CDC_BATCH_MAX_ROWS", "not-a-number");
        std::env::set_var("ENABLE_PROJ_ORDERS_LATEST", "maybe");
        std::env::set_var("LOG_LEVEL", "verbose");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.cdc_batch_max_rows, 5000);
        assert!(!cfg.enable_proj_orders_latest);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_bool_spellings() {
        clear_env();
        std::env::set_var("SOURCE_DSN", "sqlserver://sa:pw@localhost:1433/src");
        std::env::set_var("SERVING_DSN", "sqlserver://sa:pw@localhost:1434/serve");
        std::env::set_var("ENABLE_PROJ_ORDERS_KPI", "off");
        std::env::set_var("ENABLE_PROJ_ORDERS_LATEST", "YES");

        let cfg = Config::from_env().unwrap();
        assert!(!cfg.enable_proj_orders_kpi);
        assert!(cfg.enable_proj_orders_latest);
    }
}
