//! Export configuration
//!
//! Defaults suit a single-node deployment; every field can be overridden with a
//! `SHEET_EXPORT_*` environment variable (a `.env` file is honoured).

use crate::error::{ExportError, Result};
use crate::sink::SheetFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Hard row capacity of a single xlsx worksheet
pub const SHEET_ROW_CAPACITY: u64 = 1_048_576;

const ENV_PREFIX: &str = "SHEET_EXPORT_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Postgres connection string (also read from plain `DATABASE_URL`)
    pub database_url: Option<String>,

    /// Directory generated files are published into
    pub output_dir: PathBuf,

    /// Rows pulled from the cursor per fetch
    pub batch_size: usize,

    /// Rows written between cancellation checks inside one batch
    pub row_check_interval: usize,

    /// Rows returned by a preview
    pub preview_rows: usize,

    /// Maximum data rows written to one output file
    pub row_cap: u64,

    pub cache_ttl_secs: u64,

    /// How long terminal operations stay visible before reaping
    pub retention_secs: u64,

    pub reap_interval_secs: u64,

    pub format: SheetFormat,

    /// Rows sampled per column for width hints
    pub width_sample_rows: usize,

    pub max_column_width: usize,

    /// Rows per xlsx worksheet, header included; further rows continue on a
    /// new worksheet that repeats the header
    pub rows_per_sheet: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            output_dir: PathBuf::from("exports"),
            batch_size: 50_000,
            row_check_interval: 5_000,
            preview_rows: 100,
            row_cap: SHEET_ROW_CAPACITY,
            cache_ttl_secs: 30 * 60,
            retention_secs: 60 * 60,
            reap_interval_secs: 5 * 60,
            format: SheetFormat::Xlsx,
            width_sample_rows: 1_000,
            max_column_width: 60,
            rows_per_sheet: SHEET_ROW_CAPACITY as u32,
        }
    }
}

impl ExportConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup (used by `from_env`)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        config.database_url = get("DATABASE_URL").or_else(|| lookup("DATABASE_URL"));
        if let Some(dir) = get("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(dir);
        }
        parse_into(&get, "BATCH_SIZE", &mut config.batch_size)?;
        parse_into(&get, "ROW_CHECK_INTERVAL", &mut config.row_check_interval)?;
        parse_into(&get, "PREVIEW_ROWS", &mut config.preview_rows)?;
        parse_into(&get, "ROW_CAP", &mut config.row_cap)?;
        parse_into(&get, "CACHE_TTL_SECS", &mut config.cache_ttl_secs)?;
        parse_into(&get, "RETENTION_SECS", &mut config.retention_secs)?;
        parse_into(&get, "REAP_INTERVAL_SECS", &mut config.reap_interval_secs)?;
        parse_into(&get, "FORMAT", &mut config.format)?;
        parse_into(&get, "WIDTH_SAMPLE_ROWS", &mut config.width_sample_rows)?;
        parse_into(&get, "MAX_COLUMN_WIDTH", &mut config.max_column_width)?;
        parse_into(&get, "ROWS_PER_SHEET", &mut config.rows_per_sheet)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ExportError::Config("batch_size must be positive".to_string()));
        }
        if self.row_check_interval == 0 {
            return Err(ExportError::Config(
                "row_check_interval must be positive".to_string(),
            ));
        }
        if self.row_cap == 0 {
            return Err(ExportError::Config("row_cap must be positive".to_string()));
        }
        if self.rows_per_sheet < 2 || u64::from(self.rows_per_sheet) > SHEET_ROW_CAPACITY {
            return Err(ExportError::Config(format!(
                "rows_per_sheet must be between 2 and {}",
                SHEET_ROW_CAPACITY
            )));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

fn parse_into<T, G>(get: &G, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(name) {
        *slot = raw.trim().parse().map_err(|e: T::Err| {
            ExportError::Config(format!("{}{}={:?}: {}", ENV_PREFIX, name, raw, e))
        })?;
    }
    Ok(())
}
