//! Spreadsheet Sink
//!
//! Streaming writer that turns row batches into an output file. Rows go to a
//! staging file next to the destination; `finalize` publishes it with a
//! rename, and any other exit path (abort, error, drop) deletes it.

pub mod cell;
pub mod csv_sheet;
pub mod widths;
pub mod xlsx_sheet;

pub use cell::CellKind;
pub use widths::ColumnWidthTracker;

use crate::config::{ExportConfig, SHEET_ROW_CAPACITY};
use crate::db::{CellValue, Row};
use crate::error::{ExportError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use csv_sheet::CsvSheetWriter;
use xlsx_sheet::XlsxSheetWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SheetFormat {
    Xlsx,
    Csv,
}

impl SheetFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            SheetFormat::Xlsx => "xlsx",
            SheetFormat::Csv => "csv",
        }
    }
}

impl FromStr for SheetFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xlsx" => Ok(SheetFormat::Xlsx),
            "csv" => Ok(SheetFormat::Csv),
            other => Err(ExportError::Config(format!("unknown output format {:?}", other))),
        }
    }
}

impl fmt::Display for SheetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    pub format: SheetFormat,
    pub sheet_name: String,
    pub width_sample_rows: usize,
    pub max_column_width: usize,
    /// xlsx only: rows per worksheet, header included
    pub rows_per_sheet: u32,
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            format: SheetFormat::Xlsx,
            sheet_name: "Export".to_string(),
            width_sample_rows: 1_000,
            max_column_width: 60,
            rows_per_sheet: SHEET_ROW_CAPACITY as u32,
        }
    }
}

impl From<&ExportConfig> for FormatConfig {
    fn from(config: &ExportConfig) -> Self {
        Self {
            format: config.format,
            width_sample_rows: config.width_sample_rows,
            max_column_width: config.max_column_width,
            rows_per_sheet: config.rows_per_sheet,
            ..Self::default()
        }
    }
}

/// Worksheet names: at most 31 characters, none of `[]:*?/\`
fn sheet_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\'))
        .take(24)
        .collect();
    if cleaned.trim().is_empty() {
        "Export".to_string()
    } else {
        cleaned
    }
}

/// Format-specific backend behind the sink
pub trait SheetWriter: Send {
    fn write_header(&mut self, columns: &[String]) -> Result<()>;

    fn write_row(&mut self, row: &[CellValue]) -> Result<()>;

    /// Apply column widths and flush everything to disk
    fn finish(self: Box<Self>, widths: &[f64]) -> Result<()>;
}

pub struct SpreadsheetSink {
    final_path: PathBuf,
    staging_path: PathBuf,
    writer: Option<Box<dyn SheetWriter>>,
    widths: ColumnWidthTracker,
    header_written: bool,
    rows_written: u64,
    released: bool,
}

impl SpreadsheetSink {
    /// Open a sink that will publish to `path`. `staging_tag` keeps the
    /// staging files of concurrent jobs for the same path apart.
    pub fn open(path: &Path, config: &FormatConfig, staging_tag: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut staging = path.as_os_str().to_owned();
        staging.push(format!(".{}.part", staging_tag));
        let staging_path = PathBuf::from(staging);

        let writer: Box<dyn SheetWriter> = match config.format {
            SheetFormat::Xlsx => Box::new(
                XlsxSheetWriter::create(&staging_path, &sheet_name(&config.sheet_name))?
                    .with_rows_per_sheet(config.rows_per_sheet),
            ),
            SheetFormat::Csv => Box::new(CsvSheetWriter::create(&staging_path)?),
        };
        Ok(Self::with_writer(path, staging_path, writer, config))
    }

    /// Wrap an already created backend that writes to `staging_path`
    pub fn with_writer(
        path: &Path,
        staging_path: PathBuf,
        writer: Box<dyn SheetWriter>,
        config: &FormatConfig,
    ) -> Self {
        debug!("Opened sink {:?} (staging {:?})", path, staging_path);
        Self {
            final_path: path.to_path_buf(),
            staging_path,
            writer: Some(writer),
            widths: ColumnWidthTracker::new(config.width_sample_rows, config.max_column_width),
            header_written: false,
            rows_written: 0,
            released: false,
        }
    }

    fn writer(&mut self) -> Result<&mut Box<dyn SheetWriter>> {
        self.writer
            .as_mut()
            .ok_or_else(|| ExportError::Sheet("sink already closed".to_string()))
    }

    pub fn write_header(&mut self, columns: &[String]) -> Result<()> {
        if self.header_written {
            return Err(ExportError::Sheet("header already written".to_string()));
        }
        self.writer()?.write_header(columns)?;
        self.widths.observe_header(columns);
        self.header_written = true;
        Ok(())
    }

    /// Write up to `cap_remaining` rows of `rows`; returns how many were written
    pub fn write_batch(&mut self, rows: &[Row], cap_remaining: u64) -> Result<usize> {
        if !self.header_written {
            return Err(ExportError::Sheet("header must be written before rows".to_string()));
        }
        let take = rows.len().min(usize::try_from(cap_remaining).unwrap_or(usize::MAX));
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ExportError::Sheet("sink already closed".to_string()))?;
        for row in &rows[..take] {
            self.widths.observe_row(row);
            writer.write_row(row)?;
        }
        self.rows_written += take as u64;
        Ok(take)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> &Path {
        &self.final_path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Flush, size columns and publish the file at its final path
    pub fn finalize(mut self) -> Result<PathBuf> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| ExportError::Sheet("sink already closed".to_string()))?;
        writer.finish(&self.widths.widths())?;
        fs::rename(&self.staging_path, &self.final_path)?;
        self.released = true;
        info!(
            "Wrote {} rows to {}",
            self.rows_written,
            self.final_path.display()
        );
        Ok(self.final_path.clone())
    }

    /// Close and delete the partial file
    pub fn abort(mut self) -> Result<()> {
        self.released = true;
        self.writer.take();
        remove_staging(&self.staging_path)
    }
}

impl Drop for SpreadsheetSink {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.writer.take();
        if let Err(e) = remove_staging(&self.staging_path) {
            warn!("Failed to remove partial output {:?}: {}", self.staging_path, e);
        }
    }
}

fn remove_staging(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed partial output {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ExportError::Cleanup(format!("remove {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn header() -> Vec<String> {
        vec!["id".to_string(), "region".to_string(), "booked_on".to_string()]
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                vec![
                    CellValue::Int(i as i64),
                    CellValue::Text(format!("r{}", i)),
                    CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1 + (i % 28) as u32).unwrap()),
                ]
            })
            .collect()
    }

    fn csv_config() -> FormatConfig {
        FormatConfig {
            format: SheetFormat::Csv,
            ..FormatConfig::default()
        }
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("XLSX".parse::<SheetFormat>().unwrap(), SheetFormat::Xlsx);
        assert_eq!("csv".parse::<SheetFormat>().unwrap(), SheetFormat::Csv);
        assert!("ods".parse::<SheetFormat>().is_err());
    }

    #[test]
    fn test_csv_sink_respects_cap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = SpreadsheetSink::open(&path, &csv_config(), "op1").unwrap();
        sink.write_header(&header()).unwrap();

        assert_eq!(sink.write_batch(&rows(10), 25).unwrap(), 10);
        assert_eq!(sink.write_batch(&rows(10), 15).unwrap(), 10);
        assert_eq!(sink.write_batch(&rows(10), 5).unwrap(), 5);
        assert_eq!(sink.write_batch(&rows(10), 0).unwrap(), 0);
        assert_eq!(sink.rows_written(), 25);

        let staging = sink.staging_path().to_path_buf();
        let published = sink.finalize().unwrap();
        assert_eq!(published, path);
        assert!(!staging.exists());

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, header());
        let records: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 25);
        assert_eq!(&records[1][2], "2024-01-02");
    }

    #[test]
    fn test_header_twice_rejected() {
        let dir = tempdir().unwrap();
        let mut sink = SpreadsheetSink::open(&dir.path().join("x.csv"), &csv_config(), "op").unwrap();
        sink.write_header(&header()).unwrap();
        assert!(sink.write_header(&header()).is_err());
    }

    #[test]
    fn test_rows_before_header_rejected() {
        let dir = tempdir().unwrap();
        let mut sink = SpreadsheetSink::open(&dir.path().join("x.csv"), &csv_config(), "op").unwrap();
        assert!(sink.write_batch(&rows(1), 10).is_err());
    }

    #[test]
    fn test_abort_deletes_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.csv");
        let mut sink = SpreadsheetSink::open(&path, &csv_config(), "op").unwrap();
        sink.write_header(&header()).unwrap();
        sink.write_batch(&rows(100), 100).unwrap();
        let staging = sink.staging_path().to_path_buf();
        assert!(staging.exists());

        sink.abort().unwrap();
        assert!(!staging.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_without_finalize_cleans_up() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dropped.csv");
        let staging = {
            let mut sink = SpreadsheetSink::open(&path, &csv_config(), "op").unwrap();
            sink.write_header(&header()).unwrap();
            sink.staging_path().to_path_buf()
        };
        assert!(!staging.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_xlsx_sink_publishes_workbook() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("report.xlsx");
        let mut sink = SpreadsheetSink::open(&path, &FormatConfig::default(), "op").unwrap();
        sink.write_header(&header()).unwrap();
        sink.write_batch(&rows(50), 1_048_576).unwrap();
        sink.finalize().unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_xlsx_rolls_over_to_new_sheet() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rollover.xlsx");
        let staging = dir.path().join("rollover.xlsx.op.part");
        let mut writer = XlsxSheetWriter::create(&staging, "Export")
            .unwrap()
            .with_rows_per_sheet(4);
        writer.write_header(&header()).unwrap();
        for row in rows(7) {
            writer.write_row(&row).unwrap();
        }
        // 3 data rows per sheet plus a header each
        assert_eq!(writer.sheet_count(), 3);

        let sink = SpreadsheetSink::with_writer(&path, staging, Box::new(writer), &FormatConfig::default());
        sink.finalize().unwrap();
        assert!(path.exists());
    }

    fn has_worksheet(path: &Path, n: usize) -> bool {
        let name = format!("xl/worksheets/sheet{}.xml", n);
        let bytes = fs::read(path).unwrap();
        bytes.windows(name.len()).any(|w| w == name.as_bytes())
    }

    #[test]
    fn test_full_sheet_of_data_spills_one_row() {
        // A worksheet of 5 rows holds a header and 4 data rows, so 5 data
        // rows leave exactly one on a second worksheet
        let config = FormatConfig {
            rows_per_sheet: 5,
            ..FormatConfig::default()
        };
        let dir = tempdir().unwrap();

        let fits = dir.path().join("fits.xlsx");
        let mut sink = SpreadsheetSink::open(&fits, &config, "op").unwrap();
        sink.write_header(&header()).unwrap();
        sink.write_batch(&rows(4), 5).unwrap();
        sink.finalize().unwrap();
        assert!(has_worksheet(&fits, 1));
        assert!(!has_worksheet(&fits, 2));

        let spills = dir.path().join("spills.xlsx");
        let mut sink = SpreadsheetSink::open(&spills, &config, "op").unwrap();
        sink.write_header(&header()).unwrap();
        assert_eq!(sink.write_batch(&rows(5), 5).unwrap(), 5);
        sink.finalize().unwrap();
        assert!(has_worksheet(&spills, 2));
        assert!(!has_worksheet(&spills, 3));
    }

    #[test]
    fn test_sheet_name_sanitized() {
        assert_eq!(sheet_name("Q1/Q2 [draft]"), "Q1Q2 draft");
        assert_eq!(sheet_name("***"), "Export");
        assert!(sheet_name(&"x".repeat(40)).chars().count() <= 24);
    }
}
