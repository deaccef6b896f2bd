//! CSV backend

use crate::db::CellValue;
use crate::error::Result;
use crate::sink::SheetWriter;
use std::fs::File;
use std::path::Path;

pub struct CsvSheetWriter {
    writer: csv::Writer<File>,
    record: Vec<String>,
}

impl CsvSheetWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        Ok(Self {
            writer,
            record: Vec::new(),
        })
    }
}

impl SheetWriter for CsvSheetWriter {
    fn write_header(&mut self, columns: &[String]) -> Result<()> {
        self.writer.write_record(columns)?;
        Ok(())
    }

    fn write_row(&mut self, row: &[CellValue]) -> Result<()> {
        self.record.clear();
        self.record.extend(row.iter().map(|value| match value {
            CellValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
            other => other.display_text(),
        }));
        self.writer.write_record(&self.record)?;
        Ok(())
    }

    /// CSV has no column widths; the hints are ignored
    fn finish(mut self: Box<Self>, _widths: &[f64]) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
