//! XLSX backend
//!
//! Worksheets are created in constant-memory mode, so rows are flushed to a
//! temp file as they are written and must arrive in increasing order. When a
//! worksheet fills up, writing continues on a new one with its own header.

use crate::config::SHEET_ROW_CAPACITY;
use crate::db::CellValue;
use crate::error::{ExportError, Result};
use crate::sink::cell::CellKind;
use crate::sink::SheetWriter;
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Excel's limit on characters in one cell
const MAX_CELL_CHARS: usize = 32_767;

/// Excel's limit on columns in one worksheet
const MAX_COLUMNS: usize = 16_384;

struct CellFormats {
    header: Format,
    integer: Format,
    decimal: Format,
    date: Format,
    datetime: Format,
}

impl CellFormats {
    fn new() -> Self {
        let numbered = |kind: CellKind| Format::new().set_num_format(kind.num_format().unwrap_or("General"));
        Self {
            header: Format::new().set_bold(),
            integer: numbered(CellKind::Integer),
            decimal: numbered(CellKind::Decimal),
            date: numbered(CellKind::Date),
            datetime: numbered(CellKind::DateTime),
        }
    }
}

pub struct XlsxSheetWriter {
    workbook: Workbook,
    path: PathBuf,
    sheet_name: String,
    header: Vec<String>,
    formats: CellFormats,
    /// Index of the worksheet currently receiving rows
    sheet: usize,
    /// Next row to write on that worksheet (0 is the header)
    next_row: u32,
    rows_per_sheet: u32,
}

impl XlsxSheetWriter {
    pub fn create(path: &Path, sheet_name: &str) -> Result<Self> {
        let mut workbook = Workbook::new();
        workbook
            .add_worksheet_with_constant_memory()
            .set_name(sheet_name)?;
        Ok(Self {
            workbook,
            path: path.to_path_buf(),
            sheet_name: sheet_name.to_string(),
            header: Vec::new(),
            formats: CellFormats::new(),
            sheet: 0,
            next_row: 0,
            rows_per_sheet: SHEET_ROW_CAPACITY as u32,
        })
    }

    /// Override the rows (header included) each worksheet holds
    pub fn with_rows_per_sheet(mut self, rows: u32) -> Self {
        self.rows_per_sheet = rows.clamp(2, SHEET_ROW_CAPACITY as u32);
        self
    }

    pub fn sheet_count(&self) -> usize {
        self.sheet + 1
    }

    fn write_header_row(&mut self) -> Result<()> {
        let worksheet = self.workbook.worksheet_from_index(self.sheet)?;
        for (col, name) in self.header.iter().enumerate() {
            worksheet.write_string_with_format(0, col as u16, name, &self.formats.header)?;
        }
        worksheet.set_freeze_panes(1, 0)?;
        self.next_row = 1;
        Ok(())
    }

    fn start_next_sheet(&mut self) -> Result<()> {
        self.sheet += 1;
        let name = format!("{} ({})", self.sheet_name, self.sheet + 1);
        self.workbook
            .add_worksheet_with_constant_memory()
            .set_name(&name)?;
        debug!("Worksheet full, continuing on {:?}", name);
        self.write_header_row()
    }
}

impl SheetWriter for XlsxSheetWriter {
    fn write_header(&mut self, columns: &[String]) -> Result<()> {
        if columns.len() > MAX_COLUMNS {
            return Err(ExportError::Sheet(format!(
                "{} columns exceed the worksheet limit of {}",
                columns.len(),
                MAX_COLUMNS
            )));
        }
        self.header = columns.to_vec();
        self.write_header_row()
    }

    fn write_row(&mut self, row: &[CellValue]) -> Result<()> {
        if self.next_row >= self.rows_per_sheet {
            self.start_next_sheet()?;
        }
        let row_num = self.next_row;
        let worksheet = self.workbook.worksheet_from_index(self.sheet)?;
        for (col, value) in row.iter().enumerate().take(MAX_COLUMNS) {
            write_cell(worksheet, row_num, col as u16, value, &self.formats)?;
        }
        self.next_row += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>, widths: &[f64]) -> Result<()> {
        for index in 0..=self.sheet {
            let worksheet = self.workbook.worksheet_from_index(index)?;
            for (col, width) in widths.iter().enumerate().take(MAX_COLUMNS) {
                worksheet.set_column_width(col as u16, *width)?;
            }
        }
        self.workbook.save(&self.path)?;
        Ok(())
    }
}

fn write_cell(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &CellValue,
    formats: &CellFormats,
) -> Result<()> {
    match (CellKind::of(value), value) {
        (CellKind::Blank, _) => {}
        (CellKind::Boolean, CellValue::Bool(b)) => {
            worksheet.write_boolean(row, col, *b)?;
        }
        (CellKind::Integer, CellValue::Int(i)) => {
            worksheet.write_number_with_format(row, col, *i as f64, &formats.integer)?;
        }
        (CellKind::Decimal, CellValue::Float(f)) => {
            worksheet.write_number_with_format(row, col, *f, &formats.decimal)?;
        }
        (CellKind::Date, CellValue::Date(d)) => {
            worksheet.write_datetime_with_format(row, col, d, &formats.date)?;
        }
        (CellKind::DateTime, CellValue::DateTime(dt)) => {
            worksheet.write_datetime_with_format(row, col, dt, &formats.datetime)?;
        }
        (_, other) => {
            let text = other.display_text();
            let text = match text.char_indices().nth(MAX_CELL_CHARS) {
                Some((cut, _)) => &text[..cut],
                None => text.as_str(),
            };
            worksheet.write_string(row, col, text)?;
        }
    }
    Ok(())
}
