//! Column width hints accumulated while rows stream through the sink

use crate::db::CellValue;
use crate::sink::cell::CellKind;

/// Excel's widest allowed column
pub const MAX_SHEET_COLUMN_WIDTH: usize = 255;

const PADDING: usize = 2;

#[derive(Debug, Clone)]
pub struct ColumnWidthTracker {
    header: Vec<usize>,
    observed: Vec<usize>,
    sampled: usize,
    sample_limit: usize,
    max_width: usize,
}

impl ColumnWidthTracker {
    pub fn new(sample_limit: usize, max_width: usize) -> Self {
        Self {
            header: Vec::new(),
            observed: Vec::new(),
            sampled: 0,
            sample_limit,
            max_width: max_width.clamp(1, MAX_SHEET_COLUMN_WIDTH),
        }
    }

    pub fn observe_header(&mut self, columns: &[String]) {
        self.header = columns.iter().map(|c| c.chars().count()).collect();
        self.observed.resize(self.header.len(), 0);
    }

    /// Only the first `sample_limit` rows contribute
    pub fn observe_row(&mut self, row: &[CellValue]) {
        if self.sampled >= self.sample_limit {
            return;
        }
        if self.observed.len() < row.len() {
            self.observed.resize(row.len(), 0);
        }
        for (slot, value) in self.observed.iter_mut().zip(row) {
            *slot = (*slot).max(CellKind::display_width(value));
        }
        self.sampled += 1;
    }

    /// Final widths: at least the header, at least the (capped) observed
    /// content, never wider than the sheet allows
    pub fn widths(&self) -> Vec<f64> {
        let columns = self.header.len().max(self.observed.len());
        (0..columns)
            .map(|i| {
                let header = self.header.get(i).copied().unwrap_or(0);
                let content = self.observed.get(i).copied().unwrap_or(0).min(self.max_width);
                let width = (header.max(content) + PADDING).min(MAX_SHEET_COLUMN_WIDTH);
                width as f64
            })
            .collect()
    }

    pub fn sampled_rows(&self) -> usize {
        self.sampled
    }
}
