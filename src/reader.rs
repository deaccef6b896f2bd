//! Chunked Reader
//!
//! Pulls rows from a forward-only cursor in bounded batches so a
//! multi-million row result never sits in memory at once. Cancellation is
//! checked before every fetch, and callers can re-check inside a batch with
//! `checked_chunks`.

use crate::db::{Row, RowCursor};
use crate::error::{ExportError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for chunked reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Rows requested per fetch
    pub batch_size: usize,

    /// Rows between cancellation checks inside one batch
    pub check_interval: usize,

    /// Stop after this many rows (None = read to the end)
    pub max_rows: Option<u64>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            batch_size: 50_000,
            check_interval: 5_000,
            max_rows: None,
        }
    }
}

/// An immutable slice of rows plus their column names
#[derive(Debug, Clone)]
pub struct RowBatch {
    columns: Arc<[String]>,
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(columns: Arc<[String]>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Streaming,
    Exhausted,
    Cancelled,
}

/// Forward-only batch stream over one cursor. Once a batch has been handed
/// out the cursor has moved past it; the stream cannot be rewound.
pub struct ChunkedReader<'c> {
    cursor: Box<dyn RowCursor + 'c>,
    columns: Arc<[String]>,
    config: ChunkConfig,
    cancel: CancellationToken,
    rows_read: u64,
    batches_read: usize,
    state: ReaderState,
}

impl<'c> ChunkedReader<'c> {
    pub fn new(cursor: Box<dyn RowCursor + 'c>, config: ChunkConfig, cancel: CancellationToken) -> Self {
        let columns: Arc<[String]> = cursor.columns().to_vec().into();
        Self {
            cursor,
            columns,
            config,
            cancel,
            rows_read: 0,
            batches_read: 0,
            state: ReaderState::Streaming,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Next batch, `Ok(None)` at natural end of data, or
    /// `Err(ExportError::Cancelled)` once cancellation has been observed.
    /// Cancellation is sticky: later calls keep returning it.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        match self.state {
            ReaderState::Exhausted => return Ok(None),
            ReaderState::Cancelled => return Err(ExportError::Cancelled),
            ReaderState::Streaming => {}
        }

        if self.cancel.is_cancelled() {
            debug!("Reader cancelled after {} rows", self.rows_read);
            self.state = ReaderState::Cancelled;
            return Err(ExportError::Cancelled);
        }

        let want = match self.config.max_rows {
            Some(max) => {
                let remaining = max.saturating_sub(self.rows_read);
                if remaining == 0 {
                    self.state = ReaderState::Exhausted;
                    return Ok(None);
                }
                remaining.min(self.config.batch_size as u64) as usize
            }
            None => self.config.batch_size,
        };

        let rows = self.cursor.fetch_many(want.max(1)).await?;
        if rows.is_empty() {
            self.state = ReaderState::Exhausted;
            return Ok(None);
        }

        self.rows_read += rows.len() as u64;
        self.batches_read += 1;
        Ok(Some(RowBatch::new(self.columns.clone(), rows)))
    }

    /// Walk `rows` in `check_interval` slices, yielding `Err(Cancelled)` in
    /// place of the next slice as soon as the token fires
    pub fn checked_chunks<'b>(&self, rows: &'b [Row]) -> impl Iterator<Item = Result<&'b [Row]>> + 'b {
        let cancel = self.cancel.clone();
        rows.chunks(self.config.check_interval.max(1)).map(move |chunk| {
            if cancel.is_cancelled() {
                Err(ExportError::Cancelled)
            } else {
                Ok(chunk)
            }
        })
    }

    /// Get progress information: (rows read, batches read)
    pub fn progress(&self) -> (u64, usize) {
        (self.rows_read, self.batches_read)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn close(self) -> Result<()> {
        self.cursor.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::numbered_row;
    use crate::db::{select_all_sql, ConnectionProvider, Credentials, MemoryDatabase, MemoryView};

    fn database(rows: u64) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.add_view(
            "tmp_orders",
            MemoryView::generated(vec!["id".into(), "name".into()], rows, numbered_row),
        );
        db
    }

    fn config(batch_size: usize) -> ChunkConfig {
        ChunkConfig {
            batch_size,
            check_interval: 2,
            max_rows: None,
        }
    }

    #[tokio::test]
    async fn test_reads_all_batches_in_order() {
        let db = database(10);
        let mut conn = db.open(&Credentials::default()).await.unwrap();
        let cursor = conn.query(&select_all_sql("tmp_orders")).await.unwrap();
        let mut reader = ChunkedReader::new(cursor, config(4), CancellationToken::new());

        let mut sizes = Vec::new();
        let mut first_ids = Vec::new();
        while let Some(batch) = reader.next_batch().await.unwrap() {
            sizes.push(batch.len());
            first_ids.push(batch.rows()[0][0].clone());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(first_ids[1], crate::db::CellValue::Int(5));
        assert_eq!(reader.progress(), (10, 3));
        assert!(reader.next_batch().await.unwrap().is_none());
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_is_distinct_from_end_of_data() {
        let db = database(100);
        let mut conn = db.open(&Credentials::default()).await.unwrap();
        let cursor = conn.query(&select_all_sql("tmp_orders")).await.unwrap();
        let token = CancellationToken::new();
        let mut reader = ChunkedReader::new(cursor, config(10), token.clone());

        assert!(reader.next_batch().await.unwrap().is_some());
        token.cancel();
        assert!(reader.next_batch().await.unwrap_err().is_cancelled());
        // no further batches once cancelled
        assert!(reader.next_batch().await.unwrap_err().is_cancelled());
        assert_eq!(reader.progress().0, 10);
    }

    #[tokio::test]
    async fn test_max_rows_bounds_fetch() {
        let db = database(100);
        let mut conn = db.open(&Credentials::default()).await.unwrap();
        let cursor = conn.query(&select_all_sql("tmp_orders")).await.unwrap();
        let mut reader = ChunkedReader::new(
            cursor,
            ChunkConfig {
                batch_size: 30,
                check_interval: 10,
                max_rows: Some(45),
            },
            CancellationToken::new(),
        );

        let mut total = 0;
        while let Some(batch) = reader.next_batch().await.unwrap() {
            total += batch.len();
        }
        assert_eq!(total, 45);
    }

    #[tokio::test]
    async fn test_checked_chunks_stop_on_cancel() {
        let db = database(10);
        let mut conn = db.open(&Credentials::default()).await.unwrap();
        let cursor = conn.query(&select_all_sql("tmp_orders")).await.unwrap();
        let token = CancellationToken::new();
        let mut reader = ChunkedReader::new(cursor, config(10), token.clone());
        let batch = reader.next_batch().await.unwrap().unwrap();

        let mut seen = 0;
        for chunk in reader.checked_chunks(batch.rows()) {
            match chunk {
                Ok(rows) => {
                    seen += rows.len();
                    if seen == 4 {
                        token.cancel();
                    }
                }
                Err(e) => {
                    assert!(e.is_cancelled());
                    break;
                }
            }
        }
        assert_eq!(seen, 4);
    }
}
