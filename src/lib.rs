pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod limit;
pub mod operation;
pub mod pipeline;
pub mod reader;
pub mod request;
pub mod sink;

pub use cache::{CacheEntry, Materializer, ProcedureCache, ProcedureMaterializer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ExportConfig, SHEET_ROW_CAPACITY};
pub use db::{CellValue, ConnectionProvider, Credentials, MemoryDatabase, MemoryView, ParamValue, PgConnectionProvider, Row};
pub use error::{ExportError, Result};
pub use limit::{LimitDecision, RowLimitGate};
pub use operation::{Operation, OperationId, OperationRegistry, OperationStatus, Progress, ProgressReport, ReaperHandle};
pub use pipeline::{ExportPipeline, GenerateOutcome, PreviewResult};
pub use reader::{ChunkConfig, ChunkedReader, RowBatch};
pub use request::{ExportRequest, MonthRange, ProcedureParams};
pub use sink::{FormatConfig, SheetFormat, SpreadsheetSink};
