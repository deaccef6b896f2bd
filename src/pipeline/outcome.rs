//! Results returned to the surrounding HTTP/CLI layer

use crate::db::Row;
use crate::limit::LimitDecision;
use crate::operation::OperationId;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub operation_id: OperationId,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Size of the whole result, not just the sample
    pub total_records: u64,
    pub used_cache: bool,
}

/// With the default xlsx layout a worksheet holds the header plus
/// 1,048,575 data rows. A run that writes the full 1,048,576-row cap therefore
/// puts its last row on a second worksheet, which repeats the header.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerateOutcome {
    Generated {
        operation_id: OperationId,
        file_path: PathBuf,
        rows_written: u64,
        total_records: u64,
        /// Rows were dropped at the cap because the client forced continuation
        truncated: bool,
        used_cache: bool,
    },
    /// Not an error: the result is over the cap and the operation is paused
    /// until the client resubmits with `force_continue`
    AwaitingConfirmation {
        operation_id: OperationId,
        decision: LimitDecision,
    },
}

impl GenerateOutcome {
    pub fn operation_id(&self) -> OperationId {
        match self {
            GenerateOutcome::Generated { operation_id, .. } => *operation_id,
            GenerateOutcome::AwaitingConfirmation { operation_id, .. } => *operation_id,
        }
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        matches!(self, GenerateOutcome::AwaitingConfirmation { .. })
    }
}
