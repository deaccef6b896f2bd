//! Operation data model

use crate::error::{ExportError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Well-known metadata keys written by the pipeline
pub mod keys {
    pub const TOTAL_COUNT: &str = "totalCount";
    pub const MAX_ROWS_OVERRIDE: &str = "maxRowsOverride";
    pub const OUTPUT_FILE_PATH: &str = "outputFilePath";
    pub const AWAITING_CONFIRMATION: &str = "awaitingConfirmation";
    pub const USED_CACHE: &str = "usedCache";
    pub const ERROR: &str = "error";
}

/// Opaque operation token, minted by the registry and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|e| ExportError::InvalidRequest(format!("bad operation id {:?}: {}", raw, e)))
    }

    /// Short form used in staging file names
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..12].to_string()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    Running,
    Completed,
    Cancelled,
    /// Derived: a Running operation paused until the client confirms a capped export
    LimitExceeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Cancelled | OperationStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    /// 0-100, always derived from `current` and `total` together
    pub percentage: u8,
}

impl Progress {
    pub fn new(current: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            let pct = (current as u128 * 100) / total as u128;
            pct.min(100) as u8
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// One client-initiated job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub status: OperationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Operation {
    pub(crate) fn running(id: OperationId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: OperationStatus::Running,
            started_at: now,
            ended_at: None,
            progress: Progress::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_awaiting_confirmation(&self) -> bool {
        self.metadata
            .get(keys::AWAITING_CONFIRMATION)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Status as shown to clients; the stored status never holds `LimitExceeded`
    pub fn reported_status(&self) -> OperationStatus {
        if self.status == OperationStatus::Running && self.is_awaiting_confirmation() {
            OperationStatus::LimitExceeded
        } else {
            self.status
        }
    }
}

/// Client-facing progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub current: u64,
    pub total: u64,
    pub percentage: u8,
}

impl From<&Operation> for ProgressReport {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id,
            status: op.reported_status(),
            current: op.progress.current,
            total: op.progress.total,
            percentage: op.progress.percentage,
        }
    }
}
