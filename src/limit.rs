//! Row Limit Gate
//!
//! Decides whether a result set fits the output's row capacity. Pure: it
//! never touches the registry, the cache or any I/O.

use serde::{Deserialize, Serialize};

/// Outcome of checking a row count against the cap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
    /// Generation must pause for client confirmation
    pub exceeds: bool,
    /// Rows the pipeline will write (the true size while awaiting confirmation)
    pub effective_row_cap: u64,
    pub advisory: String,
}

pub struct RowLimitGate;

impl RowLimitGate {
    pub fn evaluate(total_rows: u64, configured_cap: u64, force_continue: bool) -> LimitDecision {
        if total_rows <= configured_cap {
            return LimitDecision {
                exceeds: false,
                effective_row_cap: total_rows,
                advisory: String::new(),
            };
        }

        let overage = total_rows - configured_cap;
        if !force_continue {
            LimitDecision {
                exceeds: true,
                effective_row_cap: total_rows,
                advisory: format!(
                    "Result has {} rows, {} over the {} row limit. Resubmit with force_continue to export the first {} rows.",
                    total_rows, overage, configured_cap, configured_cap
                ),
            }
        } else {
            LimitDecision {
                exceeds: false,
                effective_row_cap: configured_cap,
                advisory: format!(
                    "Export truncated to {} of {} rows ({} rows omitted).",
                    configured_cap, total_rows, overage
                ),
            }
        }
    }

    /// Cap for one request: the configured cap, lowered by a caller override
    pub fn request_cap(configured_cap: u64, max_rows_override: Option<u64>) -> u64 {
        match max_rows_override {
            Some(requested) if requested > 0 => requested.min(configured_cap),
            _ => configured_cap,
        }
    }
}
