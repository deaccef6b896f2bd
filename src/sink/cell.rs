//! Cell classification
//!
//! Every value is dispatched through this fixed table to pick how it is
//! written and which number format it carries.

use crate::db::CellValue;

/// Largest integer an IEEE double represents exactly; bigger values are
/// written as text so no digits are lost
pub const MAX_EXACT_INTEGER: i64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellKind {
    Blank,
    Boolean,
    Integer,
    Decimal,
    Date,
    DateTime,
    Text,
}

impl CellKind {
    pub fn of(value: &CellValue) -> Self {
        match value {
            CellValue::Null => CellKind::Blank,
            CellValue::Bool(_) => CellKind::Boolean,
            CellValue::Int(i) if i.unsigned_abs() <= MAX_EXACT_INTEGER as u64 => CellKind::Integer,
            CellValue::Int(_) => CellKind::Text,
            CellValue::Float(f) if f.is_finite() => CellKind::Decimal,
            CellValue::Float(_) => CellKind::Text,
            CellValue::Date(_) => CellKind::Date,
            CellValue::DateTime(_) => CellKind::DateTime,
            CellValue::Text(_) => CellKind::Text,
        }
    }

    /// Excel number format for the kind, if it has one
    pub fn num_format(&self) -> Option<&'static str> {
        match self {
            CellKind::Integer => Some("0"),
            CellKind::Decimal => Some("#,##0.00"),
            CellKind::Date => Some("yyyy-mm-dd"),
            CellKind::DateTime => Some("yyyy-mm-dd hh:mm:ss"),
            CellKind::Blank | CellKind::Boolean | CellKind::Text => None,
        }
    }

    /// Rendered width in characters, used for column sizing
    pub fn display_width(value: &CellValue) -> usize {
        match CellKind::of(value) {
            CellKind::Blank => 0,
            CellKind::Date => 10,
            CellKind::DateTime => 19,
            CellKind::Decimal => match value {
                // thousands separators plus two decimals
                CellValue::Float(f) => {
                    let digits = format!("{:.2}", f.abs()).len();
                    let int_digits = digits.saturating_sub(3);
                    digits + int_digits.saturating_sub(1) / 3 + usize::from(*f < 0.0)
                }
                _ => 0,
            },
            _ => value.display_text().chars().count(),
        }
    }
}
