//! Export request model
//!
//! A request splits into the part that identifies the materialized result
//! (`ProcedureParams`, the cache key) and the part that only concerns this
//! particular call (credentials, continuation flags, operation id).

use crate::db::{Credentials, ParamValue, ProcedureCall};
use crate::error::{ExportError, Result};
use crate::operation::OperationId;
use crate::sink::SheetFormat;
use chrono::NaiveDate;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use uuid::Uuid;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
            .expect("identifier pattern is valid")
    })
}

fn month_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d{4})-(\d{2})$").expect("month pattern is valid"))
}

/// Accept `name` or `schema.name` SQL identifiers only
pub fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(ExportError::InvalidRequest(format!(
            "{} {:?} is not a valid identifier",
            kind, name
        )))
    }
}

/// Inclusive `YYYY-MM` month range the export covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonthRange {
    pub from: String,
    pub to: String,
}

impl MonthRange {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Result<Self> {
        let range = Self {
            from: from.into(),
            to: to.into(),
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        let from = parse_month(&self.from)?;
        let to = parse_month(&self.to)?;
        if from > to {
            return Err(ExportError::InvalidRequest(format!(
                "month range {}..{} is reversed",
                self.from, self.to
            )));
        }
        Ok(())
    }

    /// First day of `from` and first day of `to`, passed to procedures as dates
    pub fn bounds(&self) -> Result<(NaiveDate, NaiveDate)> {
        Ok((parse_month(&self.from)?, parse_month(&self.to)?))
    }

    /// Token used in output file names, e.g. `202401_202403`
    pub fn token(&self) -> String {
        format!("{}_{}", self.from.replace('-', ""), self.to.replace('-', ""))
    }
}

fn parse_month(raw: &str) -> Result<NaiveDate> {
    let bad = || ExportError::InvalidRequest(format!("{:?} is not a YYYY-MM month", raw));
    let caps = month_pattern().captures(raw).ok_or_else(bad)?;
    let year: i32 = caps[1].parse().map_err(|_| bad())?;
    let month: u32 = caps[2].parse().map_err(|_| bad())?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(bad)
}

/// The filter parameters that produce one materialized result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureParams {
    /// Ordered as the procedure expects them
    pub filters: Vec<(String, ParamValue)>,
    pub month_range: MonthRange,
}

impl ProcedureParams {
    /// Stable text form of the parameters, independent of any credentials.
    /// Names and values are length-prefixed and values carry their type, so
    /// no two distinct parameter sets share an encoding.
    pub fn canonical(&self) -> String {
        let filters = self
            .filters
            .iter()
            .map(|(name, value)| {
                let text = value.to_string();
                format!("{}:{}={}{}:{}", name.len(), name, value.type_tag(), text.len(), text)
            })
            .join("&");
        format!("{}..{}|{}", self.month_range.from, self.month_range.to, filters)
    }

    /// First 12 hex characters of a name-based UUID over `canonical()`
    pub fn digest(&self) -> String {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.canonical().as_bytes());
        id.simple().to_string()[..12].to_string()
    }

    /// Ordered procedure arguments: month bounds first, then the filters
    pub fn procedure_args(&self) -> Result<Vec<ParamValue>> {
        let (from, to) = self.month_range.bounds()?;
        let mut args = vec![ParamValue::Date(from), ParamValue::Date(to)];
        args.extend(self.filters.iter().map(|(_, v)| v.clone()));
        Ok(args)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRequest {
    /// Materialized view the procedure fills
    pub view: String,
    pub procedure: String,
    pub params: ProcedureParams,
    #[serde(default)]
    pub credentials: Credentials,
    /// Truncate at the row cap instead of asking for confirmation
    #[serde(default)]
    pub force_continue: bool,
    /// Caller-requested cap, never above the configured one
    #[serde(default)]
    pub max_rows_override: Option<u64>,
    /// Continue an operation paused for confirmation, or track under a pre-registered id
    #[serde(default)]
    pub operation_id: Option<OperationId>,
}

impl ExportRequest {
    pub fn new(view: impl Into<String>, procedure: impl Into<String>, params: ProcedureParams) -> Self {
        Self {
            view: view.into(),
            procedure: procedure.into(),
            params,
            credentials: Credentials::default(),
            force_continue: false,
            max_rows_override: None,
            operation_id: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier("view", &self.view)?;
        validate_identifier("procedure", &self.procedure)?;
        for (name, _) in &self.params.filters {
            validate_identifier("filter", name)?;
        }
        self.params.month_range.validate()?;
        if self.max_rows_override == Some(0) {
            return Err(ExportError::InvalidRequest(
                "max_rows_override must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parameters that identify the cached result; credentials and the
    /// operation id are never part of it
    pub fn snapshot(&self) -> ProcedureParams {
        self.params.clone()
    }

    pub fn procedure_call(&self) -> Result<ProcedureCall> {
        Ok(ProcedureCall {
            procedure: self.procedure.clone(),
            params: self.params.procedure_args()?,
            target_view: self.view.clone(),
        })
    }

    /// `{dir}/{view}_{from}_{to}_{digest}.{ext}`
    pub fn output_path(&self, dir: &Path, format: SheetFormat) -> PathBuf {
        let stem = self.view.replace('.', "_");
        dir.join(format!(
            "{}_{}_{}.{}",
            stem,
            self.params.month_range.token(),
            self.params.digest(),
            format.extension()
        ))
    }
}
