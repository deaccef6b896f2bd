//! Database boundary
//!
//! The pipeline only talks to the database through the narrow traits below:
//! a connection provider, a procedure runner and a cursor fetcher. Two
//! adapters ship with the crate: Postgres (sqlx) and an in-memory database
//! used for tests and demos.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryDatabase, MemoryView};
pub use postgres::PgConnectionProvider;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One cell of a fetched row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    /// Rendered text, used for width hints and text-only formats
    pub fn display_text(&self) -> String {
        match self {
            CellValue::Null => String::new(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            CellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<i64> for CellValue {
    fn from(i: i64) -> Self {
        CellValue::Int(i)
    }
}

impl From<f64> for CellValue {
    fn from(f: f64) -> Self {
        CellValue::Float(f)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(d: NaiveDate) -> Self {
        CellValue::Date(d)
    }
}

pub type Row = Vec<CellValue>;

/// A procedure argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Date(NaiveDate),
    Text(String),
}

impl ParamValue {
    /// Short type tag, so `Int(5)` and `Text("5")` never share a key
    pub fn type_tag(&self) -> &'static str {
        match self {
            ParamValue::Null => "n",
            ParamValue::Bool(_) => "b",
            ParamValue::Int(_) => "i",
            ParamValue::Float(_) => "f",
            ParamValue::Date(_) => "d",
            ParamValue::Text(_) => "t",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Null => write!(f, "null"),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Login used to open a connection; never part of a cache key
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            database: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

/// A stored-procedure invocation that materializes `target_view`
#[derive(Debug, Clone)]
pub struct ProcedureCall {
    pub procedure: String,
    pub params: Vec<ParamValue>,
    pub target_view: String,
}

#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait ProcedureRunner: Send {
    /// Run the procedure and return the row count of the materialized view
    async fn run_procedure(&mut self, call: &ProcedureCall) -> Result<u64>;
}

#[async_trait]
pub trait CursorFetcher: Send {
    async fn query<'c>(&'c mut self, sql: &str) -> Result<Box<dyn RowCursor + 'c>>;
}

/// Forward-only cursor; every fetch advances it irreversibly
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[String];

    /// Up to `n` rows; an empty vec means the cursor is exhausted
    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// An exclusively owned database session
#[async_trait]
pub trait Connection: ProcedureRunner + CursorFetcher {
    /// Row count of a materialized view, or None when it no longer exists
    async fn view_row_count(&mut self, view: &str) -> Result<Option<u64>>;

    /// Remove a (possibly partial) materialized view
    async fn drop_view(&mut self, view: &str) -> Result<()>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Query used to stream a materialized view
pub fn select_all_sql(view: &str) -> String {
    format!("SELECT * FROM {}", view)
}
