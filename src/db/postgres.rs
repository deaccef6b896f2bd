//! Postgres adapter using sqlx
//!
//! Each `open` creates a dedicated session for the requesting credentials.
//! Queries are streamed through a server-side `NO SCROLL` cursor inside a
//! transaction. The query's shape is read from a temporary view so the cursor
//! can project every column as text, and cells are typed from that text.

use crate::db::{CellValue, Connection, ConnectionProvider, Credentials, CursorFetcher, ParamValue, ProcedureCall, ProcedureRunner, Row, RowCursor};
use crate::error::{ExportError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Postgres, Row as _, Transaction};
use std::str::FromStr;
use tracing::debug;

const CURSOR_NAME: &str = "sheet_export_cursor";
const SHAPE_VIEW: &str = "sheet_export_shape";

pub struct PgConnectionProvider {
    base: PgConnectOptions,
}

impl PgConnectionProvider {
    pub fn from_url(database_url: &str) -> Result<Self> {
        let base = PgConnectOptions::from_str(database_url)
            .map_err(|e| ExportError::Config(format!("invalid database url: {}", e)))?;
        Ok(Self { base })
    }
}

#[async_trait]
impl ConnectionProvider for PgConnectionProvider {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn Connection>> {
        let mut options = self.base.clone();
        if !credentials.user.is_empty() {
            options = options
                .username(&credentials.user)
                .password(&credentials.password);
        }
        if let Some(database) = &credentials.database {
            options = options.database(database);
        }

        let mut conn = options
            .connect()
            .await
            .map_err(|e| ExportError::upstream("connect", e))?;

        // Test the connection
        sqlx::query("SELECT 1")
            .execute(&mut conn)
            .await
            .map_err(|e| ExportError::upstream("connect", e))?;

        debug!("Opened Postgres session for user {:?}", credentials.user);
        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl ProcedureRunner for PgSession {
    async fn run_procedure(&mut self, call: &ProcedureCall) -> Result<u64> {
        let placeholders = (1..=call.params.len()).map(|i| format!("${}", i)).join(", ");
        let sql = format!("CALL {}({})", call.procedure, placeholders);

        let mut query = sqlx::query(&sql);
        for param in &call.params {
            query = match param {
                ParamValue::Null => query.bind(Option::<String>::None),
                ParamValue::Bool(b) => query.bind(*b),
                ParamValue::Int(i) => query.bind(*i),
                ParamValue::Float(f) => query.bind(*f),
                ParamValue::Date(d) => query.bind(*d),
                ParamValue::Text(s) => query.bind(s.clone()),
            };
        }
        query
            .execute(&mut self.conn)
            .await
            .map_err(|e| ExportError::upstream(format!("procedure {}", call.procedure), e))?;

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", call.target_view))
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| ExportError::upstream(format!("count {}", call.target_view), e))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl CursorFetcher for PgSession {
    async fn query<'c>(&'c mut self, sql: &str) -> Result<Box<dyn RowCursor + 'c>> {
        // Everything below runs inside `tx`; dropping it on an early return
        // rolls back the shape view and the cursor together.
        let mut tx = sqlx::Connection::begin(&mut self.conn)
            .await
            .map_err(|e| ExportError::upstream("begin cursor transaction", e))?;

        sqlx::query(&format!("CREATE TEMP VIEW {} AS {}", SHAPE_VIEW, sql))
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(|e| ExportError::upstream("describe query", e))?;

        let shape: Vec<(String, String)> = sqlx::query_as(
            "SELECT a.attname::text, upper(t.typname::text) \
             FROM pg_attribute a JOIN pg_type t ON t.oid = a.atttypid \
             WHERE a.attrelid = to_regclass($1) AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(format!("pg_temp.{}", SHAPE_VIEW))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| ExportError::upstream("describe query", e))?;
        let (columns, type_names): (Vec<String>, Vec<String>) = shape.into_iter().unzip();

        sqlx::query(&declare_cursor_sql(&columns))
            .persistent(false)
            .execute(&mut *tx)
            .await
            .map_err(|e| ExportError::upstream("declare cursor", e))?;

        Ok(Box::new(PgRowCursor {
            tx,
            columns,
            type_names,
        }))
    }
}

#[async_trait]
impl Connection for PgSession {
    async fn view_row_count(&mut self, view: &str) -> Result<Option<u64>> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(view)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| ExportError::upstream(format!("probe {}", view), e))?;
        if !exists {
            return Ok(None);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", view))
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| ExportError::upstream(format!("count {}", view), e))?;
        Ok(Some(count.max(0) as u64))
    }

    async fn drop_view(&mut self, view: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", view))
            .persistent(false)
            .execute(&mut self.conn)
            .await
            .map_err(|e| ExportError::Cleanup(format!("drop {}: {}", view, e)))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        sqlx::Connection::close(self.conn)
            .await
            .map_err(|e| ExportError::Cleanup(format!("close connection: {}", e)))
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Cursor over the shape view with every column cast to text
fn declare_cursor_sql(columns: &[String]) -> String {
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| format!("{}::text", quote_identifier(c)))
            .join(", ")
    };
    format!(
        "DECLARE {} NO SCROLL CURSOR FOR SELECT {} FROM {}",
        CURSOR_NAME, projection, SHAPE_VIEW
    )
}

struct PgRowCursor<'c> {
    tx: Transaction<'c, Postgres>,
    columns: Vec<String>,
    type_names: Vec<String>,
}

impl PgRowCursor<'_> {
    fn decode_row(&self, row: &PgRow) -> Result<Row> {
        let mut cells = Vec::with_capacity(self.type_names.len());
        for (idx, type_name) in self.type_names.iter().enumerate() {
            let text: Option<String> = row.try_get(idx)?;
            cells.push(match text {
                Some(text) => cell_from_text(type_name, &text),
                None => CellValue::Null,
            });
        }
        Ok(cells)
    }
}

#[async_trait]
impl<'c> RowCursor for PgRowCursor<'c> {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let sql = format!("FETCH FORWARD {} FROM {}", n.max(1), CURSOR_NAME);
        let rows = sqlx::query(&sql)
            .persistent(false)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| ExportError::upstream("fetch", e))?;
        rows.iter().map(|row| self.decode_row(row)).collect()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PgRowCursor { mut tx, .. } = *self;
        for sql in [
            format!("CLOSE {}", CURSOR_NAME),
            format!("DROP VIEW {}", SHAPE_VIEW),
        ] {
            sqlx::query(&sql)
                .persistent(false)
                .execute(&mut *tx)
                .await
                .map_err(|e| ExportError::Cleanup(format!("close cursor: {}", e)))?;
        }
        tx.commit()
            .await
            .map_err(|e| ExportError::Cleanup(format!("close cursor: {}", e)))
    }
}

/// Convert a text-protocol value into a typed cell; unparseable values stay text
fn cell_from_text(type_name: &str, text: &str) -> CellValue {
    let parsed = match type_name {
        "BOOL" => match text {
            "t" | "true" => Some(CellValue::Bool(true)),
            "f" | "false" => Some(CellValue::Bool(false)),
            _ => None,
        },
        "INT2" | "INT4" | "INT8" | "OID" => text.parse().ok().map(CellValue::Int),
        "FLOAT4" | "FLOAT8" | "NUMERIC" | "MONEY" => text
            .trim_start_matches('$')
            .replace(',', "")
            .parse()
            .ok()
            .map(CellValue::Float),
        "DATE" => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(CellValue::Date),
        "TIMESTAMP" => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(CellValue::DateTime),
        "TIMESTAMPTZ" => DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
            .ok()
            .map(|dt| CellValue::DateTime(dt.naive_utc())),
        _ => None,
    };
    parsed.unwrap_or_else(|| CellValue::Text(text.to_string()))
}
