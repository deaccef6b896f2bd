//! In-memory database adapter
//!
//! Procedures are plain closures that produce a `MemoryView`; the view is
//! stored under the call's target name exactly like a server-side temp table.
//! Views can hold rows or generate them on demand, so multi-million row
//! exports can be exercised without holding the rows in memory.

use crate::db::{
    CellValue, Connection, ConnectionProvider, Credentials, CursorFetcher, ParamValue,
    ProcedureCall, ProcedureRunner, Row, RowCursor,
};
use crate::error::{ExportError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type ProcedureFn = dyn Fn(&[ParamValue]) -> Result<MemoryView> + Send + Sync;
type RowGenerator = dyn Fn(u64) -> Row + Send + Sync;
type FetchHook = dyn Fn(u64) + Send + Sync;

#[derive(Clone)]
enum ViewSource {
    Rows(Arc<Vec<Row>>),
    Generated(Arc<RowGenerator>),
}

/// A materialized result set
#[derive(Clone)]
pub struct MemoryView {
    columns: Vec<String>,
    len: u64,
    source: ViewSource,
}

impl MemoryView {
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            len: rows.len() as u64,
            source: ViewSource::Rows(Arc::new(rows)),
        }
    }

    /// A view of `len` rows where row `i` is produced by `generate(i)`
    pub fn generated<F>(columns: Vec<String>, len: u64, generate: F) -> Self
    where
        F: Fn(u64) -> Row + Send + Sync + 'static,
    {
        Self {
            columns,
            len,
            source: ViewSource::Generated(Arc::new(generate)),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    fn row(&self, idx: u64) -> Row {
        match &self.source {
            ViewSource::Rows(rows) => rows[idx as usize].clone(),
            ViewSource::Generated(generate) => generate(idx),
        }
    }
}

#[derive(Default)]
struct Shared {
    views: Mutex<HashMap<String, MemoryView>>,
    procedures: Mutex<HashMap<String, Arc<ProcedureFn>>>,
    calls: Mutex<HashMap<String, usize>>,
    fetch_hook: Mutex<Option<Arc<FetchHook>>>,
    open_connections: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Cheaply cloneable handle; clones share the same tables
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_view(&self, name: &str, view: MemoryView) {
        lock(&self.shared.views).insert(name.to_string(), view);
    }

    pub fn remove_view(&self, name: &str) -> bool {
        lock(&self.shared.views).remove(name).is_some()
    }

    pub fn has_view(&self, name: &str) -> bool {
        lock(&self.shared.views).contains_key(name)
    }

    pub fn register_procedure<F>(&self, name: &str, procedure: F)
    where
        F: Fn(&[ParamValue]) -> Result<MemoryView> + Send + Sync + 'static,
    {
        lock(&self.shared.procedures).insert(name.to_string(), Arc::new(procedure));
    }

    /// How many times `name` has been invoked, successful or not
    pub fn procedure_calls(&self, name: &str) -> usize {
        lock(&self.shared.calls).get(name).copied().unwrap_or(0)
    }

    /// Called after every fetch with the number of rows fetched so far
    pub fn set_fetch_hook<F>(&self, hook: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        *lock(&self.shared.fetch_hook) = Some(Arc::new(hook));
    }

    /// Connections opened and not yet closed
    pub fn open_connections(&self) -> usize {
        self.shared.open_connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryDatabase {
    async fn open(&self, credentials: &Credentials) -> Result<Box<dyn Connection>> {
        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        debug!("Opened in-memory session for user {:?}", credentials.user);
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl ProcedureRunner for MemoryConnection {
    async fn run_procedure(&mut self, call: &ProcedureCall) -> Result<u64> {
        *lock(&self.shared.calls).entry(call.procedure.clone()).or_insert(0) += 1;

        let procedure = lock(&self.shared.procedures)
            .get(&call.procedure)
            .cloned()
            .ok_or_else(|| {
                ExportError::upstream(
                    format!("procedure {}", call.procedure),
                    "procedure does not exist",
                )
            })?;

        let view = procedure(&call.params)?;
        let rows = view.len();
        lock(&self.shared.views).insert(call.target_view.clone(), view);
        Ok(rows)
    }
}

#[async_trait]
impl CursorFetcher for MemoryConnection {
    async fn query<'c>(&'c mut self, sql: &str) -> Result<Box<dyn RowCursor + 'c>> {
        let view_name = parse_select_all(sql)
            .ok_or_else(|| ExportError::upstream("query", format!("unsupported sql: {}", sql)))?;
        let view = lock(&self.shared.views)
            .get(view_name)
            .cloned()
            .ok_or_else(|| {
                ExportError::upstream("query", format!("relation {} does not exist", view_name))
            })?;
        let hook = lock(&self.shared.fetch_hook).clone();

        Ok(Box::new(MemoryCursor {
            columns: view.columns.clone(),
            view,
            position: 0,
            hook,
        }))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn view_row_count(&mut self, view: &str) -> Result<Option<u64>> {
        Ok(lock(&self.shared.views).get(view).map(|v| v.len()))
    }

    async fn drop_view(&mut self, view: &str) -> Result<()> {
        lock(&self.shared.views).remove(view);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn parse_select_all(sql: &str) -> Option<&str> {
    let rest = sql.trim().strip_prefix("SELECT * FROM ")?;
    let name = rest.trim().trim_end_matches(';').trim();
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}

struct MemoryCursor {
    columns: Vec<String>,
    view: MemoryView,
    position: u64,
    hook: Option<Arc<FetchHook>>,
}

#[async_trait]
impl RowCursor for MemoryCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn fetch_many(&mut self, n: usize) -> Result<Vec<Row>> {
        let end = (self.position + n as u64).min(self.view.len());
        let rows: Vec<Row> = (self.position..end).map(|i| self.view.row(i)).collect();
        self.position = end;
        if let Some(hook) = &self.hook {
            hook(self.position);
        }
        // Yield so cancellation from other tasks can interleave with large exports
        tokio::task::yield_now().await;
        Ok(rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Convenience for building numbered test rows: `[id, "name-{id}"]`
pub fn numbered_row(idx: u64) -> Row {
    vec![
        CellValue::Int(idx as i64 + 1),
        CellValue::Text(format!("name-{}", idx + 1)),
    ]
}
