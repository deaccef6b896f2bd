//! Procedure Result Cache
//!
//! Remembers which parameters produced the current contents of each
//! materialized view so an expensive procedure is only re-run when the
//! filters change, the entry ages out, or the view has disappeared.

use crate::clock::Clock;
use crate::db::{Connection, ProcedureCall};
use crate::error::Result;
use crate::request::ProcedureParams;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub view_name: String,
    pub params_snapshot: ProcedureParams,
    pub captured_at: DateTime<Utc>,
    pub row_count: u64,
}

/// The work the cache guards: probing for and (re)building a materialized view
#[async_trait]
pub trait Materializer: Send {
    /// Row count of the view if it still exists
    async fn probe(&mut self, view: &str) -> Result<Option<u64>>;

    /// Run the procedure; returns the resulting row count
    async fn materialize(&mut self) -> Result<u64>;
}

/// Runs a stored procedure on an exclusively held connection
pub struct ProcedureMaterializer<'a> {
    conn: &'a mut dyn Connection,
    call: &'a ProcedureCall,
}

impl<'a> ProcedureMaterializer<'a> {
    pub fn new(conn: &'a mut dyn Connection, call: &'a ProcedureCall) -> Self {
        Self { conn, call }
    }
}

#[async_trait]
impl<'a> Materializer for ProcedureMaterializer<'a> {
    async fn probe(&mut self, view: &str) -> Result<Option<u64>> {
        self.conn.view_row_count(view).await
    }

    async fn materialize(&mut self) -> Result<u64> {
        self.conn.run_procedure(self.call).await
    }
}

enum Staleness {
    ParamsChanged,
    Expired,
    Missing,
}

type Slot = Arc<Mutex<Option<CacheEntry>>>;

pub struct ProcedureCache {
    slots: DashMap<String, Slot>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl ProcedureCache {
    pub fn new(ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            ttl,
            clock,
        }
    }

    fn slot(&self, view: &str) -> Slot {
        self.slots
            .entry(view.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }

    /// Return `(row_count, used_cache)`, running `runner.materialize()` only
    /// when the cached entry for `view` is missing or stale.
    ///
    /// Callers for the same view are serialized; other views proceed
    /// independently. A failed run leaves the previous entry untouched.
    pub async fn execute(
        &self,
        view: &str,
        params: &ProcedureParams,
        runner: &mut dyn Materializer,
    ) -> Result<(u64, bool)> {
        let slot = self.slot(view);
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            match self.staleness(entry, params, runner).await {
                None => {
                    info!("Cache hit for {} ({} rows)", view, entry.row_count);
                    return Ok((entry.row_count, true));
                }
                Some(Staleness::ParamsChanged) => debug!("Cache miss for {}: parameters changed", view),
                Some(Staleness::Expired) => debug!("Cache miss for {}: entry expired", view),
                Some(Staleness::Missing) => debug!("Cache miss for {}: view no longer exists", view),
            }
        } else {
            debug!("Cache miss for {}: no entry", view);
        }

        let row_count = runner.materialize().await?;
        *guard = Some(CacheEntry {
            view_name: view.to_string(),
            params_snapshot: params.clone(),
            captured_at: self.clock.now(),
            row_count,
        });
        info!("Materialized {} with {} rows", view, row_count);
        Ok((row_count, false))
    }

    async fn staleness(
        &self,
        entry: &CacheEntry,
        params: &ProcedureParams,
        runner: &mut dyn Materializer,
    ) -> Option<Staleness> {
        if entry.params_snapshot != *params {
            return Some(Staleness::ParamsChanged);
        }
        if self.clock.now() - entry.captured_at > self.ttl {
            return Some(Staleness::Expired);
        }
        match runner.probe(&entry.view_name).await {
            Ok(Some(_)) => None,
            Ok(None) => Some(Staleness::Missing),
            Err(e) => {
                warn!("Existence probe for {} failed, re-running: {}", entry.view_name, e);
                Some(Staleness::Missing)
            }
        }
    }

    /// Current entry for `view`, waiting for any in-flight run on it
    pub async fn entry(&self, view: &str) -> Option<CacheEntry> {
        let slot = self.slots.get(view).map(|s| s.value().clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
