//! Export Pipeline
//!
//! Composes the registry, the procedure cache, the chunked reader, the row
//! limit gate and the spreadsheet sink into the two public workflows:
//! a bounded preview and the full cursor-to-file generation.
//!
//! Every run follows the same skeleton: register (or resume) an operation,
//! open a connection, run the procedure through the cache, check for
//! cancellation, stream, then finalize or abort and settle the operation.
//! A run is marked Completed before its connection is released, so a cancel
//! that arrives afterwards is refused instead of orphaning the output.
//! Connections and output files are released on every exit path, and a
//! cleanup failure is only logged so it never masks the primary error.

pub mod outcome;

pub use outcome::{GenerateOutcome, PreviewResult};

use crate::cache::{ProcedureCache, ProcedureMaterializer};
use crate::clock::Clock;
use crate::config::ExportConfig;
use crate::db::{select_all_sql, Connection, ConnectionProvider};
use crate::error::{ExportError, Result};
use crate::limit::RowLimitGate;
use crate::operation::{keys, OperationId, OperationRegistry, OperationStatus, ProgressReport, ReaperHandle};
use crate::reader::{ChunkConfig, ChunkedReader};
use crate::request::ExportRequest;
use crate::sink::{FormatConfig, SpreadsheetSink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Workflow {
    Preview,
    Generate,
}

pub struct ExportPipeline {
    registry: Arc<OperationRegistry>,
    cache: Arc<ProcedureCache>,
    connections: Arc<dyn ConnectionProvider>,
    config: ExportConfig,
}

impl ExportPipeline {
    pub fn new(config: ExportConfig, connections: Arc<dyn ConnectionProvider>, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(OperationRegistry::new(clock.clone()));
        let cache = Arc::new(ProcedureCache::new(config.cache_ttl(), clock));
        Self::with_parts(config, connections, registry, cache)
    }

    pub fn with_parts(
        config: ExportConfig,
        connections: Arc<dyn ConnectionProvider>,
        registry: Arc<OperationRegistry>,
        cache: Arc<ProcedureCache>,
    ) -> Self {
        Self {
            registry,
            cache,
            connections,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ProcedureCache> {
        &self.cache
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn cancel(&self, id: OperationId) -> bool {
        self.registry.cancel(id)
    }

    pub fn progress(&self, id: OperationId) -> Result<ProgressReport> {
        self.registry.status(id).map(|op| ProgressReport::from(&op))
    }

    /// Start reaping terminal operations on the configured interval
    pub fn spawn_reaper(&self) -> ReaperHandle {
        self.registry
            .spawn_reaper(self.config.reap_interval(), self.config.retention())
    }

    /// Run the procedure (or reuse its cached result) and return a small
    /// sample of the rows
    pub async fn start_preview(&self, request: &ExportRequest) -> Result<PreviewResult> {
        request.validate()?;
        let (id, token) = self.begin(request, Workflow::Preview)?;
        info!("Preview {} of {}", id, request.view);

        let result = async {
            let mut conn = self.connections.open(&request.credentials).await?;
            let result = self.preview_on(conn.as_mut(), id, request, &token).await;
            release(conn).await;
            result
        }
        .await;

        if let Err(e) = &result {
            self.settle_error(id, e);
        }
        result
    }

    /// Stream the whole (capped) result into a spreadsheet file, or report
    /// that the result is over the cap and needs confirmation
    pub async fn start_full_generate(&self, request: &ExportRequest) -> Result<GenerateOutcome> {
        request.validate()?;
        let (id, token) = self.begin(request, Workflow::Generate)?;
        info!("Generate {} of {}", id, request.view);

        let result = async {
            let mut conn = self.connections.open(&request.credentials).await?;
            let result = self.generate_on(conn.as_mut(), id, request, &token).await;
            release(conn).await;
            result
        }
        .await;

        if let Err(e) = &result {
            self.settle_error(id, e);
        }
        result
    }

    /// Register a fresh operation, or pick up the one named by the request.
    /// Only a generate may continue an operation paused for confirmation.
    fn begin(&self, request: &ExportRequest, workflow: Workflow) -> Result<(OperationId, CancellationToken)> {
        let id = match request.operation_id {
            Some(id) => {
                let op = self.registry.status(id)?;
                match op.status {
                    OperationStatus::Cancelled => return Err(ExportError::Cancelled),
                    status if status.is_terminal() => {
                        return Err(ExportError::InvalidRequest(format!(
                            "operation {} already finished ({:?})",
                            id, status
                        )))
                    }
                    _ => {}
                }
                if workflow == Workflow::Preview && op.is_awaiting_confirmation() {
                    return Err(ExportError::InvalidRequest(format!(
                        "operation {} is awaiting confirmation; continue it with a generate",
                        id
                    )));
                }
                self.registry.resume(id);
                id
            }
            None => self.registry.register(),
        };
        let token = self
            .registry
            .token(id)
            .ok_or_else(|| ExportError::NotFound(id.to_string()))?;
        Ok((id, token))
    }

    fn settle_error(&self, id: OperationId, err: &ExportError) {
        if err.is_cancelled() {
            self.registry.cancel(id);
        } else {
            self.registry.mark_failed(id, &err.to_string());
        }
    }

    /// Cache-aware procedure execution. On failure the possibly partial
    /// view is dropped before the error is returned.
    async fn materialize(
        &self,
        conn: &mut dyn Connection,
        id: OperationId,
        request: &ExportRequest,
    ) -> Result<(u64, bool)> {
        let call = request.procedure_call()?;
        let snapshot = request.snapshot();

        let executed = {
            let mut runner = ProcedureMaterializer::new(&mut *conn, &call);
            self.cache.execute(&request.view, &snapshot, &mut runner).await
        };

        match executed {
            Ok((total, used_cache)) => {
                self.registry.set_metadata(id, keys::TOTAL_COUNT, total.into());
                self.registry.set_metadata(id, keys::USED_CACHE, used_cache.into());
                Ok((total, used_cache))
            }
            Err(e) => {
                if let Err(cleanup) = conn.drop_view(&request.view).await {
                    warn!("Cleanup after failed procedure: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    async fn preview_on(
        &self,
        conn: &mut dyn Connection,
        id: OperationId,
        request: &ExportRequest,
        token: &CancellationToken,
    ) -> Result<PreviewResult> {
        let (total, used_cache) = self.materialize(conn, id, request).await?;
        if token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let sample = self.config.preview_rows;
        let cursor = conn.query(&select_all_sql(&request.view)).await?;
        let mut reader = ChunkedReader::new(
            cursor,
            ChunkConfig {
                batch_size: sample.max(1),
                check_interval: self.config.row_check_interval,
                max_rows: Some(sample as u64),
            },
            token.clone(),
        );
        let columns = reader.columns().to_vec();
        let fetched = reader.next_batch().await;
        if let Err(e) = reader.close().await {
            warn!("Closing preview cursor: {}", e);
        }

        let rows = fetched?.map(|batch| batch.into_rows()).unwrap_or_default();
        let shown = rows.len() as u64;
        self.registry.update_progress(id, shown, shown);
        if !self.registry.mark_completed(id) {
            return Err(ExportError::Cancelled);
        }
        debug!("Preview {} returned {} of {} rows", id, shown, total);

        Ok(PreviewResult {
            operation_id: id,
            columns,
            rows,
            total_records: total,
            used_cache,
        })
    }

    async fn generate_on(
        &self,
        conn: &mut dyn Connection,
        id: OperationId,
        request: &ExportRequest,
        token: &CancellationToken,
    ) -> Result<GenerateOutcome> {
        let (total, used_cache) = self.materialize(conn, id, request).await?;

        let cap = RowLimitGate::request_cap(self.config.row_cap, request.max_rows_override);
        if let Some(requested) = request.max_rows_override {
            self.registry
                .set_metadata(id, keys::MAX_ROWS_OVERRIDE, requested.into());
        }
        let decision = RowLimitGate::evaluate(total, cap, request.force_continue);
        if decision.exceeds {
            self.registry
                .set_metadata(id, keys::AWAITING_CONFIRMATION, true.into());
            self.registry
                .update_progress(id, 0, decision.effective_row_cap);
            info!("Operation {} awaiting confirmation: {}", id, decision.advisory);
            return Ok(GenerateOutcome::AwaitingConfirmation {
                operation_id: id,
                decision,
            });
        }
        if !decision.advisory.is_empty() {
            info!("Operation {}: {}", id, decision.advisory);
        }

        if token.is_cancelled() {
            return Err(ExportError::Cancelled);
        }

        let target = decision.effective_row_cap;
        self.registry.update_progress(id, 0, target);

        let cursor = conn.query(&select_all_sql(&request.view)).await?;
        let mut reader = ChunkedReader::new(
            cursor,
            ChunkConfig {
                batch_size: self.config.batch_size,
                check_interval: self.config.row_check_interval,
                max_rows: Some(target),
            },
            token.clone(),
        );

        let path = request.output_path(&self.config.output_dir, self.config.format);
        let sink = SpreadsheetSink::open(&path, &FormatConfig::from(&self.config), &id.short());
        let mut sink = match sink {
            Ok(sink) => sink,
            Err(e) => {
                if let Err(cleanup) = reader.close().await {
                    warn!("Closing cursor: {}", cleanup);
                }
                return Err(e);
            }
        };

        let streamed = self.stream(id, &mut reader, &mut sink, target).await;
        if let Err(e) = reader.close().await {
            warn!("Closing cursor: {}", e);
        }

        // A cancel that lands after the last batch still wins over completion
        let written = match streamed {
            Ok(_) if token.is_cancelled() => Err(ExportError::Cancelled),
            other => other,
        };
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = sink.abort() {
                    warn!("Removing partial output for {}: {}", id, cleanup);
                }
                return Err(e);
            }
        };

        let file_path = sink.finalize()?;
        if written < target {
            // the view shrank under us; finish at 100% of what was there
            self.registry.update_progress(id, written, written);
        }
        self.registry.set_metadata(
            id,
            keys::OUTPUT_FILE_PATH,
            file_path.display().to_string().into(),
        );

        // A cancel can still land between the last check and here; the
        // registry decides which one wins, and a lost race unpublishes the file
        if !self.registry.mark_completed(id) {
            if let Err(e) = std::fs::remove_file(&file_path) {
                warn!("Removing output of cancelled operation {}: {}", id, e);
            }
            return Err(ExportError::Cancelled);
        }

        Ok(GenerateOutcome::Generated {
            operation_id: id,
            file_path,
            rows_written: written,
            total_records: total,
            truncated: written < total,
            used_cache,
        })
    }

    /// The fetch-and-write loop; returns data rows written
    async fn stream(
        &self,
        id: OperationId,
        reader: &mut ChunkedReader<'_>,
        sink: &mut SpreadsheetSink,
        target: u64,
    ) -> Result<u64> {
        sink.write_header(reader.columns())?;

        let mut written = 0u64;
        while written < target {
            let Some(batch) = reader.next_batch().await? else {
                break;
            };
            for chunk in reader.checked_chunks(batch.rows()) {
                written += sink.write_batch(chunk?, target - written)? as u64;
                self.registry.update_progress(id, written, target);
                if written >= target {
                    break;
                }
            }
        }
        Ok(written)
    }
}

async fn release(conn: Box<dyn Connection>) {
    if let Err(e) = conn.close().await {
        warn!("Releasing connection: {}", e);
    }
}
