use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sheet_export::{
    Credentials, ExportConfig, ExportPipeline, ExportRequest, MonthRange, OperationId, ParamValue,
    PgConnectionProvider, ProcedureParams, SheetFormat, SystemClock,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sheet-export")]
#[command(about = "Export stored-procedure results to spreadsheets")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the procedure and print a sample of the result
    Preview(ExportArgs),

    /// Run the procedure and write the full result to a file
    Generate {
        #[command(flatten)]
        export: ExportArgs,

        /// Export the first rows up to the limit instead of stopping for confirmation
        #[arg(long)]
        force_continue: bool,

        /// Write at most this many rows
        #[arg(long)]
        max_rows: Option<u64>,

        /// Output format (xlsx or csv)
        #[arg(long)]
        format: Option<SheetFormat>,

        /// Directory to write into (default: $SHEET_EXPORT_OUTPUT_DIR or ./exports)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(ClapArgs)]
struct ExportArgs {
    /// View the procedure materializes
    #[arg(long)]
    view: String,

    /// Stored procedure to call
    #[arg(long)]
    procedure: String,

    /// First month, YYYY-MM
    #[arg(long)]
    from: String,

    /// Last month, YYYY-MM
    #[arg(long)]
    to: String,

    /// Procedure filter as name=value; repeat in procedure argument order
    #[arg(short, long = "filter")]
    filters: Vec<String>,

    /// Database user (default: the one in DATABASE_URL)
    #[arg(long)]
    user: Option<String>,

    /// Database name override
    #[arg(long)]
    database: Option<String>,
}

impl ExportArgs {
    fn into_request(self) -> Result<ExportRequest> {
        let filters = self
            .filters
            .iter()
            .map(|raw| parse_filter(raw))
            .collect::<Result<Vec<_>>>()?;
        let params = ProcedureParams {
            filters,
            month_range: MonthRange::new(self.from, self.to)?,
        };

        let mut request = ExportRequest::new(self.view, self.procedure, params);
        if let Some(user) = self.user {
            let password = std::env::var("SHEET_EXPORT_DB_PASSWORD").unwrap_or_default();
            request.credentials = Credentials::new(user, password);
        }
        request.credentials.database = self.database;
        Ok(request)
    }
}

fn parse_filter(raw: &str) -> Result<(String, ParamValue)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("filter {:?} must look like name=value", raw))?;
    let value = value.trim();
    let parsed = if value.eq_ignore_ascii_case("null") {
        ParamValue::Null
    } else if let Ok(b) = value.parse::<bool>() {
        ParamValue::Bool(b)
    } else if let Ok(i) = value.parse::<i64>() {
        ParamValue::Int(i)
    } else if let Ok(f) = value.parse::<f64>() {
        ParamValue::Float(f)
    } else if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        ParamValue::Date(d)
    } else {
        ParamValue::Text(value.to_string())
    };
    Ok((name.trim().to_string(), parsed))
}

/// Await `work`; on Ctrl-C cancel the operation and keep awaiting so the
/// pipeline can clean up before we exit
async fn run_cancellable<T>(
    pipeline: &ExportPipeline,
    id: OperationId,
    work: impl Future<Output = sheet_export::Result<T>>,
) -> sheet_export::Result<T> {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling operation {}", id);
            pipeline.cancel(id);
            work.await
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = ExportConfig::from_env().context("loading configuration")?;

    let (export, force_continue, max_rows) = match args.command {
        Command::Preview(export) => (export, None, None),
        Command::Generate {
            export,
            force_continue,
            max_rows,
            format,
            output_dir,
        } => {
            if let Some(format) = format {
                config.format = format;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            (export, Some(force_continue), max_rows)
        }
    };

    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
    let provider = PgConnectionProvider::from_url(&database_url)?;
    let pipeline = ExportPipeline::new(config, Arc::new(provider), Arc::new(SystemClock));
    let reaper = pipeline.spawn_reaper();

    let mut request = export.into_request()?;
    let id = pipeline.registry().register();
    request.operation_id = Some(id);
    info!("Operation {} started", id);

    let output = match force_continue {
        None => {
            let preview = run_cancellable(&pipeline, id, pipeline.start_preview(&request)).await?;
            serde_json::to_string_pretty(&preview)?
        }
        Some(force_continue) => {
            request.force_continue = force_continue;
            request.max_rows_override = max_rows;
            let outcome = run_cancellable(&pipeline, id, pipeline.start_full_generate(&request)).await?;
            if outcome.is_awaiting_confirmation() {
                warn!("Result exceeds the row limit; rerun with --force-continue to export a truncated file");
            }
            serde_json::to_string_pretty(&outcome)?
        }
    };
    println!("{}", output);

    reaper.shutdown().await;
    Ok(())
}
