use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Upstream execution error ({context}): {message}")]
    Upstream { context: String, message: String },

    #[error("Resource cleanup error: {0}")]
    Cleanup(String),

    #[error("Spreadsheet error: {0}")]
    Sheet(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExportError {
    /// Wrap a database-side failure with the step that produced it.
    pub fn upstream(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ExportError::Upstream {
            context: context.into(),
            message: err.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExportError::Cancelled)
    }
}

impl From<sqlx::Error> for ExportError {
    fn from(err: sqlx::Error) -> Self {
        ExportError::upstream("database", err)
    }
}

impl From<rust_xlsxwriter::XlsxError> for ExportError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        ExportError::Sheet(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
