use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Where an error lands in the failure taxonomy of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Aborts the run before any fan-out stage starts.
    FatalToRun,
    /// Fails the owning stage only; sibling stages are unaffected.
    FatalToStage,
    /// Retried inside the owning stage before escalating.
    Recoverable,
}

#[derive(Error, Debug)]
pub enum FinancialReportError {
    #[error("No line items were supplied for aggregation")]
    EmptyInput,

    #[error("Malformed statement '{statement}': {details}")]
    MalformedStatement { statement: String, details: String },

    #[error("Unsupported statement format: {0}")]
    UnsupportedFormat(String),

    #[error("Statement '{statement}' does not reconcile: {details}")]
    Reconciliation { statement: String, details: String },

    #[error("Invalid period key '{0}': expected forms like 2024-Q1, 2024-P03 or 2024-03")]
    InvalidPeriod(String),

    #[error("Invalid fiscal year end month {0}: must be between 1 and 12")]
    InvalidFiscalYearEndMonth(u32),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Rendering failed for chart '{chart}': {details}")]
    Rendering { chart: String, details: String },

    #[error("Upstream text generation timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream text generation is rate limited (retry after {retry_after:?})")]
    UpstreamRateLimit { retry_after: Option<Duration> },

    #[error("Upstream text generation returned unusable content: {0}")]
    UpstreamContent(String),

    #[error("Artifact storage error at {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FinancialReportError {
    pub fn malformed(statement: impl Into<String>, details: impl Into<String>) -> Self {
        Self::MalformedStatement {
            statement: statement.into(),
            details: details.into(),
        }
    }

    pub fn artifact(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Artifact {
            path: path.into(),
            source,
        }
    }

    /// Only timeouts and rate limits are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamTimeout(_) | Self::UpstreamRateLimit { .. }
        )
    }

    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::UpstreamTimeout(_) | Self::UpstreamRateLimit { .. } => ErrorClass::Recoverable,
            Self::EmptyInput
            | Self::MalformedStatement { .. }
            | Self::UnsupportedFormat(_)
            | Self::Reconciliation { .. }
            | Self::InvalidPeriod(_)
            | Self::InvalidFiscalYearEndMonth(_)
            | Self::Cancelled
            | Self::Config(_) => ErrorClass::FatalToRun,
            Self::Serialization(_)
            | Self::Rendering { .. }
            | Self::UpstreamContent(_)
            | Self::Artifact { .. }
            | Self::Json(_)
            | Self::Csv(_)
            | Self::Io(_) => ErrorClass::FatalToStage,
        }
    }

    /// Stable identifier recorded in stage and run failures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::MalformedStatement { .. } => "malformed_statement",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Reconciliation { .. } => "reconciliation",
            Self::InvalidPeriod(_) => "invalid_period",
            Self::InvalidFiscalYearEndMonth(_) => "invalid_fiscal_year_end_month",
            Self::Serialization(_) => "serialization",
            Self::Rendering { .. } => "rendering",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamRateLimit { .. } => "upstream_rate_limit",
            Self::UpstreamContent(_) => "upstream_content",
            Self::Artifact { .. } => "artifact_storage",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Csv(_) => "csv",
            Self::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, FinancialReportError>;
