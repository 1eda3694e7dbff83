//! # Financial Report Builder
//!
//! A workflow engine that turns multi-period financial statements (Profit-and-Loss and
//! Balance Sheet spreadsheets) into a structured database export, a set of charts and a
//! narrative report.
//!
//! ## Core Concepts
//!
//! - **Statements**: CSV/TSV or Excel exports of one statement type, either single-period or
//!   monthly, optionally with a year-end "Adjustment Only" column
//! - **Aggregated Table**: One row per account with amounts for every loaded period, plus
//!   period-over-period, year-over-year and budget-variance deltas. Missing data stays `None`
//! - **Summary Metrics**: A fixed catalog (Revenue, COS, loan interest, cash, equity, ...)
//!   projected from the table and used by the database, charts and report
//! - **Fan-out Stages**: Database export, visualization and reporting run concurrently over
//!   the same read-only table; one failing never aborts the others
//! - **Artifacts**: Files written under `<artifact_root>/<run_id>/<stage>/`, owned by the
//!   [`WorkflowRun`] and deleted when it is dropped unless retained
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_report_builder::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::from_env()?;
//! let orchestrator = Orchestrator::new(config, Arc::new(GeminiTextGenerator::from_env()?))?;
//!
//! let statements = vec![
//!     StatementSource::from_path("2024-P01".parse()?, StatementType::ProfitAndLoss, "pl.csv")?,
//!     StatementSource::from_path("2024-P01".parse()?, StatementType::BalanceSheet, "bs.csv")?,
//! ];
//!
//! let mut run = orchestrator
//!     .execute_workflow(statements, &Stage::FAN_OUT, orchestrator.options())
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&run)?);
//! let kept = run.retain_artifacts();
//! ```

pub mod artifacts;
pub mod config;
pub mod database;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod metrics;
pub mod schema;
pub mod spreadsheet;
pub mod summary;
pub mod utils;
pub mod visualization;
pub mod workflow;

pub use artifacts::{Artifact, ArtifactKind, ArtifactStore, RunId, RunLease, StageWorkspace};
pub use config::PipelineConfig;
pub use database::{DatabaseExporter, METADATA_SHEET, SCHEMA_VERSION, SUMMARY_SHEET};
pub use error::{ErrorClass, FinancialReportError, Result};
pub use ingestion::{
    Discrepancy, LoaderOptions, ParsedStatement, ReconciliationPolicy, StatementFormat,
    StatementLoader, StatementSource,
};
#[cfg(feature = "gemini")]
pub use llm::GeminiTextGenerator;
pub use llm::{
    call_with_retry, parse_narrative, NarrativeSection, ReportGenerator, ReportNarrative,
    RetryPolicy, RetryReport, TextGenerator,
};
pub use metrics::{MetricRow, SummaryMetric};
pub use schema::*;
pub use spreadsheet::{ExcelWorkbookIo, JsonWorkbookIo, Sheet, SpreadsheetIo, Workbook};
pub use summary::{BudgetSeries, SummaryAggregator};
pub use visualization::{
    ChartKind, ChartOutcome, ChartRenderer, ChartSeries, ChartSpec, ChartStyle, SvgChartRenderer,
    VisualizationGenerator,
};
pub use workflow::{
    Orchestrator, RunState, Stage, StageFailure, StageResult, StageStatus, StateTransition,
    SummaryReport, WorkflowOptions, WorkflowRun,
};

use log::info;

/// Loads statements and aggregates them without running any fan-out stage.
pub fn build_summary(
    statements: &[StatementSource],
    options: LoaderOptions,
    policy: ReconciliationPolicy,
    budget: Option<&BudgetSeries>,
) -> Result<AggregatedTable> {
    let loader = StatementLoader::new(options)?;
    let parsed = loader.load_all(statements, policy)?;
    info!(
        "Loaded {} line items and {} adjustment(s) from {} statement(s)",
        parsed.line_items.len(),
        parsed.adjustments.len(),
        statements.len()
    );

    let aggregator = SummaryAggregator::new().with_adjustments(&parsed.adjustments);
    match budget {
        Some(budget) => aggregator.with_budget(budget).aggregate(&parsed.line_items),
        None => aggregator.aggregate(&parsed.line_items),
    }
}
