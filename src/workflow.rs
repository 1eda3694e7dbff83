use crate::artifacts::{Artifact, ArtifactKind, ArtifactStore, RunId, RunLease};
use crate::config::PipelineConfig;
use crate::database::DatabaseExporter;
use crate::error::{FinancialReportError, Result};
use crate::ingestion::{ParsedStatement, ReconciliationPolicy, StatementSource};
use crate::llm::report::ReportGenerator;
use crate::llm::retry::RetryPolicy;
use crate::llm::types::TextGenerator;
use crate::schema::{AggregatedTable, Degradation, PeriodKey};
use crate::spreadsheet::{ExcelWorkbookIo, SpreadsheetIo};
use crate::summary::{BudgetSeries, SummaryAggregator};
use crate::visualization::{ChartOutcome, ChartRenderer, SvgChartRenderer, VisualizationGenerator};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Summary,
    Database,
    Visualization,
    Reporting,
}

impl Stage {
    /// Stages that run concurrently over the aggregated table.
    pub const FAN_OUT: [Stage; 3] = [Stage::Database, Stage::Visualization, Stage::Reporting];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Summary => "summary",
            Stage::Database => "database",
            Stage::Visualization => "visualization",
            Stage::Reporting => "reporting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

/// Serializable record of an error that ended a stage or a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&FinancialReportError> for StageFailure {
    fn from(e: &FinancialReportError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub status: StageStatus,
    pub artifacts: Vec<Artifact>,
    pub degradations: Vec<Degradation>,
    pub error: Option<StageFailure>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl StageResult {
    fn cancelled_before_start(stage: Stage) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            artifacts: Vec::new(),
            degradations: vec![Degradation::new(
                stage.name(),
                "run cancelled before the stage started",
            )],
            error: Some(StageFailure::from(&FinancialReportError::Cancelled)),
            attempts: 0,
            duration_ms: 0,
        }
    }

    /// The stage ended, or never started, because the run was cancelled.
    pub fn was_cancelled(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|failure| failure.code == FinancialReportError::Cancelled.code())
    }

    fn panicked(stage: Stage, message: String) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            artifacts: Vec::new(),
            degradations: Vec::new(),
            error: Some(StageFailure {
                code: "panicked".to_string(),
                message,
                retryable: false,
            }),
            attempts: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    LoadingStatements,
    Aggregating,
    RunningStages,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::PartiallyCompleted | RunState::Failed
        )
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, LoadingStatements)
                | (Pending, Failed)
                | (LoadingStatements, Aggregating)
                | (LoadingStatements, Failed)
                | (Aggregating, RunningStages)
                | (Aggregating, Completed)
                | (Aggregating, Failed)
                | (RunningStages, Completed)
                | (RunningStages, PartiallyCompleted)
                | (RunningStages, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryReport {
    pub periods: Vec<PeriodKey>,
    pub line_items: usize,
    pub accounts: usize,
    pub degradations: Vec<Degradation>,
}

/// A run counts as cancelled only when cancellation actually stopped one of its stages.
fn cancelled_during_fan_out(results: &BTreeMap<Stage, StageResult>) -> bool {
    results.values().any(StageResult::was_cancelled)
}

/// Terminal status for a run that reached the fan-out.
///
/// Completed when every requested stage succeeded, Failed when none did or the
/// run was cancelled, PartiallyCompleted otherwise.
pub fn terminal_state(
    requested: &[Stage],
    results: &BTreeMap<Stage, StageResult>,
    cancelled: bool,
) -> RunState {
    if cancelled {
        return RunState::Failed;
    }
    let unsuccessful = requested
        .iter()
        .filter(|stage| {
            results
                .get(*stage)
                .map_or(true, |r| r.status != StageStatus::Success)
        })
        .count();

    match unsuccessful {
        0 => RunState::Completed,
        n if n == requested.len() => RunState::Failed,
        _ => RunState::PartiallyCompleted,
    }
}

/// The externally visible record of one workflow execution.
///
/// Owns the run's artifact directory: dropping the run deletes its artifacts
/// unless [`WorkflowRun::retain_artifacts`] was called.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub requested_stages: Vec<Stage>,
    pub state: RunState,
    pub stage_results: BTreeMap<Stage, StageResult>,
    pub summary: Option<SummaryReport>,
    pub failure: Option<StageFailure>,
    pub warnings: Vec<String>,
    pub history: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    #[serde(skip)]
    table: Option<Arc<AggregatedTable>>,
    #[serde(skip)]
    lease: Option<RunLease>,
}

impl WorkflowRun {
    fn new(run_id: RunId, requested_stages: Vec<Stage>) -> Self {
        Self {
            run_id,
            requested_stages,
            state: RunState::Pending,
            stage_results: BTreeMap::new(),
            summary: None,
            failure: None,
            warnings: Vec::new(),
            history: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            cancelled: false,
            table: None,
            lease: None,
        }
    }

    fn transition(&mut self, next: RunState) -> bool {
        if !self.state.can_transition_to(next) {
            let message = format!("illegal state transition {:?} -> {:?}", self.state, next);
            warn!("Run {}: {}", self.run_id, message);
            self.warnings.push(message);
            return false;
        }
        debug!("Run {}: {:?} -> {:?}", self.run_id, self.state, next);
        self.history.push(StateTransition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        true
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stage_results.get(&stage)
    }

    /// Requested stages that did not succeed, in pipeline order.
    pub fn failed_stages(&self) -> Vec<Stage> {
        self.requested_stages
            .iter()
            .copied()
            .filter(|stage| {
                self.stage_results
                    .get(stage)
                    .map_or(true, |r| r.status != StageStatus::Success)
            })
            .collect()
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> + '_ {
        self.stage_results.values().flat_map(|r| r.artifacts.iter())
    }

    /// The aggregated table, when the run got that far.
    pub fn table(&self) -> Option<&AggregatedTable> {
        self.table.as_deref()
    }

    pub fn read_artifact(&self, artifact: &Artifact) -> Result<Vec<u8>> {
        std::fs::read(&artifact.storage_location)
            .map_err(|e| FinancialReportError::artifact(&artifact.storage_location, e))
    }

    /// Deletes every artifact of the run now.
    pub fn release_artifacts(&mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => lease.release(),
            None => Ok(()),
        }
    }

    /// Hands the artifact directory over to the caller; it is no longer deleted on drop.
    pub fn retain_artifacts(&mut self) -> Option<PathBuf> {
        self.lease.take().map(RunLease::retain)
    }
}

/// Per-run knobs. Built from [`PipelineConfig`] and adjusted by the caller.
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub budget: Option<BudgetSeries>,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub reconciliation: ReconciliationPolicy,
    pub max_tokens: u32,
    pub max_chart_series: usize,
    pub entity: Option<String>,
    /// Reuse an existing run id; its stage directories are overwritten.
    pub run_id: Option<RunId>,
    pub cancellation: CancellationToken,
}

impl WorkflowOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            budget: None,
            timeout: config.llm_timeout(),
            retry_policy: config.retry_policy(),
            reconciliation: config.reconciliation_policy,
            max_tokens: config.llm_max_tokens,
            max_chart_series: config.max_chart_series,
            entity: config.entity.clone(),
            run_id: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_budget(mut self, budget: BudgetSeries) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_reconciliation(mut self, policy: ReconciliationPolicy) -> Self {
        self.reconciliation = policy;
        self
    }
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

struct StageContext {
    run_id: RunId,
    stage: Stage,
    table: Arc<AggregatedTable>,
    store: ArtifactStore,
    spreadsheet: Arc<dyn SpreadsheetIo>,
    renderer: Arc<dyn ChartRenderer>,
    text_generator: Arc<dyn TextGenerator>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    max_tokens: u32,
    max_chart_series: usize,
    entity: Option<String>,
    chart_tx: Option<oneshot::Sender<Vec<Artifact>>>,
    chart_rx: Option<oneshot::Receiver<Vec<Artifact>>>,
    /// Charts from an earlier successful visualization of the same run.
    carried_charts: Vec<Artifact>,
}

#[derive(Default)]
struct StageOutcome {
    artifacts: Vec<Artifact>,
    degradations: Vec<Degradation>,
    attempts: u32,
    error: Option<FinancialReportError>,
}

impl StageOutcome {
    fn from_result(result: Result<(Vec<Artifact>, Vec<Degradation>)>, attempts: u32) -> Self {
        match result {
            Ok((artifacts, degradations)) => Self {
                artifacts,
                degradations,
                attempts,
                error: None,
            },
            Err(e) => Self::failed(e, attempts),
        }
    }

    fn failed(error: FinancialReportError, attempts: u32) -> Self {
        Self {
            attempts,
            error: Some(error),
            ..Self::default()
        }
    }

    fn into_result(self, stage: Stage, elapsed: Duration) -> StageResult {
        StageResult {
            stage,
            status: if self.error.is_some() {
                StageStatus::Failed
            } else {
                StageStatus::Success
            },
            artifacts: self.artifacts,
            degradations: self.degradations,
            error: self.error.as_ref().map(StageFailure::from),
            attempts: self.attempts,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

async fn export_database(ctx: &StageContext) -> Result<(Vec<Artifact>, Vec<Degradation>)> {
    let mut workspace = ctx.store.open_stage(ctx.run_id, ctx.stage).await?;
    let exporter = DatabaseExporter::new(ctx.spreadsheet.as_ref());
    let bytes = exporter.export(&ctx.table, Utc::now())?;
    let file_name = format!("financial_database.{}", exporter.file_extension());
    workspace
        .write(ArtifactKind::Database, "financial_database", &file_name, &bytes)
        .await?;
    Ok((workspace.commit(), Vec::new()))
}

async fn render_charts(ctx: StageContext) -> Result<(Vec<Artifact>, Vec<Degradation>)> {
    let mut workspace = ctx.store.open_stage(ctx.run_id, ctx.stage).await?;
    let generator = VisualizationGenerator::new(ctx.renderer.as_ref(), ctx.max_chart_series);
    let extension = generator.file_extension().to_string();

    let mut degradations = Vec::new();
    for outcome in generator.generate(&ctx.table)? {
        match outcome {
            ChartOutcome::Rendered { kind, bytes } => {
                workspace
                    .write(
                        ArtifactKind::ChartSet,
                        kind.name(),
                        &format!("{}.{}", kind.name(), extension),
                        &bytes,
                    )
                    .await?;
            }
            ChartOutcome::Skipped { kind, reason } => {
                degradations.push(Degradation::new(kind.name(), reason));
            }
        }
    }

    let artifacts = workspace.commit();
    if let Some(tx) = ctx.chart_tx {
        // the reporting stage may already be gone
        let _ = tx.send(artifacts.clone());
    }
    Ok((artifacts, degradations))
}

async fn write_report(ctx: StageContext) -> StageOutcome {
    let mut degradations = Vec::new();
    let charts = match ctx.chart_rx {
        Some(rx) => rx.await.unwrap_or_else(|_| {
            degradations.push(Degradation::new(
                Stage::Reporting.name(),
                "chart artifacts unavailable: visualization did not succeed",
            ));
            Vec::new()
        }),
        None => ctx.carried_charts.clone(),
    };
    let chart_names: Vec<String> = charts.iter().map(Artifact::file_name).collect();

    let mut workspace = match ctx.store.open_stage(ctx.run_id, ctx.stage).await {
        Ok(workspace) => workspace,
        Err(e) => return StageOutcome::failed(e, 0),
    };

    let report = ReportGenerator::new(ctx.text_generator.as_ref(), &ctx.retry_policy)
        .with_timeout(ctx.timeout)
        .with_max_tokens(ctx.max_tokens)
        .with_entity(ctx.entity.clone())
        .generate(&ctx.table, &chart_names)
        .await;
    debug!(
        "Run {}: narrative finished after {} attempt(s) in {:?}",
        ctx.run_id, report.attempts, report.elapsed
    );

    let document = match report.result {
        Ok(document) => document,
        Err(e) => return StageOutcome::failed(e, report.attempts),
    };
    if let Err(e) = workspace
        .write(
            ArtifactKind::Report,
            "financial_report",
            "financial_report.md",
            document.as_bytes(),
        )
        .await
    {
        return StageOutcome::failed(e, report.attempts);
    }

    StageOutcome {
        artifacts: workspace.commit(),
        degradations,
        attempts: report.attempts,
        error: None,
    }
}

async fn run_stage(ctx: StageContext) -> StageOutcome {
    let stage = ctx.stage;
    match stage {
        Stage::Database => StageOutcome::from_result(export_database(&ctx).await, 1),
        Stage::Visualization => StageOutcome::from_result(render_charts(ctx).await, 1),
        Stage::Reporting => write_report(ctx).await,
        Stage::Summary => StageOutcome::failed(
            FinancialReportError::Config("summary is not a fan-out stage".to_string()),
            0,
        ),
    }
}

/// Keeps fan-out stages only, once each, in pipeline order.
fn normalize_stages(requested: &[Stage]) -> Vec<Stage> {
    Stage::FAN_OUT
        .iter()
        .copied()
        .filter(|stage| requested.contains(stage))
        .collect()
}

/// Drives the fixed pipeline: load, aggregate, then fan out.
pub struct Orchestrator {
    config: PipelineConfig,
    store: ArtifactStore,
    spreadsheet: Arc<dyn SpreadsheetIo>,
    renderer: Arc<dyn ChartRenderer>,
    text_generator: Arc<dyn TextGenerator>,
}

impl Orchestrator {
    pub fn new(config: PipelineConfig, text_generator: Arc<dyn TextGenerator>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: ArtifactStore::new(config.artifact_root.clone()),
            spreadsheet: Arc::new(ExcelWorkbookIo::new(config.loader_options())?),
            renderer: Arc::new(SvgChartRenderer::default()),
            text_generator,
            config,
        })
    }

    pub fn with_spreadsheet_io(mut self, spreadsheet: Arc<dyn SpreadsheetIo>) -> Self {
        self.spreadsheet = spreadsheet;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ChartRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Default per-run options derived from the orchestrator's config.
    pub fn options(&self) -> WorkflowOptions {
        WorkflowOptions::from_config(&self.config)
    }

    /// Runs the pipeline once. Never returns an error: every failure is recorded
    /// in the returned [`WorkflowRun`].
    pub async fn execute_workflow(
        &self,
        statements: Vec<StatementSource>,
        requested_stages: &[Stage],
        options: WorkflowOptions,
    ) -> WorkflowRun {
        let stages = normalize_stages(requested_stages);
        let run = WorkflowRun::new(options.run_id.unwrap_or_default(), stages.clone());
        self.drive(run, statements, stages, options).await
    }

    /// Re-runs the stages that did not succeed in `previous`, under the same run id.
    ///
    /// Successful results and their artifacts are carried over; the re-run stage
    /// directories are overwritten.
    pub async fn retry_failed_stages(
        &self,
        mut previous: WorkflowRun,
        statements: Vec<StatementSource>,
        options: WorkflowOptions,
    ) -> WorkflowRun {
        let stages = previous.failed_stages();
        let mut run = WorkflowRun::new(previous.run_id, previous.requested_stages.clone());
        for (stage, result) in std::mem::take(&mut previous.stage_results) {
            if stage != Stage::Summary && result.status == StageStatus::Success {
                run.stage_results.insert(stage, result);
            }
        }
        run.lease = previous.lease.take();
        info!(
            "Run {}: retrying {} stage(s): {:?}",
            run.run_id,
            stages.len(),
            stages
        );
        self.drive(run, statements, stages, options).await
    }

    async fn drive(
        &self,
        mut run: WorkflowRun,
        statements: Vec<StatementSource>,
        stages: Vec<Stage>,
        options: WorkflowOptions,
    ) -> WorkflowRun {
        let run_id = run.run_id;
        if run.lease.is_none() {
            run.lease = Some(self.store.lease(run_id));
        }
        info!(
            "Run {}: starting with {} statement(s), stages {:?}",
            run_id,
            statements.len(),
            stages
        );

        if options.cancellation.is_cancelled() {
            return fail_run(run, FinancialReportError::Cancelled);
        }

        run.transition(RunState::LoadingStatements);
        let loaded = match self.load_statements(&statements, options.reconciliation, &mut run) {
            Ok(loaded) => loaded,
            Err(e) => return fail_run(run, e),
        };
        let items = &loaded.line_items;

        run.transition(RunState::Aggregating);
        let started = Instant::now();
        let aggregator = SummaryAggregator::new().with_adjustments(&loaded.adjustments);
        let aggregator = match &options.budget {
            Some(budget) => aggregator.with_budget(budget),
            None => aggregator,
        };
        let table = match aggregator.aggregate(items) {
            Ok(table) => Arc::new(table),
            Err(e) => return fail_run(run, e),
        };
        run.summary = Some(SummaryReport {
            periods: table.periods().to_vec(),
            line_items: items.len(),
            accounts: table.rows().len(),
            degradations: table.degradations().to_vec(),
        });
        run.stage_results.insert(
            Stage::Summary,
            StageResult {
                stage: Stage::Summary,
                status: StageStatus::Success,
                artifacts: Vec::new(),
                degradations: table.degradations().to_vec(),
                error: None,
                attempts: 1,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        run.table = Some(Arc::clone(&table));

        if options.cancellation.is_cancelled() {
            return fail_run(run, FinancialReportError::Cancelled);
        }

        if stages.is_empty() {
            info!("Run {}: no fan-out stages requested, summary only", run_id);
            let terminal = terminal_state(&run.requested_stages, &run.stage_results, false);
            run.transition(terminal);
            run.finished_at = Some(Utc::now());
            return run;
        }

        let carried_charts = run
            .stage(Stage::Visualization)
            .filter(|r| r.status == StageStatus::Success)
            .map(|r| r.artifacts.clone())
            .unwrap_or_default();

        run.transition(RunState::RunningStages);
        for result in self
            .fan_out(run_id, &stages, table, carried_charts, &options)
            .await
        {
            run.stage_results.insert(result.stage, result);
        }

        run.cancelled = cancelled_during_fan_out(&run.stage_results);
        if !run.cancelled && options.cancellation.is_cancelled() {
            debug!("Run {}: cancellation arrived after every stage had finished", run_id);
        }
        let terminal = terminal_state(&run.requested_stages, &run.stage_results, run.cancelled);
        run.transition(terminal);
        run.finished_at = Some(Utc::now());

        let failed = run.failed_stages();
        if failed.is_empty() {
            info!("Run {}: {:?}", run_id, run.state);
        } else {
            warn!(
                "Run {}: {:?}, unsuccessful stages {:?}",
                run_id, run.state, failed
            );
        }
        run
    }

    fn load_statements(
        &self,
        statements: &[StatementSource],
        policy: ReconciliationPolicy,
        run: &mut WorkflowRun,
    ) -> Result<ParsedStatement> {
        let mut loaded = ParsedStatement::default();
        for source in statements {
            let parsed = policy.apply(&source.file_name, self.spreadsheet.parse(source)?)?;
            for discrepancy in &parsed.discrepancies {
                run.warnings
                    .push(format!("{}: {}", source.file_name, discrepancy));
            }
            debug!(
                "Run {}: '{}' ({} {}) gave {} line item(s) and {} adjustment(s)",
                run.run_id,
                source.file_name,
                source.statement_type,
                source.period,
                parsed.line_items.len(),
                parsed.adjustments.len()
            );
            loaded.line_items.extend(parsed.line_items);
            loaded.adjustments.extend(parsed.adjustments);
            loaded.discrepancies.extend(parsed.discrepancies);
        }
        Ok(loaded)
    }

    async fn fan_out(
        &self,
        run_id: RunId,
        stages: &[Stage],
        table: Arc<AggregatedTable>,
        carried_charts: Vec<Artifact>,
        options: &WorkflowOptions,
    ) -> Vec<StageResult> {
        let (mut chart_tx, mut chart_rx) =
            if stages.contains(&Stage::Visualization) && stages.contains(&Stage::Reporting) {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

        let mut handles = Vec::with_capacity(stages.len());
        let mut results = Vec::with_capacity(stages.len());
        for &stage in stages {
            let token = options.cancellation.clone();
            if token.is_cancelled() {
                results.push(StageResult::cancelled_before_start(stage));
                continue;
            }

            let ctx = StageContext {
                run_id,
                stage,
                table: Arc::clone(&table),
                store: self.store.clone(),
                spreadsheet: Arc::clone(&self.spreadsheet),
                renderer: Arc::clone(&self.renderer),
                text_generator: Arc::clone(&self.text_generator),
                retry_policy: options.retry_policy.clone(),
                timeout: options.timeout,
                max_tokens: options.max_tokens,
                max_chart_series: options.max_chart_series,
                entity: options.entity.clone(),
                chart_tx: if stage == Stage::Visualization { chart_tx.take() } else { None },
                chart_rx: if stage == Stage::Reporting { chart_rx.take() } else { None },
                carried_charts: carried_charts.clone(),
            };

            debug!("Run {}: spawning stage {}", run_id, stage);
            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = token.cancelled() => StageOutcome::failed(FinancialReportError::Cancelled, 0),
                    outcome = run_stage(ctx) => outcome,
                };
                outcome.into_result(stage, started.elapsed())
            });
            handles.push((stage, handle));
        }

        let (spawned, handles): (Vec<Stage>, Vec<_>) = handles.into_iter().unzip();
        for (stage, joined) in spawned.into_iter().zip(join_all(handles).await) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Run {}: stage {} panicked: {}", run_id, stage, e);
                    StageResult::panicked(stage, e.to_string())
                }
            };
            match &result.error {
                Some(failure) => error!(
                    "Run {}: stage {} failed after {} attempt(s): {}",
                    run_id, stage, result.attempts, failure.message
                ),
                None => info!(
                    "Run {}: stage {} succeeded in {}ms with {} artifact(s)",
                    run_id,
                    stage,
                    result.duration_ms,
                    result.artifacts.len()
                ),
            }
            results.push(result);
        }
        results
    }
}

fn fail_run(mut run: WorkflowRun, e: FinancialReportError) -> WorkflowRun {
    error!("Run {}: failed while {:?}: {}", run.run_id, run.state, e);
    if matches!(e, FinancialReportError::Cancelled) {
        run.cancelled = true;
    }
    run.failure = Some(StageFailure::from(&e));
    run.transition(RunState::Failed);
    run.finished_at = Some(Utc::now());
    run
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stage: Stage, status: StageStatus) -> StageResult {
        StageResult {
            stage,
            status,
            artifacts: Vec::new(),
            degradations: Vec::new(),
            error: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    fn results(statuses: &[(Stage, StageStatus)]) -> BTreeMap<Stage, StageResult> {
        statuses
            .iter()
            .map(|(stage, status)| (*stage, result(*stage, *status)))
            .collect()
    }

    #[test]
    fn test_terminal_status_rules() {
        use StageStatus::*;
        let all = Stage::FAN_OUT;

        let ok = results(&[
            (Stage::Database, Success),
            (Stage::Visualization, Success),
            (Stage::Reporting, Success),
        ]);
        assert_eq!(terminal_state(&all, &ok, false), RunState::Completed);
        assert_eq!(terminal_state(&all, &ok, true), RunState::Failed);

        let partial = results(&[
            (Stage::Database, Success),
            (Stage::Visualization, Skipped),
            (Stage::Reporting, Failed),
        ]);
        assert_eq!(terminal_state(&all, &partial, false), RunState::PartiallyCompleted);

        let none = results(&[
            (Stage::Database, Failed),
            (Stage::Visualization, Skipped),
            (Stage::Reporting, Failed),
        ]);
        assert_eq!(terminal_state(&all, &none, false), RunState::Failed);

        assert_eq!(terminal_state(&[], &BTreeMap::new(), false), RunState::Completed);
    }

    #[test]
    fn test_state_machine() {
        assert!(RunState::Pending.can_transition_to(RunState::LoadingStatements));
        assert!(RunState::Aggregating.can_transition_to(RunState::Failed));
        assert!(!RunState::Pending.can_transition_to(RunState::Completed));
        assert!(!RunState::Completed.can_transition_to(RunState::Failed));
        assert!(RunState::PartiallyCompleted.is_terminal());

        let mut run = WorkflowRun::new(RunId::new(), Stage::FAN_OUT.to_vec());
        assert!(!run.transition(RunState::RunningStages));
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.warnings.len(), 1);
        assert!(run.transition(RunState::LoadingStatements));
        assert_eq!(run.history.len(), 1);
    }

    #[test]
    fn test_failed_stages_lists_missing_and_unsuccessful() {
        let mut run = WorkflowRun::new(RunId::new(), Stage::FAN_OUT.to_vec());
        run.stage_results = results(&[
            (Stage::Database, StageStatus::Success),
            (Stage::Reporting, StageStatus::Failed),
        ]);
        assert_eq!(
            run.failed_stages(),
            vec![Stage::Visualization, Stage::Reporting]
        );
    }

    #[test]
    fn test_normalize_stages() {
        assert_eq!(
            normalize_stages(&[Stage::Reporting, Stage::Summary, Stage::Database, Stage::Reporting]),
            vec![Stage::Database, Stage::Reporting]
        );
    }

    #[test]
    fn test_run_serializes_stage_keys() {
        let mut run = WorkflowRun::new(RunId::new(), vec![Stage::Database]);
        run.stage_results = results(&[(Stage::Database, StageStatus::Success)]);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["stage_results"]["database"]["status"], "success");
        assert_eq!(json["state"], "pending");
    }

    #[test]
    fn test_cancellation_is_read_from_stage_results() {
        use StageStatus::*;
        let finished = results(&[(Stage::Database, Success), (Stage::Reporting, Success)]);
        assert!(!cancelled_during_fan_out(&finished));
        let requested = [Stage::Database, Stage::Reporting];
        let cancelled = cancelled_during_fan_out(&finished);
        assert_eq!(terminal_state(&requested, &finished, cancelled), RunState::Completed);

        let mut stopped = finished.clone();
        stopped.insert(
            Stage::Visualization,
            StageResult::cancelled_before_start(Stage::Visualization),
        );
        assert!(cancelled_during_fan_out(&stopped));

        let mut interrupted = finished;
        let mut report = result(Stage::Reporting, Failed);
        report.error = Some(StageFailure::from(&FinancialReportError::Cancelled));
        interrupted.insert(Stage::Reporting, report);
        assert!(cancelled_during_fan_out(&interrupted));

        let mut timed_out = result(Stage::Reporting, Failed);
        let timeout = FinancialReportError::UpstreamTimeout(Duration::from_secs(1));
        timed_out.error = Some(StageFailure::from(&timeout));
        assert!(!timed_out.was_cancelled());
    }
}
