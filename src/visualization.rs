use crate::error::{FinancialReportError, Result};
use crate::metrics::SummaryMetric;
use crate::schema::{AggregatedRow, AggregatedTable, PeriodKey, RowRole, StatementType};
use crate::utils::normalize_account_name;
use log::{debug, info};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

const REVENUE_KEYWORDS: [&str; 5] = ["revenue", "sales", "income", "turnover", "fees"];
const NOT_REVENUE_KEYWORDS: [&str; 4] = ["expense", "cost", "tax", "interest"];
const EXPENSE_KEYWORDS: [&str; 9] = [
    "expense",
    "cost",
    "cos",
    "wages",
    "salaries",
    "rent",
    "administrative",
    "interest",
    "depreciation",
];
const REVENUE_METRICS: [SummaryMetric; 2] = [SummaryMetric::Revenue, SummaryMetric::OtherIncome];
const EXPENSE_METRICS: [SummaryMetric; 4] = [
    SummaryMetric::CostOfSales,
    SummaryMetric::AdministrativeExpenses,
    SummaryMetric::LoanInterestNab,
    SummaryMetric::LoanInterestPartners,
];
const LIQUIDITY_KEYWORDS: [&str; 8] = [
    "cash",
    "bank",
    "current assets",
    "current liabilities",
    "receivable",
    "debtors",
    "payable",
    "creditors",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    RevenueTrend,
    ExpenseBreakdown,
    LiquidityRatios,
    VarianceToBudget,
}

impl ChartKind {
    pub const ALL: [ChartKind; 4] = [
        ChartKind::RevenueTrend,
        ChartKind::ExpenseBreakdown,
        ChartKind::LiquidityRatios,
        ChartKind::VarianceToBudget,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChartKind::RevenueTrend => "revenue_trend",
            ChartKind::ExpenseBreakdown => "expense_breakdown",
            ChartKind::LiquidityRatios => "liquidity_ratios",
            ChartKind::VarianceToBudget => "variance_to_budget",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ChartKind::RevenueTrend => "Revenue Trend",
            ChartKind::ExpenseBreakdown => "Expense Breakdown",
            ChartKind::LiquidityRatios => "Liquidity Ratios",
            ChartKind::VarianceToBudget => "Variance to Budget",
        }
    }

    pub fn style(&self) -> ChartStyle {
        match self {
            ChartKind::RevenueTrend | ChartKind::LiquidityRatios => ChartStyle::Line,
            ChartKind::ExpenseBreakdown | ChartKind::VarianceToBudget => ChartStyle::Bar,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartStyle {
    Line,
    Bar,
}

/// One plotted account. `values` line up with [`ChartSpec::periods`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub label: String,
    pub values: Vec<Option<f64>>,
}

impl ChartSeries {
    pub fn present_points(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    fn latest_magnitude(&self) -> f64 {
        self.values
            .iter()
            .rev()
            .find_map(|v| *v)
            .map(f64::abs)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub style: ChartStyle,
    pub periods: Vec<PeriodKey>,
    pub series: Vec<ChartSeries>,
}

impl ChartSpec {
    /// A chart is worth drawing once some series has two or more points.
    pub fn is_sufficient(&self) -> bool {
        self.series.iter().any(|s| s.present_points() >= 2)
    }

    fn insufficiency_reason(&self) -> String {
        if self.series.is_empty() {
            "no matching accounts".to_string()
        } else {
            format!(
                "none of {} matching account(s) has two or more periods of data",
                self.series.len()
            )
        }
    }
}

/// Draws one chart specification into image bytes.
pub trait ChartRenderer: Send + Sync {
    fn render(&self, spec: &ChartSpec) -> Result<Vec<u8>>;

    fn file_extension(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChartOutcome {
    Rendered { kind: ChartKind, bytes: Vec<u8> },
    Skipped { kind: ChartKind, reason: String },
}

pub struct VisualizationGenerator<'a> {
    renderer: &'a dyn ChartRenderer,
    max_series: usize,
}

impl<'a> VisualizationGenerator<'a> {
    pub fn new(renderer: &'a dyn ChartRenderer, max_series: usize) -> Self {
        Self {
            renderer,
            max_series: max_series.max(1),
        }
    }

    /// Builds every chart of the catalog, in catalog order. Specs may have no series.
    pub fn build_specs(&self, table: &AggregatedTable) -> Vec<ChartSpec> {
        ChartKind::ALL
            .iter()
            .map(|kind| {
                let mut series = match kind {
                    ChartKind::RevenueTrend => {
                        let metrics = metric_series(table, &REVENUE_METRICS);
                        if metrics.iter().any(|s| s.label == SummaryMetric::Revenue.label()) {
                            metrics
                        } else {
                            account_series(table, StatementType::ProfitAndLoss, |n| {
                                matches_any(n, &REVENUE_KEYWORDS)
                                    && !matches_any(n, &NOT_REVENUE_KEYWORDS)
                            })
                        }
                    }
                    ChartKind::ExpenseBreakdown => {
                        let metrics = metric_series(table, &EXPENSE_METRICS);
                        if metrics.is_empty() {
                            account_series(table, StatementType::ProfitAndLoss, |n| {
                                matches_any(n, &EXPENSE_KEYWORDS)
                            })
                        } else {
                            metrics
                        }
                    }
                    ChartKind::LiquidityRatios => liquidity_series(table),
                    ChartKind::VarianceToBudget => variance_series(table),
                };

                if series.len() > self.max_series {
                    debug!(
                        "Chart {}: keeping {} of {} series",
                        kind.name(),
                        self.max_series,
                        series.len()
                    );
                    series.sort_by(|a, b| b.latest_magnitude().total_cmp(&a.latest_magnitude()));
                    series.truncate(self.max_series);
                }

                ChartSpec {
                    kind: *kind,
                    title: kind.title().to_string(),
                    style: kind.style(),
                    periods: table.periods().to_vec(),
                    series,
                }
            })
            .collect()
    }

    /// Renders each sufficiently populated chart. A render failure fails the whole call.
    pub fn generate(&self, table: &AggregatedTable) -> Result<Vec<ChartOutcome>> {
        let mut outcomes = Vec::with_capacity(ChartKind::ALL.len());
        for spec in self.build_specs(table) {
            if !spec.is_sufficient() {
                let reason = spec.insufficiency_reason();
                debug!("Skipping chart {}: {}", spec.kind.name(), reason);
                outcomes.push(ChartOutcome::Skipped {
                    kind: spec.kind,
                    reason,
                });
                continue;
            }

            let bytes = self.renderer.render(&spec).map_err(|e| match e {
                FinancialReportError::Rendering { .. } => e,
                other => FinancialReportError::Rendering {
                    chart: spec.kind.name().to_string(),
                    details: other.to_string(),
                },
            })?;
            outcomes.push(ChartOutcome::Rendered {
                kind: spec.kind,
                bytes,
            });
        }

        info!(
            "Rendered {} of {} charts",
            outcomes
                .iter()
                .filter(|o| matches!(o, ChartOutcome::Rendered { .. }))
                .count(),
            outcomes.len()
        );
        Ok(outcomes)
    }

    pub fn file_extension(&self) -> &str {
        self.renderer.file_extension()
    }
}

/// Single words match the start of any word ("expense" matches "Expenses");
/// phrases match anywhere in the normalized name.
fn matches_any(normalized: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|keyword| {
        if keyword.contains(' ') {
            normalized.contains(keyword)
        } else {
            normalized
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word.starts_with(keyword))
        }
    })
}

fn to_f64(value: Option<Decimal>) -> Option<f64> {
    value.and_then(|v| v.to_f64())
}

fn row_series(table: &AggregatedTable, row: &AggregatedRow) -> ChartSeries {
    ChartSeries {
        label: row.account_name.clone(),
        values: table.periods().iter().map(|p| to_f64(row.amount(p))).collect(),
    }
}

/// Plain account rows only; totals and derived lines would double count.
fn account_series<F>(table: &AggregatedTable, statement_type: StatementType, select: F) -> Vec<ChartSeries>
where
    F: Fn(&str) -> bool,
{
    table
        .rows_for(statement_type)
        .filter(|row| row.role == RowRole::Account)
        .filter(|row| select(&normalize_account_name(&row.account_name)))
        .map(|row| row_series(table, row))
        .collect()
}

/// Summary metrics that have data, labelled with their catalog label.
fn metric_series(table: &AggregatedTable, metrics: &[SummaryMetric]) -> Vec<ChartSeries> {
    metrics
        .iter()
        .filter_map(|metric| table.metric(*metric))
        .filter(|row| row.has_data())
        .map(|row| ChartSeries {
            label: row.label.clone(),
            values: table.periods().iter().map(|p| to_f64(row.amount(p))).collect(),
        })
        .collect()
}

fn find_row<'t>(table: &'t AggregatedTable, keywords: &[&str]) -> Option<&'t AggregatedRow> {
    let rows: Vec<_> = table
        .rows_for(StatementType::BalanceSheet)
        .filter(|row| matches_any(&normalize_account_name(&row.account_name), keywords))
        .collect();
    // Prefer the section total when one exists.
    rows.iter()
        .find(|row| normalize_account_name(&row.account_name).starts_with("total "))
        .or_else(|| rows.first())
        .copied()
}

fn ratio_series(
    table: &AggregatedTable,
    label: &str,
    numerator: &AggregatedRow,
    denominator: &AggregatedRow,
) -> ChartSeries {
    let values = table
        .periods()
        .iter()
        .map(|p| match (numerator.amount(p), denominator.amount(p)) {
            (Some(n), Some(d)) if !d.is_zero() => to_f64(n.checked_div(d)),
            _ => None,
        })
        .collect();
    ChartSeries {
        label: label.to_string(),
        values,
    }
}

/// Current and cash ratios when the balance sheet has the inputs, otherwise raw balances.
fn liquidity_series(table: &AggregatedTable) -> Vec<ChartSeries> {
    let current_assets = find_row(table, &["current assets"]);
    let current_liabilities = find_row(table, &["current liabilities"]);
    let cash = find_row(table, &["cash", "bank"]);

    if let (Some(assets), Some(liabilities)) = (current_assets, current_liabilities) {
        let mut series = vec![ratio_series(table, "Current Ratio", assets, liabilities)];
        if let Some(cash) = cash {
            series.push(ratio_series(table, "Cash Ratio", cash, liabilities));
        }
        return series;
    }

    account_series(table, StatementType::BalanceSheet, |n| {
        matches_any(n, &LIQUIDITY_KEYWORDS)
    })
}

fn variance_series(table: &AggregatedTable) -> Vec<ChartSeries> {
    table
        .rows()
        .iter()
        .filter(|row| row.has_budget())
        .map(|row| ChartSeries {
            label: row.account_name.clone(),
            values: table
                .periods()
                .iter()
                .map(|p| match (row.amount(p), row.budget.get(p)) {
                    (Some(actual), Some(budget)) => to_f64(actual.checked_sub(*budget)),
                    _ => None,
                })
                .collect(),
        })
        .collect()
}

const PALETTE: [&str; 8] = [
    "#d62728", "#ff7f0e", "#1f77b4", "#2ca02c", "#9467bd", "#8c564b", "#e377c2", "#17becf",
];

/// Writes charts as standalone SVG documents.
#[derive(Debug, Clone)]
pub struct SvgChartRenderer {
    pub width: u32,
    pub height: u32,
}

impl Default for SvgChartRenderer {
    fn default() -> Self {
        Self {
            width: 800,
            height: 420,
        }
    }
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

impl SvgChartRenderer {
    fn draw(&self, spec: &ChartSpec) -> std::result::Result<String, std::fmt::Error> {
        let (width, height) = (self.width as f64, self.height as f64);
        let (left, right, top, bottom) = (70.0, 170.0, 40.0, 50.0);
        let plot_width = width - left - right;
        let plot_height = height - top - bottom;

        let values: Vec<f64> = spec.series.iter().flat_map(|s| s.values.iter().flatten().copied()).collect();
        let mut min = values.iter().copied().fold(0.0_f64, f64::min);
        let mut max = values.iter().copied().fold(0.0_f64, f64::max);
        if (max - min).abs() < f64::EPSILON {
            min -= 1.0;
            max += 1.0;
        }
        let y = |v: f64| top + plot_height - (v - min) / (max - min) * plot_height;
        let slots = spec.periods.len().max(1) as f64;
        let slot_width = plot_width / slots;
        let x = |i: usize| left + slot_width * (i as f64 + 0.5);

        let mut svg = String::new();
        writeln!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{}" height="{}" viewBox="0 0 {} {}">"#,
            self.width, self.height, self.width, self.height
        )?;
        writeln!(svg, r#"<rect width="100%" height="100%" fill="white"/>"#)?;
        writeln!(
            svg,
            r##"<rect x="{left}" y="{top}" width="{plot_width:.1}" height="{plot_height:.1}" fill="#f0f0f0"/>"##
        )?;
        writeln!(
            svg,
            r#"<text x="{:.1}" y="24" text-anchor="middle" font-family="Arial" font-size="16">{}</text>"#,
            width / 2.0,
            escape_xml(&spec.title)
        )?;
        writeln!(
            svg,
            r#"<line x1="{left}" y1="{zero:.1}" x2="{:.1}" y2="{zero:.1}" stroke="black" stroke-width="1"/>"#,
            left + plot_width,
            zero = y(0.0)
        )?;
        for (label, value) in [("max", max), ("min", min)] {
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="end" font-family="Arial" font-size="10" class="{}">{:.2}</text>"#,
                left - 6.0,
                y(value) + 4.0,
                label,
                value
            )?;
        }
        for (i, period) in spec.periods.iter().enumerate() {
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" text-anchor="middle" font-family="Arial" font-size="10">{}</text>"#,
                x(i),
                top + plot_height + 18.0,
                period
            )?;
        }

        let series_count = spec.series.len().max(1) as f64;
        for (index, series) in spec.series.iter().enumerate() {
            let colour = PALETTE[index % PALETTE.len()];
            match spec.style {
                ChartStyle::Line => {
                    // Missing periods break the line rather than dropping to zero.
                    let mut segment: Vec<String> = Vec::new();
                    let mut segments = Vec::new();
                    for (i, value) in series.values.iter().enumerate() {
                        match value {
                            Some(v) => segment.push(format!("{:.1},{:.1}", x(i), y(*v))),
                            None => segments.push(std::mem::take(&mut segment)),
                        }
                    }
                    segments.push(segment);
                    for points in segments.iter().filter(|s| !s.is_empty()) {
                        writeln!(
                            svg,
                            r#"<polyline fill="none" stroke="{}" stroke-width="2" points="{}"/>"#,
                            colour,
                            points.join(" ")
                        )?;
                    }
                }
                ChartStyle::Bar => {
                    let bar_width = slot_width * 0.8 / series_count;
                    for (i, value) in series.values.iter().enumerate() {
                        if let Some(v) = value {
                            let bar_x = x(i) - slot_width * 0.4 + bar_width * index as f64;
                            let (y0, y1) = (y(0.0), y(*v));
                            writeln!(
                                svg,
                                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}"/>"#,
                                bar_x,
                                y0.min(y1),
                                bar_width,
                                (y0 - y1).abs(),
                                colour
                            )?;
                        }
                    }
                }
            }
            let legend_y = top + 16.0 * index as f64 + 8.0;
            writeln!(
                svg,
                r#"<rect x="{:.1}" y="{:.1}" width="10" height="10" fill="{}"/>"#,
                left + plot_width + 12.0,
                legend_y,
                colour
            )?;
            writeln!(
                svg,
                r#"<text x="{:.1}" y="{:.1}" font-family="Arial" font-size="11">{}</text>"#,
                left + plot_width + 28.0,
                legend_y + 9.0,
                escape_xml(&series.label)
            )?;
        }
        writeln!(svg, "</svg>")?;
        Ok(svg)
    }
}

impl ChartRenderer for SvgChartRenderer {
    fn render(&self, spec: &ChartSpec) -> Result<Vec<u8>> {
        let rendering = |details: String| FinancialReportError::Rendering {
            chart: spec.kind.name().to_string(),
            details,
        };

        if let Some(series) = spec
            .series
            .iter()
            .find(|s| s.values.iter().flatten().any(|v| !v.is_finite()))
        {
            return Err(rendering(format!(
                "series '{}' contains a non-finite value",
                series.label
            )));
        }

        self.draw(spec)
            .map(String::into_bytes)
            .map_err(|e| rendering(e.to_string()))
    }

    fn file_extension(&self) -> &str {
        "svg"
    }
}
