use crate::error::FinancialReportError;
use crate::llm::prompts::build_report_prompt;
use crate::llm::retry::{call_with_retry, RetryPolicy, RetryReport};
use crate::llm::types::{parse_narrative, ReportNarrative, TextGenerator};
use crate::metrics::fiscal_year_total;
use crate::schema::AggregatedTable;
use log::info;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::time::Duration;

/// Markdown table of totals per fiscal year.
///
/// Lists the summary metrics when any of them matched, otherwise every account.
/// PL rows sum the fiscal year's periods; BS rows take the last balance of the year.
/// Years with no data (or a sum too large to represent) are left blank.
pub fn fiscal_year_totals_markdown(table: &AggregatedTable) -> String {
    let years: Vec<i32> = table
        .periods()
        .iter()
        .map(|p| p.fiscal_year)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut out = String::from("| Account |");
    for year in &years {
        out.push_str(&format!(" FY{} |", year));
    }
    out.push_str("\n|---|");
    out.push_str(&"---:|".repeat(years.len()));
    out.push('\n');

    let mut push_row = |label: String, totals: Vec<Option<Decimal>>| {
        out.push_str(&format!("| {} |", label));
        for total in totals {
            match total {
                Some(total) => out.push_str(&format!(" {} |", total.round_dp(2))),
                None => out.push_str(" |"),
            }
        }
        out.push('\n');
    };

    let metrics: Vec<_> = table.metrics().iter().filter(|m| m.has_data()).collect();
    if metrics.is_empty() {
        for row in table.rows() {
            push_row(
                format!("{} ({})", row.account_name, row.statement_type),
                years
                    .iter()
                    .map(|year| fiscal_year_total(row.statement_type, &row.amounts, *year))
                    .collect(),
            );
        }
    } else {
        for metric in metrics {
            push_row(
                format!("{} ({})", metric.label, metric.statement_type),
                years.iter().map(|year| metric.fiscal_year_total(*year)).collect(),
            );
        }
    }
    out
}

/// Renders the narrative into the final Markdown document.
pub fn render_document(
    table: &AggregatedTable,
    narrative: &ReportNarrative,
    entity: Option<&str>,
    chart_names: &[String],
) -> String {
    let mut doc = format!("# {}\n\n", narrative.title.trim());
    if let Some(entity) = entity {
        doc.push_str(&format!("**Entity:** {}\n\n", entity));
    }
    if let (Some(first), Some(last)) = (table.periods().first(), table.periods().last()) {
        doc.push_str(&format!("**Periods:** {} to {}\n\n", first, last));
    }

    doc.push_str(&format!(
        "## Period Totals\n\n{}\n",
        fiscal_year_totals_markdown(table)
    ));
    doc.push_str(&format!(
        "## Executive Summary\n\n{}\n\n",
        narrative.executive_summary.trim()
    ));
    for section in &narrative.sections {
        doc.push_str(&format!(
            "## {}\n\n{}\n\n",
            section.heading.trim(),
            section.content.trim()
        ));
    }
    if !chart_names.is_empty() {
        doc.push_str("## Charts\n\n");
        for name in chart_names {
            doc.push_str(&format!("- {}\n", name));
        }
    }
    doc
}

/// Requests the narrative under the retry policy and renders the report document.
pub struct ReportGenerator<'a> {
    generator: &'a dyn TextGenerator,
    policy: &'a RetryPolicy,
    timeout: Duration,
    max_tokens: u32,
    entity: Option<String>,
}

impl<'a> ReportGenerator<'a> {
    pub fn new(generator: &'a dyn TextGenerator, policy: &'a RetryPolicy) -> Self {
        Self {
            generator,
            policy,
            timeout: Duration::from_secs(60),
            max_tokens: 4096,
            entity: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_entity(mut self, entity: Option<String>) -> Self {
        self.entity = entity;
        self
    }

    pub async fn generate(&self, table: &AggregatedTable, chart_names: &[String]) -> RetryReport<String> {
        let totals = fiscal_year_totals_markdown(table);
        let prompt = match build_report_prompt(table, self.entity.as_deref(), chart_names, &totals) {
            Ok(prompt) => prompt,
            Err(e) => {
                return RetryReport {
                    attempts: 0,
                    elapsed: Duration::ZERO,
                    result: Err(e),
                }
            }
        };

        info!(
            "Requesting narrative from {} ({} prompt chars, {} chart(s))",
            self.generator.name(),
            prompt.len(),
            chart_names.len()
        );

        let generator = self.generator;
        let prompt = prompt.as_str();
        let (max_tokens, timeout) = (self.max_tokens, self.timeout);
        let report = call_with_retry(self.policy, timeout, "Narrative request", move |_| async move {
            let body = generator.complete(prompt, max_tokens, timeout).await?;
            parse_narrative(&body)
        })
        .await;

        RetryReport {
            attempts: report.attempts,
            elapsed: report.elapsed,
            result: report.result.and_then(|narrative| {
                if narrative.title.trim().is_empty() {
                    return Err(FinancialReportError::UpstreamContent(
                        "narrative has an empty title".to_string(),
                    ));
                }
                Ok(render_document(
                    table,
                    &narrative,
                    self.entity.as_deref(),
                    chart_names,
                ))
            }),
        }
    }
}
