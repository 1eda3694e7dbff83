// Prompt text for the narrative report stage

use crate::error::Result;
use crate::llm::types::ReportNarrative;
use crate::schema::{AggregatedTable, Deltas};
use rust_decimal::Decimal;
use schemars::schema_for;
use std::collections::BTreeSet;

pub const SYSTEM_INSTRUCTIONS: &str = r#"
You are a senior financial analyst preparing a management report from a multi-period
summary table of Profit-and-Loss (PL) and Balance Sheet (BS) accounts.

## YOUR MISSION
1. Review every metric year-over-year (YoY): state the growth or decline, call out
   significant movements, and give plausible business or accounting explanations.
2. Where budget figures exist, compare actual against budget, identify the largest
   variances and explain their likely drivers.
3. Give focused attention to loan accounts (bank and partner loans, interest expense)
   and to profitability (net profit, gross margin). Conclude on the entity's ability
   to service its debt and on the quality of its earnings.
4. Refer to the supplied charts where they support a point.

## RULES
- Write in English, in a professional and precise register.
- Use only the figures given below. Never invent numbers.
- "n/a" means the figure is not comparable (missing data); say so rather than guessing.
- Respond with a single JSON object matching the schema at the end of this prompt.
"#;

fn fmt_amount(value: Option<Decimal>) -> String {
    value
        .map(|v| v.round_dp(2).to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_deltas(deltas: &Deltas) -> String {
    format!(
        "prior period {}, prior year {}, budget variance {}",
        fmt_amount(deltas.prior_period_delta),
        fmt_amount(deltas.prior_year_delta),
        fmt_amount(deltas.budget_variance)
    )
}

/// Builds the full prompt for one report request.
pub fn build_report_prompt(
    table: &AggregatedTable,
    entity: Option<&str>,
    chart_names: &[String],
    totals_table: &str,
) -> Result<String> {
    let mut prompt = String::from(SYSTEM_INSTRUCTIONS);
    let current = table
        .current_period()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "n/a".to_string());

    prompt.push_str("\n## CONTEXT\n");
    if let Some(entity) = entity {
        prompt.push_str(&format!("Entity: {}\n", entity));
    }
    prompt.push_str(&format!(
        "Periods: {}\n",
        table
            .periods()
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    ));

    let matched: Vec<_> = table.metrics().iter().filter(|m| m.has_data()).collect();
    if !matched.is_empty() {
        prompt.push_str("\n## SUMMARY METRICS\n");
        for metric in matched {
            let years: Vec<String> = metric
                .amounts
                .keys()
                .map(|p| p.fiscal_year)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|year| {
                    let mut text = format!("FY{} {}", year, fmt_amount(metric.fiscal_year_total(year)));
                    if let Some(adjustment) = metric.adjustment(year) {
                        text.push_str(&format!(" (adjustment only {})", adjustment.round_dp(2)));
                    }
                    text
                })
                .collect();
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                metric.statement_type,
                metric.label,
                years.join(", ")
            ));
        }
    }

    prompt.push_str(&format!("\n## METRICS FOR {}\n", current));
    for row in table.rows() {
        prompt.push_str(&format!(
            "- [{}] {}: {} ({})\n",
            row.statement_type,
            row.account_name,
            fmt_amount(row.latest_amount()),
            fmt_deltas(&row.deltas)
        ));
    }

    prompt.push_str(&format!("\n## TOTALS BY FISCAL YEAR\n{}\n", totals_table));

    if !chart_names.is_empty() {
        prompt.push_str("## AVAILABLE CHARTS\n");
        for name in chart_names {
            prompt.push_str(&format!("- {}\n", name));
        }
    }

    let schema = serde_json::to_string_pretty(&schema_for!(ReportNarrative))?;
    prompt.push_str(&format!("\n## RESPONSE SCHEMA\n{}\n", schema));
    Ok(prompt)
}
