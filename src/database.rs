use crate::error::{FinancialReportError, Result};
use crate::schema::{AggregatedTable, StatementType};
use crate::spreadsheet::{Sheet, SpreadsheetIo, Workbook};
use crate::utils::normalize_account_name;
use chrono::{DateTime, SecondsFormat, Utc};
use log::debug;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};

pub const SCHEMA_VERSION: &str = "1.0";
pub const SUMMARY_SHEET: &str = "Summary";
pub const METADATA_SHEET: &str = "Metadata";
pub const ACCOUNT_COLUMN: &str = "Account Name";
pub const PRIOR_PERIOD_COLUMN: &str = "Prior Period Delta";
pub const PRIOR_YEAR_COLUMN: &str = "Prior Year Delta";
pub const BUDGET_VARIANCE_COLUMN: &str = "Budget Variance";

fn cell(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

/// Writes the aggregated table as a workbook with one sheet per statement type.
pub struct DatabaseExporter<'a> {
    io: &'a dyn SpreadsheetIo,
}

impl<'a> DatabaseExporter<'a> {
    pub fn new(io: &'a dyn SpreadsheetIo) -> Self {
        Self { io }
    }

    /// Lays out the fixed workbook schema. `generated_at` lands only in the metadata sheet,
    /// so identical tables give identical data sheets.
    pub fn build_workbook(table: &AggregatedTable, generated_at: DateTime<Utc>) -> Result<Workbook> {
        check_collisions(table)?;

        let mut columns = vec![ACCOUNT_COLUMN.to_string()];
        columns.extend(table.periods().iter().map(|p| p.to_string()));
        columns.extend(
            [PRIOR_PERIOD_COLUMN, PRIOR_YEAR_COLUMN, BUDGET_VARIANCE_COLUMN]
                .iter()
                .map(|c| c.to_string()),
        );

        let mut sheets = Vec::with_capacity(StatementType::ALL.len() + 2);
        for statement_type in StatementType::ALL {
            let mut sheet = Sheet::new(statement_type.code(), columns.clone());
            for row in table.rows_for(statement_type) {
                let mut cells = Vec::with_capacity(columns.len());
                cells.push(Some(row.account_name.clone()));
                cells.extend(table.periods().iter().map(|p| cell(row.amount(p))));
                cells.push(cell(row.deltas.prior_period_delta));
                cells.push(cell(row.deltas.prior_year_delta));
                cells.push(cell(row.deltas.budget_variance));
                sheet.rows.push(cells);
            }
            sheets.push(sheet);
        }
        sheets.push(summary_sheet(table));

        let mut metadata = Sheet::new(METADATA_SHEET, vec!["Key".into(), "Value".into()]);
        metadata.rows.push(vec![
            Some("generated_at".into()),
            Some(generated_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ]);
        metadata.rows.push(vec![
            Some("schema_version".into()),
            Some(SCHEMA_VERSION.into()),
        ]);
        sheets.push(metadata);

        Ok(Workbook { sheets })
    }

    pub fn export(&self, table: &AggregatedTable, generated_at: DateTime<Utc>) -> Result<Vec<u8>> {
        let workbook = Self::build_workbook(table, generated_at)?;
        let bytes = self.io.serialize(&workbook)?;
        debug!(
            "Exported {} rows into a {} byte workbook",
            table.rows().len(),
            bytes.len()
        );
        Ok(bytes)
    }

    pub fn file_extension(&self) -> &str {
        self.io.file_extension()
    }
}

/// Summary metrics with, per fiscal year, the year-end adjustment and the
/// fiscal-year total (which leaves the adjustment out).
fn summary_sheet(table: &AggregatedTable) -> Sheet {
    let years: BTreeSet<i32> = table.periods().iter().map(|p| p.fiscal_year).collect();
    let mut columns = vec![ACCOUNT_COLUMN.to_string()];
    columns.extend(table.periods().iter().map(|p| p.to_string()));
    for year in &years {
        columns.push(format!("Adjustment Only FY{}", year));
        columns.push(format!("Total FY{}", year));
    }

    let mut sheet = Sheet::new(SUMMARY_SHEET, columns);
    for metric in table.metrics() {
        let mut cells = vec![Some(metric.label.clone())];
        cells.extend(table.periods().iter().map(|p| cell(metric.amount(p))));
        for year in &years {
            cells.push(cell(metric.adjustment(*year)));
            cells.push(cell(metric.fiscal_year_total(*year)));
        }
        sheet.rows.push(cells);
    }
    sheet
}

/// Accounts are never merged across statement types, even when only case differs.
fn check_collisions(table: &AggregatedTable) -> Result<()> {
    let mut seen: HashMap<String, (StatementType, &str)> = HashMap::new();
    for row in table.rows() {
        let key = normalize_account_name(&row.account_name);
        if let Some((statement_type, original)) = seen.get(&key) {
            if *statement_type != row.statement_type {
                return Err(FinancialReportError::Serialization(format!(
                    "account '{}' ({}) collides with '{}' ({})",
                    row.account_name, row.statement_type, original, statement_type
                )));
            }
            continue;
        }
        seen.insert(key, (row.statement_type, row.account_name.as_str()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LineItem, PeriodKey};
    use crate::spreadsheet::{ExcelWorkbookIo, JsonWorkbookIo};
    use crate::summary::SummaryAggregator;
    use chrono::TimeZone;

    fn table(items: &[LineItem]) -> AggregatedTable {
        SummaryAggregator::new().aggregate(items).unwrap()
    }

    fn items() -> Vec<LineItem> {
        let q1 = PeriodKey::new(2024, 1);
        let q2 = PeriodKey::new(2024, 2);
        vec![
            LineItem::new("Sales", q1, Decimal::new(100, 0), StatementType::ProfitAndLoss),
            LineItem::new("Sales", q2, Decimal::new(120, 0), StatementType::ProfitAndLoss),
            LineItem::new("Grants", q1, Decimal::new(5, 0), StatementType::ProfitAndLoss),
            LineItem::new("Cash", q2, Decimal::new(900, 0), StatementType::BalanceSheet),
        ]
    }

    #[test]
    fn test_fixed_layout() {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let workbook = DatabaseExporter::build_workbook(&table(&items()), at).unwrap();

        let names: Vec<_> = workbook.sheets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["PL", "BS", SUMMARY_SHEET, METADATA_SHEET]);

        let pl = workbook.sheet("PL").unwrap();
        assert_eq!(
            pl.columns,
            vec![
                "Account Name",
                "2024-P01",
                "2024-P02",
                "Prior Period Delta",
                "Prior Year Delta",
                "Budget Variance"
            ]
        );
        assert_eq!(pl.cell("Sales", PRIOR_PERIOD_COLUMN), Some("20"));
        assert_eq!(pl.cell("Grants", "2024-P02"), None);
        assert_eq!(pl.cell("Grants", PRIOR_PERIOD_COLUMN), None);

        let bs = workbook.sheet("BS").unwrap();
        assert_eq!(bs.cell("Cash", "2024-P01"), None);
        assert_eq!(bs.cell("Cash", "2024-P02"), Some("900"));
    }

    #[test]
    fn test_export_is_deterministic_apart_from_timestamp() {
        let table = table(&items());
        let io = JsonWorkbookIo::default();
        let exporter = DatabaseExporter::new(&io);
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        assert_eq!(exporter.export(&table, at).unwrap(), exporter.export(&table, at).unwrap());

        let first = DatabaseExporter::build_workbook(&table, at).unwrap();
        let second = DatabaseExporter::build_workbook(&table, later).unwrap();
        assert_eq!(first.sheets[..3], second.sheets[..3]);
        assert_ne!(first.sheet(METADATA_SHEET), second.sheet(METADATA_SHEET));
    }

    #[test]
    fn test_cross_statement_collision_is_rejected() {
        let p = PeriodKey::new(2024, 1);
        let items = vec![
            LineItem::new("Loan", p, Decimal::new(10, 0), StatementType::ProfitAndLoss),
            LineItem::new("LOAN", p, Decimal::new(500, 0), StatementType::BalanceSheet),
        ];
        let err = DatabaseExporter::build_workbook(&table(&items), Utc::now()).unwrap_err();
        assert!(matches!(err, FinancialReportError::Serialization(_)));
    }

    #[test]
    fn test_summary_sheet_lists_every_metric() {
        use crate::metrics::SummaryMetric;
        use crate::schema::{Adjustment, RowRole};

        let p1 = PeriodKey::new(2024, 1);
        let p2 = PeriodKey::new(2024, 2);
        let items = vec![
            LineItem::new("Total Income", p1, Decimal::new(100, 0), StatementType::ProfitAndLoss)
                .with_role(RowRole::Total),
            LineItem::new("Total Income", p2, Decimal::new(150, 0), StatementType::ProfitAndLoss)
                .with_role(RowRole::Total),
        ];
        let adjustments = vec![Adjustment {
            account_name: "Total Income".into(),
            statement_type: StatementType::ProfitAndLoss,
            fiscal_year: 2024,
            amount: Decimal::new(-20, 0),
            role: RowRole::Total,
        }];
        let table = SummaryAggregator::new()
            .with_adjustments(&adjustments)
            .aggregate(&items)
            .unwrap();

        let workbook = DatabaseExporter::build_workbook(&table, Utc::now()).unwrap();
        let summary = workbook.sheet(SUMMARY_SHEET).unwrap();
        assert_eq!(
            summary.columns,
            vec!["Account Name", "2024-P01", "2024-P02", "Adjustment Only FY2024", "Total FY2024"]
        );
        assert_eq!(summary.rows.len(), SummaryMetric::ALL.len());
        assert_eq!(summary.cell("Revenue", "2024-P02"), Some("150"));
        assert_eq!(summary.cell("Revenue", "Adjustment Only FY2024"), Some("-20"));
        assert_eq!(summary.cell("Revenue", "Total FY2024"), Some("250"));
        assert_eq!(summary.cell("Total Equity", "Total FY2024"), None);
    }

    #[test]
    fn test_xlsx_export_reads_back() {
        let at = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let io = ExcelWorkbookIo::default();
        let exporter = DatabaseExporter::new(&io);
        assert_eq!(exporter.file_extension(), "xlsx");

        let bytes = exporter.export(&table(&items()), at).unwrap();
        let back = ExcelWorkbookIo::read_workbook(&bytes).unwrap();
        assert_eq!(back, DatabaseExporter::build_workbook(&table(&items()), at).unwrap());
    }
}
