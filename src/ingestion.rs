use crate::error::{FinancialReportError, Result};
use crate::schema::{Adjustment, LineItem, PeriodKey, RowRole, StatementType};
use crate::spreadsheet::read_excel_sheets;
use crate::utils::{
    checked_sum, fiscal_period_for_header, normalize_account_name, parse_amount,
    validate_fiscal_year_end_month,
};
use csv::{ReaderBuilder, StringRecord, Trim};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

const ACCOUNT_COLUMNS: [&str; 3] = ["account name", "account", "account description"];
const AMOUNT_COLUMNS: [&str; 4] = ["amount", "value", "balance", "actual"];
const ADJUSTMENT_COLUMNS: [&str; 3] = ["adjustment only", "adjustments", "adjustment"];
const DERIVED_PREFIXES: [&str; 4] = ["net ", "nett ", "gross profit", "operating profit"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementFormat {
    Csv,
    Tsv,
    /// Excel or OpenDocument workbook; the first worksheet holds the statement.
    Excel,
}

impl StatementFormat {
    /// Picks the format from the file extension.
    pub fn detect(file_name: &str) -> Result<Self> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "csv" => Ok(StatementFormat::Csv),
            "tsv" | "txt" => Ok(StatementFormat::Tsv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(StatementFormat::Excel),
            "" => Err(FinancialReportError::UnsupportedFormat(format!(
                "'{}' has no file extension",
                file_name
            ))),
            other => Err(FinancialReportError::UnsupportedFormat(format!(
                "'.{}' files are not supported (file '{}')",
                other, file_name
            ))),
        }
    }

    /// Reads the statement as rows of trimmed cell text.
    fn read_rows(&self, source: &StatementSource) -> Result<Vec<Vec<String>>> {
        let name = source.file_name.as_str();
        let delimiter = match self {
            StatementFormat::Csv => b',',
            StatementFormat::Tsv => b'\t',
            StatementFormat::Excel => {
                let sheets = read_excel_sheets(&source.bytes)
                    .map_err(|e| FinancialReportError::malformed(name, e.to_string()))?;
                return sheets
                    .into_iter()
                    .next()
                    .map(|(_, rows)| rows)
                    .ok_or_else(|| FinancialReportError::malformed(name, "workbook has no worksheets"));
            }
        };

        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .delimiter(delimiter)
            .from_reader(source.bytes.as_slice());

        reader
            .records()
            .map(|record| record.map(|r: StringRecord| r.iter().map(str::to_string).collect()))
            .collect::<std::result::Result<Vec<Vec<String>>, csv::Error>>()
            .map_err(|e| FinancialReportError::malformed(name, e.to_string()))
    }
}

/// Raw bytes of one statement spreadsheet plus what the caller knows about it.
#[derive(Debug, Clone)]
pub struct StatementSource {
    pub period: PeriodKey,
    pub statement_type: StatementType,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl StatementSource {
    pub fn new(
        period: PeriodKey,
        statement_type: StatementType,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            period,
            statement_type,
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    pub fn from_path(
        period: PeriodKey,
        statement_type: StatementType,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(period, statement_type, file_name, bytes))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconciliationPolicy {
    /// A total that does not reconcile aborts the run.
    #[default]
    Reject,
    /// Discrepancies are kept as run warnings and loading continues.
    Warn,
}

impl ReconciliationPolicy {
    /// Applies the policy to a parsed statement.
    pub fn apply(&self, statement: &str, parsed: ParsedStatement) -> Result<ParsedStatement> {
        if parsed.discrepancies.is_empty() {
            return Ok(parsed);
        }
        match self {
            ReconciliationPolicy::Reject => Err(FinancialReportError::Reconciliation {
                statement: statement.to_string(),
                details: parsed
                    .discrepancies
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
            ReconciliationPolicy::Warn => {
                for discrepancy in &parsed.discrepancies {
                    warn!("Statement '{}' does not reconcile: {}", statement, discrepancy);
                }
                Ok(parsed)
            }
        }
    }
}

impl FromStr for ReconciliationPolicy {
    type Err = FinancialReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(ReconciliationPolicy::Reject),
            "warn" => Ok(ReconciliationPolicy::Warn),
            other => Err(FinancialReportError::Config(format!(
                "unknown reconciliation policy '{}' (expected 'reject' or 'warn')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub fiscal_year_end_month: u32,
    pub reconciliation_tolerance: Decimal,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            fiscal_year_end_month: 6,
            reconciliation_tolerance: Decimal::new(1, 2),
        }
    }
}

/// A reported total that differs from the sum of the rows it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    /// The total row (or account, for a `Total` column mismatch).
    pub subject: String,
    /// `None` for a row-level `Total` column check.
    pub period: Option<PeriodKey>,
    pub reported: Decimal,
    pub computed: Decimal,
}

impl fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.period {
            Some(period) => write!(
                f,
                "'{}' in {} reports {} but its rows sum to {}",
                self.subject, period, self.reported, self.computed
            ),
            None => write!(
                f,
                "'{}' Total column reports {} but its periods sum to {}",
                self.subject, self.reported, self.computed
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStatement {
    pub line_items: Vec<LineItem>,
    /// "Adjustment Only" amounts, kept apart from the period amounts and section sums.
    pub adjustments: Vec<Adjustment>,
    pub discrepancies: Vec<Discrepancy>,
}

struct Section {
    name: String,
    normalized: String,
    sums: BTreeMap<PeriodKey, Decimal>,
}

impl Section {
    /// `None` when a running sum no longer fits a `Decimal`.
    fn add(&mut self, values: &[(PeriodKey, Decimal)]) -> Option<()> {
        for (period, amount) in values {
            let sum = self.sums.entry(*period).or_insert(Decimal::ZERO);
            *sum = sum.checked_add(*amount)?;
        }
        Some(())
    }
}

struct Layout {
    account_column: usize,
    value_columns: Vec<(usize, String, PeriodKey)>,
    total_column: Option<usize>,
    adjustment_column: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct StatementLoader {
    options: LoaderOptions,
}

impl StatementLoader {
    pub fn new(options: LoaderOptions) -> Result<Self> {
        validate_fiscal_year_end_month(options.fiscal_year_end_month)?;
        if options.reconciliation_tolerance.is_sign_negative() {
            return Err(FinancialReportError::Config(
                "reconciliation tolerance must not be negative".to_string(),
            ));
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Loads a statement, rejecting it when any total fails to reconcile.
    pub fn load(&self, source: &StatementSource) -> Result<Vec<LineItem>> {
        let parsed = self.parse(source)?;
        Ok(ReconciliationPolicy::Reject
            .apply(&source.file_name, parsed)?
            .line_items)
    }

    /// Parses a statement, returning reconciliation problems instead of failing on them.
    pub fn parse(&self, source: &StatementSource) -> Result<ParsedStatement> {
        let format = StatementFormat::detect(&source.file_name)?;
        let name = source.file_name.as_str();
        let rows = format.read_rows(source)?;

        if rows.iter().all(|r| r.iter().all(|c| c.trim().is_empty())) {
            return Err(FinancialReportError::malformed(name, "statement is empty"));
        }

        let (header_index, layout) = self.detect_layout(source, &rows)?;
        debug!(
            "Statement '{}': header on row {}, {} value column(s){}",
            name,
            header_index + 1,
            layout.value_columns.len(),
            if layout.adjustment_column.is_some() { " and an adjustment column" } else { "" }
        );

        let tolerance = self.options.reconciliation_tolerance;
        let mut parsed = ParsedStatement::default();
        let mut sections: Vec<Section> = Vec::new();

        for (offset, row) in rows.iter().enumerate().skip(header_index + 1) {
            let row_number = offset + 1;
            let account = cell(row, layout.account_column).trim();
            let overflow = || {
                FinancialReportError::malformed(
                    name,
                    format!("row {}: amounts overflow the running totals", row_number),
                )
            };

            let mut values = Vec::new();
            for (column, header, period) in &layout.value_columns {
                if let Some(amount) = amount_at(name, row, *column, header, row_number)? {
                    values.push((*period, amount));
                }
            }
            let reported_total = match layout.total_column {
                Some(column) => amount_at(name, row, column, "Total", row_number)?,
                None => None,
            };
            let adjustment = match layout.adjustment_column {
                Some(column) => amount_at(name, row, column, "Adjustment Only", row_number)?,
                None => None,
            };

            if account.is_empty() {
                if values.is_empty() && reported_total.is_none() && adjustment.is_none() {
                    continue;
                }
                return Err(FinancialReportError::malformed(
                    name,
                    format!("row {} has amounts but no account name", row_number),
                ));
            }

            let normalized = normalize_account_name(account);
            let role = if normalized.starts_with("total ") {
                RowRole::Total
            } else if is_derived(&normalized) {
                RowRole::Derived
            } else {
                RowRole::Account
            };

            if let Some(amount) = adjustment {
                parsed.adjustments.push(Adjustment {
                    account_name: account.to_string(),
                    statement_type: source.statement_type,
                    fiscal_year: source.period.fiscal_year,
                    amount,
                    role,
                });
            }

            if values.is_empty() {
                if reported_total.is_none() && adjustment.is_none() {
                    sections.push(Section {
                        name: account.to_string(),
                        normalized,
                        sums: BTreeMap::new(),
                    });
                }
                continue;
            }

            if let Some(reported) = reported_total {
                let computed = checked_sum(values.iter().map(|(_, v)| *v)).ok_or_else(overflow)?;
                let with_adjustment = adjustment.and_then(|a| computed.checked_add(a));
                if !within(tolerance, reported, computed)
                    && !with_adjustment.is_some_and(|sum| within(tolerance, reported, sum))
                {
                    parsed.discrepancies.push(Discrepancy {
                        subject: account.to_string(),
                        period: None,
                        reported,
                        computed,
                    });
                }
            }

            let closed = normalized
                .strip_prefix("total ")
                .and_then(|target| sections.iter().rposition(|s| s.normalized == target));

            if let Some(position) = closed {
                while sections.len() > position + 1 {
                    if let Some(nested) = sections.pop() {
                        debug!("Section '{}' in '{}' has no total row", nested.name, name);
                        let nested_values: Vec<_> = nested.sums.into_iter().collect();
                        if let Some(parent) = sections.last_mut() {
                            parent.add(&nested_values).ok_or_else(overflow)?;
                        }
                    }
                }
                if let Some(section) = sections.pop() {
                    for (period, reported) in &values {
                        let computed = section.sums.get(period).copied().unwrap_or(Decimal::ZERO);
                        if !within(tolerance, *reported, computed) {
                            parsed.discrepancies.push(Discrepancy {
                                subject: account.to_string(),
                                period: Some(*period),
                                reported: *reported,
                                computed,
                            });
                        }
                    }
                }
                if let Some(parent) = sections.last_mut() {
                    parent.add(&values).ok_or_else(overflow)?;
                }
            } else if role == RowRole::Account {
                if let Some(section) = sections.last_mut() {
                    section.add(&values).ok_or_else(overflow)?;
                }
            }

            parsed.line_items.extend(values.into_iter().map(|(period, amount)| {
                LineItem::new(account, period, amount, source.statement_type).with_role(role)
            }));
        }

        debug!(
            "Statement '{}' parsed: {} line item(s), {} adjustment(s), {} discrepancy(ies)",
            name,
            parsed.line_items.len(),
            parsed.adjustments.len(),
            parsed.discrepancies.len()
        );
        Ok(parsed)
    }

    /// Loads every source under one policy, concatenating line items in input order.
    pub fn load_all(
        &self,
        sources: &[StatementSource],
        policy: ReconciliationPolicy,
    ) -> Result<ParsedStatement> {
        let mut combined = ParsedStatement::default();
        for source in sources {
            let parsed = policy.apply(&source.file_name, self.parse(source)?)?;
            combined.line_items.extend(parsed.line_items);
            combined.adjustments.extend(parsed.adjustments);
            combined.discrepancies.extend(parsed.discrepancies);
        }
        Ok(combined)
    }

    fn detect_layout(&self, source: &StatementSource, rows: &[Vec<String>]) -> Result<(usize, Layout)> {
        let name = source.file_name.as_str();
        let (header_index, header) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| {
                row.iter()
                    .any(|c| ACCOUNT_COLUMNS.contains(&header_key(c).as_str()))
            })
            .ok_or_else(|| {
                FinancialReportError::malformed(name, "missing 'Account Name' column")
            })?;

        let headers: Vec<String> = header.iter().map(|c| header_key(c)).collect();
        let account_column = headers
            .iter()
            .position(|h| ACCOUNT_COLUMNS.contains(&h.as_str()))
            .ok_or_else(|| {
                FinancialReportError::malformed(name, "missing 'Account Name' column")
            })?;

        let mut value_columns = Vec::new();
        for (index, raw) in header.iter().enumerate() {
            if index == account_column {
                continue;
            }
            if let Some(period) = fiscal_period_for_header(raw, self.options.fiscal_year_end_month)
            {
                value_columns.push((
                    index,
                    raw.trim().to_string(),
                    PeriodKey::new(source.period.fiscal_year, period),
                ));
            }
        }

        let (total_column, adjustment_column) = if value_columns.is_empty() {
            (None, None)
        } else {
            (
                headers.iter().position(|h| h == "total"),
                headers
                    .iter()
                    .position(|h| ADJUSTMENT_COLUMNS.contains(&h.as_str())),
            )
        };

        if value_columns.is_empty() {
            let amount = headers
                .iter()
                .position(|h| AMOUNT_COLUMNS.contains(&h.as_str()))
                .ok_or_else(|| {
                    FinancialReportError::malformed(
                        name,
                        "no amount column and no month columns in the header row",
                    )
                })?;
            value_columns.push((amount, header[amount].trim().to_string(), source.period));
        }

        Ok((
            header_index,
            Layout {
                account_column,
                value_columns,
                total_column,
                adjustment_column,
            },
        ))
    }
}

fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

fn amount_at(
    statement: &str,
    row: &[String],
    column: usize,
    header: &str,
    row_number: usize,
) -> Result<Option<Decimal>> {
    parse_amount(cell(row, column)).map_err(|e| {
        FinancialReportError::malformed(
            statement,
            format!("row {}, column '{}': {}", row_number, header, e),
        )
    })
}

/// `false` also when the difference itself does not fit a `Decimal`.
fn within(tolerance: Decimal, reported: Decimal, computed: Decimal) -> bool {
    reported
        .checked_sub(computed)
        .is_some_and(|difference| difference.abs() <= tolerance)
}

fn header_key(raw: &str) -> String {
    normalize_account_name(raw.trim_start_matches('\u{feff}'))
}

fn is_derived(normalized: &str) -> bool {
    DERIVED_PREFIXES.iter().any(|p| normalized.starts_with(p))
}
