use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::FinancialReportError;
use crate::metrics::{MetricRow, SummaryMetric};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub enum StatementType {
    /// Profit-and-Loss statement: activity over a period.
    #[serde(rename = "PL")]
    ProfitAndLoss,
    /// Balance Sheet: balances at the end of a period.
    #[serde(rename = "BS")]
    BalanceSheet,
}

impl StatementType {
    pub const ALL: [StatementType; 2] = [StatementType::ProfitAndLoss, StatementType::BalanceSheet];

    pub fn code(&self) -> &'static str {
        match self {
            StatementType::ProfitAndLoss => "PL",
            StatementType::BalanceSheet => "BS",
        }
    }
}

impl fmt::Display for StatementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A fiscal period, ordered by year and then by period within the year.
///
/// The text form is `2024-P01`. Parsing also accepts quarter (`2024-Q1`),
/// plain numeric (`2024-03`) and `FY`-prefixed (`FY2024-P03`) forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    pub fiscal_year: i32,
    pub fiscal_period: u32,
}

impl PeriodKey {
    pub fn new(fiscal_year: i32, fiscal_period: u32) -> Self {
        Self {
            fiscal_year,
            fiscal_period,
        }
    }

    /// The same fiscal period one fiscal year earlier.
    pub fn prior_year(&self) -> PeriodKey {
        PeriodKey::new(self.fiscal_year - 1, self.fiscal_period)
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-P{:02}", self.fiscal_year, self.fiscal_period)
    }
}

impl FromStr for PeriodKey {
    type Err = FinancialReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FinancialReportError::InvalidPeriod(s.to_string());
        let trimmed = s.trim();
        let without_prefix = trimmed
            .strip_prefix("FY")
            .or_else(|| trimmed.strip_prefix("fy"))
            .unwrap_or(trimmed);

        let (year, period) = without_prefix
            .split_once(['-', ' ', '/'])
            .ok_or_else(invalid)?;

        let fiscal_year: i32 = year.trim().parse().map_err(|_| invalid())?;
        let period = period.trim();
        let digits = period
            .strip_prefix(['Q', 'q', 'P', 'p', 'M', 'm'])
            .unwrap_or(period);
        let fiscal_period: u32 = digits.parse().map_err(|_| invalid())?;

        if fiscal_period == 0 {
            return Err(invalid());
        }

        Ok(PeriodKey::new(fiscal_year, fiscal_period))
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = FinancialReportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

/// What a statement row stands for. Only `Account` rows are plotted as accounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRole {
    #[default]
    Account,
    /// "Total ..." row closing a section.
    Total,
    /// Computed line such as "Net Profit" or "Gross Profit".
    Derived,
}

/// One amount for one account in one period, as read from a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub account_name: String,
    pub period: PeriodKey,
    pub amount: Decimal,
    pub statement_type: StatementType,
    #[serde(default)]
    pub role: RowRole,
}

impl LineItem {
    pub fn new(
        account_name: impl Into<String>,
        period: PeriodKey,
        amount: Decimal,
        statement_type: StatementType,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            period,
            amount,
            statement_type,
            role: RowRole::Account,
        }
    }

    pub fn with_role(mut self, role: RowRole) -> Self {
        self.role = role;
        self
    }
}

/// Year-end adjustment booked outside the monthly columns ("Adjustment Only").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub account_name: String,
    pub statement_type: StatementType,
    pub fiscal_year: i32,
    pub amount: Decimal,
    #[serde(default)]
    pub role: RowRole,
}

/// Headline comparisons for the latest loaded period. `None` means "not comparable".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deltas {
    pub prior_period_delta: Option<Decimal>,
    pub prior_year_delta: Option<Decimal>,
    pub budget_variance: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub account_name: String,
    pub statement_type: StatementType,
    pub role: RowRole,
    /// One entry per period of the table; missing data stays `None`.
    pub amounts: BTreeMap<PeriodKey, Option<Decimal>>,
    /// Budgeted amounts, only for periods that have a budget figure.
    pub budget: BTreeMap<PeriodKey, Decimal>,
    /// Change from the previous loaded period, keyed by the later period.
    pub period_over_period: BTreeMap<PeriodKey, Option<Decimal>>,
    pub deltas: Deltas,
    /// Year-end adjustments by fiscal year, kept out of the period amounts.
    #[serde(default)]
    pub adjustments: BTreeMap<i32, Decimal>,
}

impl AggregatedRow {
    pub fn amount(&self, period: &PeriodKey) -> Option<Decimal> {
        self.amounts.get(period).copied().flatten()
    }

    pub fn latest_amount(&self) -> Option<Decimal> {
        self.amounts.values().rev().find_map(|v| *v)
    }

    pub fn has_budget(&self) -> bool {
        !self.budget.is_empty()
    }
}

/// Degraded-but-successful condition recorded as metadata, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    pub subject: String,
    pub reason: String,
}

impl Degradation {
    pub fn new(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

/// Output of the summary aggregator. Read-only once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedTable {
    periods: Vec<PeriodKey>,
    rows: Vec<AggregatedRow>,
    metrics: Vec<MetricRow>,
    degradations: Vec<Degradation>,
}

impl AggregatedTable {
    pub(crate) fn new(
        periods: Vec<PeriodKey>,
        rows: Vec<AggregatedRow>,
        metrics: Vec<MetricRow>,
        degradations: Vec<Degradation>,
    ) -> Self {
        Self {
            periods,
            rows,
            metrics,
            degradations,
        }
    }

    /// Loaded periods in ascending order.
    pub fn periods(&self) -> &[PeriodKey] {
        &self.periods
    }

    pub fn rows(&self) -> &[AggregatedRow] {
        &self.rows
    }

    /// Summary metrics in catalog order, one per metric even when nothing matched.
    pub fn metrics(&self) -> &[MetricRow] {
        &self.metrics
    }

    pub fn metric(&self, metric: SummaryMetric) -> Option<&MetricRow> {
        self.metrics.iter().find(|row| row.metric == metric)
    }

    pub fn degradations(&self) -> &[Degradation] {
        &self.degradations
    }

    pub fn current_period(&self) -> Option<PeriodKey> {
        self.periods.last().copied()
    }

    pub fn rows_for(
        &self,
        statement_type: StatementType,
    ) -> impl Iterator<Item = &AggregatedRow> + '_ {
        self.rows
            .iter()
            .filter(move |row| row.statement_type == statement_type)
    }

    pub fn find(&self, statement_type: StatementType, account_name: &str) -> Option<&AggregatedRow> {
        self.rows
            .iter()
            .find(|row| row.statement_type == statement_type && row.account_name == account_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_key_parsing() {
        assert_eq!("2024-Q1".parse::<PeriodKey>().unwrap(), PeriodKey::new(2024, 1));
        assert_eq!("2024-P03".parse::<PeriodKey>().unwrap(), PeriodKey::new(2024, 3));
        assert_eq!("2024-11".parse::<PeriodKey>().unwrap(), PeriodKey::new(2024, 11));
        assert_eq!("FY2025-P12".parse::<PeriodKey>().unwrap(), PeriodKey::new(2025, 12));
        assert!("2024".parse::<PeriodKey>().is_err());
        assert!("2024-Q0".parse::<PeriodKey>().is_err());
        assert!("next-year".parse::<PeriodKey>().is_err());
    }

    #[test]
    fn test_period_key_ordering() {
        let mut keys = vec![
            PeriodKey::new(2024, 2),
            PeriodKey::new(2023, 12),
            PeriodKey::new(2024, 1),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                PeriodKey::new(2023, 12),
                PeriodKey::new(2024, 1),
                PeriodKey::new(2024, 2)
            ]
        );
        assert_eq!(PeriodKey::new(2024, 3).prior_year(), PeriodKey::new(2023, 3));
    }

    #[test]
    fn test_period_key_serializes_as_string_map_key() {
        let mut amounts = BTreeMap::new();
        amounts.insert(PeriodKey::new(2024, 1), Some(Decimal::new(1250, 2)));
        amounts.insert(PeriodKey::new(2024, 2), None);

        let json = serde_json::to_string(&amounts).unwrap();
        assert_eq!(json, r#"{"2024-P01":"12.50","2024-P02":null}"#);

        let back: BTreeMap<PeriodKey, Option<Decimal>> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amounts);
    }

    #[test]
    fn test_line_item_role_defaults_to_account() {
        let json = r#"{"account_name":"Sales","period":"2024-P01","amount":"10","statement_type":"PL"}"#;
        let item: LineItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.role, RowRole::Account);

        let total = item.with_role(RowRole::Total);
        assert!(serde_json::to_string(&total).unwrap().contains(r#""role":"total""#));
    }

    #[test]
    fn test_statement_type_codes() {
        assert_eq!(StatementType::ProfitAndLoss.to_string(), "PL");
        assert_eq!(
            serde_json::to_string(&StatementType::BalanceSheet).unwrap(),
            "\"BS\""
        );
    }
}
