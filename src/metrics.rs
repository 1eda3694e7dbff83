//! Fixed catalog of summary metrics projected from the aggregated statement rows.
//!
//! Each metric is either one matching row (a section total such as "Total Income")
//! or the sum of every row that matches a rule (all NAB loan accounts, for example).

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::schema::{AggregatedRow, Degradation, PeriodKey, RowRole, StatementType};
use crate::utils::{checked_sum, normalize_account_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMetric {
    Revenue,
    CostOfSales,
    AdministrativeExpenses,
    LoanInterestNab,
    LoanInterestPartners,
    OtherIncome,
    NetProfit,
    CashBalance,
    LoanPayableNab,
    LoanPayablesPartners,
    TotalEquity,
}

enum Selector {
    /// First row named exactly like one of the names, otherwise the first
    /// multi-word row containing one of them.
    First(&'static [&'static str]),
    /// Sum of every account row containing `word`, skipping rows that mention an excluded term.
    EveryWithWord {
        word: &'static str,
        excluding: &'static [&'static str],
    },
    /// Sum of every row whose name contains one of the phrases.
    EveryNamed(&'static [&'static str]),
}

impl SummaryMetric {
    pub const ALL: [SummaryMetric; 11] = [
        SummaryMetric::Revenue,
        SummaryMetric::CostOfSales,
        SummaryMetric::AdministrativeExpenses,
        SummaryMetric::LoanInterestNab,
        SummaryMetric::LoanInterestPartners,
        SummaryMetric::OtherIncome,
        SummaryMetric::NetProfit,
        SummaryMetric::CashBalance,
        SummaryMetric::LoanPayableNab,
        SummaryMetric::LoanPayablesPartners,
        SummaryMetric::TotalEquity,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            SummaryMetric::Revenue => "Revenue",
            SummaryMetric::CostOfSales => "COS",
            SummaryMetric::AdministrativeExpenses => "Administrative Expenses",
            SummaryMetric::LoanInterestNab => "Loan Interest - NAB",
            SummaryMetric::LoanInterestPartners => "Loan Interest - Partners / Inter-co",
            SummaryMetric::OtherIncome => "Other Income",
            SummaryMetric::NetProfit => "Net Profit/(Loss)",
            SummaryMetric::CashBalance => "Cash Balance",
            SummaryMetric::LoanPayableNab => "Loan Payable - NAB",
            SummaryMetric::LoanPayablesPartners => "Loan Payables - Partners / Inter-co Loan",
            SummaryMetric::TotalEquity => "Total Equity",
        }
    }

    pub fn statement_type(&self) -> StatementType {
        match self {
            SummaryMetric::CashBalance
            | SummaryMetric::LoanPayableNab
            | SummaryMetric::LoanPayablesPartners
            | SummaryMetric::TotalEquity => StatementType::BalanceSheet,
            _ => StatementType::ProfitAndLoss,
        }
    }

    fn selector(&self) -> Selector {
        match self {
            SummaryMetric::Revenue => Selector::First(&["total income"]),
            SummaryMetric::CostOfSales => Selector::First(&["total cost of sales"]),
            SummaryMetric::AdministrativeExpenses => {
                Selector::First(&["total general & administrative exp"])
            }
            SummaryMetric::LoanInterestNab => Selector::EveryWithWord {
                word: "nab",
                excluding: &[],
            },
            SummaryMetric::LoanInterestPartners => Selector::EveryNamed(&[
                "interest expense (unit holders)",
                "interest expense (director / friendly loan)",
            ]),
            SummaryMetric::OtherIncome => Selector::First(&["total other income"]),
            SummaryMetric::NetProfit => Selector::First(&["net profit/(loss)", "net profit"]),
            SummaryMetric::CashBalance => Selector::First(&["total cash on hand"]),
            SummaryMetric::LoanPayableNab => Selector::EveryWithWord {
                word: "nab",
                excluding: &["deposit"],
            },
            SummaryMetric::LoanPayablesPartners => Selector::EveryNamed(&[
                "total long term liabilities",
                "total other long term liabilities",
            ]),
            SummaryMetric::TotalEquity => Selector::First(&["total equity"]),
        }
    }
}

/// One summary metric across the table's periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub metric: SummaryMetric,
    pub label: String,
    pub statement_type: StatementType,
    /// Rows the metric was built from, in table order.
    pub accounts: Vec<String>,
    pub amounts: BTreeMap<PeriodKey, Option<Decimal>>,
    /// Year-end adjustments of the source rows by fiscal year.
    pub adjustments: BTreeMap<i32, Decimal>,
}

impl MetricRow {
    pub fn amount(&self, period: &PeriodKey) -> Option<Decimal> {
        self.amounts.get(period).copied().flatten()
    }

    pub fn has_data(&self) -> bool {
        self.amounts.values().any(Option::is_some)
    }

    /// Fiscal-year figure without adjustments: flows sum the year's periods,
    /// balances take the last balance of the year.
    pub fn fiscal_year_total(&self, fiscal_year: i32) -> Option<Decimal> {
        fiscal_year_total(self.statement_type, &self.amounts, fiscal_year)
    }

    pub fn adjustment(&self, fiscal_year: i32) -> Option<Decimal> {
        self.adjustments.get(&fiscal_year).copied()
    }
}

/// Flows sum the fiscal year's periods, balances take the year's last balance.
/// `None` when the year has no data or the sum overflows.
pub fn fiscal_year_total(
    statement_type: StatementType,
    amounts: &BTreeMap<PeriodKey, Option<Decimal>>,
    fiscal_year: i32,
) -> Option<Decimal> {
    let mut values = amounts
        .iter()
        .filter(|(period, _)| period.fiscal_year == fiscal_year)
        .filter_map(|(_, amount)| *amount)
        .peekable();
    values.peek()?;
    match statement_type {
        StatementType::ProfitAndLoss => checked_sum(values),
        StatementType::BalanceSheet => values.last(),
    }
}

fn has_word(normalized: &str, word: &str) -> bool {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

fn select<'r>(selector: &Selector, candidates: &[(&'r AggregatedRow, String)]) -> Vec<&'r AggregatedRow> {
    match selector {
        Selector::First(names) => candidates
            .iter()
            .find(|(_, name)| names.iter().any(|n| name.as_str() == *n))
            .or_else(|| {
                candidates.iter().find(|(_, name)| {
                    name.split_whitespace().count() > 1 && names.iter().any(|n| name.contains(n))
                })
            })
            .map(|(row, _)| vec![*row])
            .unwrap_or_default(),
        Selector::EveryWithWord { word, excluding } => candidates
            .iter()
            .filter(|(row, name)| {
                row.role == RowRole::Account
                    && has_word(name, word)
                    && !excluding.iter().any(|term| name.contains(term))
            })
            .map(|(row, _)| *row)
            .collect(),
        Selector::EveryNamed(phrases) => candidates
            .iter()
            .filter(|(_, name)| phrases.iter().any(|phrase| name.contains(phrase)))
            .map(|(row, _)| *row)
            .collect(),
    }
}

/// Projects every catalog metric over the aggregated rows.
///
/// A metric that matches no row is still returned, with no data. A period where
/// none of the source rows has an amount stays `None`; sums that overflow are
/// `None` as well and recorded in `degradations`.
pub(crate) fn compute_metrics(
    periods: &[PeriodKey],
    rows: &[AggregatedRow],
    degradations: &mut Vec<Degradation>,
) -> Vec<MetricRow> {
    SummaryMetric::ALL
        .iter()
        .map(|metric| {
            let statement_type = metric.statement_type();
            let candidates: Vec<(&AggregatedRow, String)> = rows
                .iter()
                .filter(|row| row.statement_type == statement_type)
                .map(|row| (row, normalize_account_name(&row.account_name)))
                .collect();
            let sources = select(&metric.selector(), &candidates);
            if sources.is_empty() {
                debug!("Summary metric {}: no matching rows", metric.label());
            }

            let subject = format!("metric {}", metric.label());
            let mut amounts = BTreeMap::new();
            for period in periods {
                let present: Vec<Decimal> = sources.iter().filter_map(|row| row.amount(period)).collect();
                let amount = if present.is_empty() {
                    None
                } else {
                    let sum = checked_sum(present);
                    if sum.is_none() {
                        degradations.push(Degradation::new(
                            subject.clone(),
                            format!("amounts overflow in {}", period),
                        ));
                    }
                    sum
                };
                amounts.insert(*period, amount);
            }

            let years: BTreeSet<i32> = sources
                .iter()
                .flat_map(|row| row.adjustments.keys().copied())
                .collect();
            let mut adjustments = BTreeMap::new();
            for year in years {
                match checked_sum(sources.iter().filter_map(|row| row.adjustments.get(&year).copied())) {
                    Some(total) => {
                        adjustments.insert(year, total);
                    }
                    None => degradations.push(Degradation::new(
                        subject.clone(),
                        format!("adjustments overflow in FY{}", year),
                    )),
                }
            }

            MetricRow {
                metric: *metric,
                label: metric.label().to_string(),
                statement_type,
                accounts: sources.iter().map(|row| row.account_name.clone()).collect(),
                amounts,
                adjustments,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Adjustment, AggregatedTable, LineItem};
    use crate::summary::SummaryAggregator;

    fn d(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn item(name: &str, period: u32, amount: i64, statement_type: StatementType, role: RowRole) -> LineItem {
        LineItem::new(name, PeriodKey::new(2024, period), d(amount), statement_type).with_role(role)
    }

    fn table() -> AggregatedTable {
        use RowRole::*;
        use StatementType::*;
        let items = vec![
            item("Sales", 1, 100, ProfitAndLoss, Account),
            item("Sales", 2, 120, ProfitAndLoss, Account),
            item("Total Income", 1, 100, ProfitAndLoss, Total),
            item("Total Income", 2, 120, ProfitAndLoss, Total),
            item("Interest - NAB Loan 1", 1, 4, ProfitAndLoss, Account),
            item("Interest - NAB Loan 1", 2, 4, ProfitAndLoss, Account),
            item("Interest - NAB Loan 2", 2, 3, ProfitAndLoss, Account),
            item("Interest expense (unit holders)", 1, 2, ProfitAndLoss, Account),
            item("Interest expense (director / friendly loan)", 1, 1, ProfitAndLoss, Account),
            item("Net Profit/(Loss)", 1, 93, ProfitAndLoss, Derived),
            item("Net Profit/(Loss)", 2, 113, ProfitAndLoss, Derived),
            item("NAB Term Deposit", 1, 5000, BalanceSheet, Account),
            item("NAB Business Loan", 1, -20000, BalanceSheet, Account),
            item("NAB Business Loan", 2, -19000, BalanceSheet, Account),
            item("Total Cash On Hand", 1, 700, BalanceSheet, Total),
            item("Total Cash On Hand", 2, 900, BalanceSheet, Total),
            item("Total Long Term Liabilities", 2, -300, BalanceSheet, Total),
            item("Total Other Long Term Liabilities", 2, -200, BalanceSheet, Total),
        ];
        let adjustments = vec![Adjustment {
            account_name: "Total Income".into(),
            statement_type: ProfitAndLoss,
            fiscal_year: 2024,
            amount: d(-7),
            role: Total,
        }];
        SummaryAggregator::new()
            .with_adjustments(&adjustments)
            .aggregate(&items)
            .unwrap()
    }

    #[test]
    fn test_catalog_order_and_labels() {
        let table = table();
        let labels: Vec<_> = table.metrics().iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels[0], "Revenue");
        assert_eq!(labels[3], "Loan Interest - NAB");
        assert_eq!(labels[10], "Total Equity");
        assert_eq!(labels.len(), 11);
    }

    #[test]
    fn test_single_row_metrics() {
        let table = table();
        let revenue = table.metric(SummaryMetric::Revenue).unwrap();
        assert_eq!(revenue.accounts, vec!["Total Income"]);
        assert_eq!(revenue.fiscal_year_total(2024), Some(d(220)));
        assert_eq!(revenue.adjustment(2024), Some(d(-7)));

        let net = table.metric(SummaryMetric::NetProfit).unwrap();
        assert_eq!(net.amount(&PeriodKey::new(2024, 2)), Some(d(113)));

        let cash = table.metric(SummaryMetric::CashBalance).unwrap();
        assert_eq!(cash.fiscal_year_total(2024), Some(d(900)));

        let equity = table.metric(SummaryMetric::TotalEquity).unwrap();
        assert!(!equity.has_data());
        assert_eq!(equity.fiscal_year_total(2024), None);
    }

    #[test]
    fn test_summed_metrics() {
        let table = table();
        let nab_interest = table.metric(SummaryMetric::LoanInterestNab).unwrap();
        assert_eq!(nab_interest.amount(&PeriodKey::new(2024, 1)), Some(d(4)));
        assert_eq!(nab_interest.amount(&PeriodKey::new(2024, 2)), Some(d(7)));

        let partners = table.metric(SummaryMetric::LoanInterestPartners).unwrap();
        assert_eq!(partners.amount(&PeriodKey::new(2024, 1)), Some(d(3)));
        assert_eq!(partners.amount(&PeriodKey::new(2024, 2)), None);

        let nab_loans = table.metric(SummaryMetric::LoanPayableNab).unwrap();
        assert_eq!(nab_loans.accounts, vec!["NAB Business Loan"]);

        let long_term = table.metric(SummaryMetric::LoanPayablesPartners).unwrap();
        assert_eq!(long_term.amount(&PeriodKey::new(2024, 2)), Some(d(-500)));
        assert_eq!(long_term.amount(&PeriodKey::new(2024, 1)), None);
    }

    #[test]
    fn test_contains_match_skips_single_word_headings() {
        let p = PeriodKey::new(2024, 1);
        let items = vec![
            LineItem::new("Equity", p, d(1), StatementType::BalanceSheet),
            LineItem::new("Total Equity (Closing)", p, d(50), StatementType::BalanceSheet),
        ];
        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        let equity = table.metric(SummaryMetric::TotalEquity).unwrap();
        assert_eq!(equity.accounts, vec!["Total Equity (Closing)"]);
    }

    #[test]
    fn test_word_match_ignores_embedded_letters() {
        assert!(has_word("interest - nab loan", "nab"));
        assert!(!has_word("unable to allocate", "nab"));
    }
}
