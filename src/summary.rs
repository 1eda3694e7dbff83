use crate::error::{FinancialReportError, Result};
use crate::metrics::compute_metrics;
use crate::schema::{
    Adjustment, AggregatedRow, AggregatedTable, Degradation, Deltas, LineItem, PeriodKey, RowRole,
    StatementType,
};
use crate::utils::normalize_account_name;
use log::{debug, info};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Budgeted amounts per account, keyed by normalized account name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSeries {
    accounts: BTreeMap<String, BTreeMap<PeriodKey, Decimal>>,
}

impl BudgetSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a budget figure. Repeated entries for the same account and period accumulate.
    pub fn insert(&mut self, account_name: &str, period: PeriodKey, amount: Decimal) -> Result<()> {
        let total = self
            .accounts
            .entry(normalize_account_name(account_name))
            .or_default()
            .entry(period)
            .or_insert(Decimal::ZERO);
        *total = total.checked_add(amount).ok_or_else(|| {
            FinancialReportError::malformed(
                "budget",
                format!("budget for '{}' in {} overflows", account_name.trim(), period),
            )
        })?;
        Ok(())
    }

    /// Builds a budget from parsed budget statements.
    pub fn from_line_items(items: &[LineItem]) -> Result<Self> {
        let mut budget = Self::new();
        for item in items {
            budget.insert(&item.account_name, item.period, item.amount)?;
        }
        Ok(budget)
    }

    pub fn get(&self, account_name: &str) -> Option<&BTreeMap<PeriodKey, Decimal>> {
        self.accounts.get(&normalize_account_name(account_name))
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Differences between amounts. A difference that does not fit a `Decimal` is
/// reported as not comparable and remembered for the degradation list.
#[derive(Default)]
struct Differences {
    overflowed: Vec<String>,
}

impl Differences {
    fn delta<F>(&mut self, what: F, current: Option<Decimal>, previous: Option<Decimal>) -> Option<Decimal>
    where
        F: FnOnce() -> String,
    {
        let difference = current?.checked_sub(previous?);
        if difference.is_none() {
            self.overflowed.push(what());
        }
        difference
    }
}

struct Group<'i> {
    statement_type: StatementType,
    name: &'i str,
    role: RowRole,
    values: BTreeMap<PeriodKey, Decimal>,
    overflowed: BTreeSet<PeriodKey>,
    adjustments: BTreeMap<i32, Decimal>,
    overflowed_years: BTreeSet<i32>,
}

impl<'i> Group<'i> {
    fn new(statement_type: StatementType, name: &'i str, role: RowRole) -> Self {
        Self {
            statement_type,
            name,
            role,
            values: BTreeMap::new(),
            overflowed: BTreeSet::new(),
            adjustments: BTreeMap::new(),
            overflowed_years: BTreeSet::new(),
        }
    }

    fn add(&mut self, period: PeriodKey, amount: Decimal) {
        if self.overflowed.contains(&period) {
            return;
        }
        let total = self.values.entry(period).or_insert(Decimal::ZERO);
        match total.checked_add(amount) {
            Some(sum) => *total = sum,
            None => {
                self.values.remove(&period);
                self.overflowed.insert(period);
            }
        }
    }

    fn add_adjustment(&mut self, fiscal_year: i32, amount: Decimal) {
        if self.overflowed_years.contains(&fiscal_year) {
            return;
        }
        let total = self.adjustments.entry(fiscal_year).or_insert(Decimal::ZERO);
        match total.checked_add(amount) {
            Some(sum) => *total = sum,
            None => {
                self.adjustments.remove(&fiscal_year);
                self.overflowed_years.insert(fiscal_year);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryAggregator<'a> {
    budget: Option<&'a BudgetSeries>,
    adjustments: &'a [Adjustment],
}

impl<'a> SummaryAggregator<'a> {
    pub fn new() -> Self {
        Self {
            budget: None,
            adjustments: &[],
        }
    }

    pub fn with_budget(mut self, budget: &'a BudgetSeries) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Year-end adjustments to carry next to the period amounts.
    pub fn with_adjustments(mut self, adjustments: &'a [Adjustment]) -> Self {
        self.adjustments = adjustments;
        self
    }

    /// Merges line items across periods into one row per account and statement type.
    ///
    /// Fails only when there is nothing to aggregate. Missing data never becomes zero:
    /// it stays `None` and makes every delta that touches it `None` as well. Sums and
    /// differences that overflow are treated as missing and listed as degradations.
    pub fn aggregate(&self, items: &[LineItem]) -> Result<AggregatedTable> {
        if items.is_empty() {
            return Err(FinancialReportError::EmptyInput);
        }

        let periods: Vec<PeriodKey> = items
            .iter()
            .map(|item| item.period)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut index: HashMap<(StatementType, &str), usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();
        for item in items {
            let name = item.account_name.trim();
            let slot = *index.entry((item.statement_type, name)).or_insert_with(|| {
                groups.push(Group::new(item.statement_type, name, item.role));
                groups.len() - 1
            });
            groups[slot].add(item.period, item.amount);
        }
        for adjustment in self.adjustments {
            let name = adjustment.account_name.trim();
            let slot = *index
                .entry((adjustment.statement_type, name))
                .or_insert_with(|| {
                    groups.push(Group::new(adjustment.statement_type, name, adjustment.role));
                    groups.len() - 1
                });
            groups[slot].add_adjustment(adjustment.fiscal_year, adjustment.amount);
        }
        groups.sort_by_key(|group| group.statement_type);

        let current = periods.last().copied();
        let mut degradations = Vec::new();
        let mut rows: Vec<AggregatedRow> = Vec::with_capacity(groups.len());
        for group in groups {
            let subject = format!("{} {}", group.statement_type, group.name);
            let amounts: BTreeMap<PeriodKey, Option<Decimal>> = periods
                .iter()
                .map(|period| (*period, group.values.get(period).copied()))
                .collect();

            let missing: Vec<String> = amounts
                .iter()
                .filter(|(period, amount)| amount.is_none() && !group.overflowed.contains(period))
                .map(|(period, _)| period.to_string())
                .collect();
            if !missing.is_empty() {
                degradations.push(Degradation::new(
                    subject.clone(),
                    format!("no amount for {}", missing.join(", ")),
                ));
            }
            if !group.overflowed.is_empty() {
                let overflowed: Vec<String> = group.overflowed.iter().map(|p| p.to_string()).collect();
                degradations.push(Degradation::new(
                    subject.clone(),
                    format!("amounts overflow in {}", overflowed.join(", ")),
                ));
            }
            for year in &group.overflowed_years {
                degradations.push(Degradation::new(
                    subject.clone(),
                    format!("adjustments overflow in FY{}", year),
                ));
            }

            let mut differences = Differences::default();
            let period_over_period = periods
                .windows(2)
                .map(|pair| {
                    let previous = amounts.get(&pair[0]).copied().flatten();
                    let latest = amounts.get(&pair[1]).copied().flatten();
                    let change = differences.delta(
                        || format!("change to {}", pair[1]),
                        latest,
                        previous,
                    );
                    (pair[1], change)
                })
                .collect::<BTreeMap<_, _>>();

            let budget: BTreeMap<PeriodKey, Decimal> = self
                .budget
                .and_then(|series| series.get(group.name))
                .map(|series| {
                    series
                        .iter()
                        .filter(|(period, _)| amounts.contains_key(period))
                        .map(|(period, amount)| (*period, *amount))
                        .collect()
                })
                .unwrap_or_default();

            let deltas = match current {
                Some(current) => {
                    let actual = amounts.get(&current).copied().flatten();
                    Deltas {
                        prior_period_delta: period_over_period.get(&current).copied().flatten(),
                        prior_year_delta: differences.delta(
                            || "prior year delta".to_string(),
                            actual,
                            amounts.get(&current.prior_year()).copied().flatten(),
                        ),
                        budget_variance: differences.delta(
                            || "budget variance".to_string(),
                            actual,
                            budget.get(&current).copied(),
                        ),
                    }
                }
                None => Deltas::default(),
            };
            for what in differences.overflowed {
                degradations.push(Degradation::new(
                    subject.clone(),
                    format!("{} overflows and is not comparable", what),
                ));
            }

            rows.push(AggregatedRow {
                account_name: group.name.to_string(),
                statement_type: group.statement_type,
                role: group.role,
                amounts,
                budget,
                period_over_period,
                deltas,
                adjustments: group.adjustments,
            });
        }

        let metrics = compute_metrics(&periods, &rows, &mut degradations);

        for degradation in &degradations {
            debug!("{}: {}", degradation.subject, degradation.reason);
        }
        info!(
            "Aggregated {} line items into {} rows across {} period(s) ({} degraded, {} of {} summary metrics matched)",
            items.len(),
            rows.len(),
            periods.len(),
            degradations.len(),
            metrics.iter().filter(|m| m.has_data()).count(),
            metrics.len()
        );

        Ok(AggregatedTable::new(periods, rows, metrics, degradations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn pl(name: &str, period: PeriodKey, amount: i64) -> LineItem {
        LineItem::new(name, period, d(amount), StatementType::ProfitAndLoss)
    }

    #[test]
    fn test_empty_input_is_fatal() {
        let err = SummaryAggregator::new().aggregate(&[]).unwrap_err();
        assert!(matches!(err, FinancialReportError::EmptyInput));
    }

    #[test]
    fn test_missing_period_propagates_null() {
        let q1 = PeriodKey::new(2024, 1);
        let q2 = PeriodKey::new(2024, 2);
        let items = vec![pl("Sales", q1, 100), pl("Sales", q2, 130), pl("Grants", q1, 40)];

        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        assert_eq!(table.periods(), &[q1, q2]);

        let sales = table.find(StatementType::ProfitAndLoss, "Sales").unwrap();
        assert_eq!(sales.deltas.prior_period_delta, Some(d(30)));

        let grants = table.find(StatementType::ProfitAndLoss, "Grants").unwrap();
        assert_eq!(grants.amount(&q1), Some(d(40)));
        assert_eq!(grants.amounts.get(&q2), Some(&None));
        assert_eq!(grants.period_over_period.get(&q2), Some(&None));
        assert_eq!(grants.deltas.prior_period_delta, None);

        assert_eq!(table.degradations().len(), 1);
        assert!(table.degradations()[0].reason.contains("2024-P02"));
    }

    #[test]
    fn test_year_over_year_and_budget_variance() {
        let last_year = PeriodKey::new(2023, 3);
        let this_year = PeriodKey::new(2024, 3);
        let items = vec![pl("Sales", last_year, 80), pl("Sales", this_year, 100)];

        let mut budget = BudgetSeries::new();
        budget.insert("  SALES ", this_year, d(90)).unwrap();

        let table = SummaryAggregator::new()
            .with_budget(&budget)
            .aggregate(&items)
            .unwrap();
        let sales = &table.rows()[0];

        assert_eq!(sales.deltas.prior_year_delta, Some(d(20)));
        assert_eq!(sales.deltas.budget_variance, Some(d(10)));
        assert!(sales.has_budget());
    }

    #[test]
    fn test_no_budget_means_no_variance() {
        let p = PeriodKey::new(2024, 1);
        let table = SummaryAggregator::new()
            .aggregate(&[pl("Sales", p, 10)])
            .unwrap();
        assert_eq!(table.rows()[0].deltas.budget_variance, None);
        assert_eq!(table.rows()[0].deltas.prior_year_delta, None);
    }

    #[test]
    fn test_duplicates_are_summed_and_rows_ordered_by_statement() {
        let p = PeriodKey::new(2024, 1);
        let items = vec![
            LineItem::new("Cash", p, d(500), StatementType::BalanceSheet),
            pl("Sales", p, 10),
            pl("Sales", p, 15),
            pl("Rent", p, 7),
        ];

        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        let names: Vec<_> = table.rows().iter().map(|r| r.account_name.as_str()).collect();
        assert_eq!(names, vec!["Sales", "Rent", "Cash"]);
        assert_eq!(table.rows()[0].amount(&p), Some(d(25)));
    }

    fn huge() -> Decimal {
        Decimal::from_str("50000000000000000000000000000").unwrap()
    }

    #[test]
    fn test_overflowing_sum_degrades_instead_of_panicking() {
        let p = PeriodKey::new(2024, 1);
        let items = vec![
            LineItem::new("Sales", p, huge(), StatementType::ProfitAndLoss),
            LineItem::new("Sales", p, huge(), StatementType::ProfitAndLoss),
            pl("Rent", p, 5),
        ];

        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        let sales = table.find(StatementType::ProfitAndLoss, "Sales").unwrap();
        assert_eq!(sales.amounts.get(&p), Some(&None));
        assert_eq!(table.find(StatementType::ProfitAndLoss, "Rent").unwrap().amount(&p), Some(d(5)));
        assert!(table
            .degradations()
            .iter()
            .any(|d| d.subject == "PL Sales" && d.reason == "amounts overflow in 2024-P01"));
        assert!(!table.degradations().iter().any(|d| d.reason.starts_with("no amount")));
    }

    #[test]
    fn test_overflowing_delta_is_not_comparable() {
        let q1 = PeriodKey::new(2024, 1);
        let q2 = PeriodKey::new(2024, 2);
        let items = vec![
            LineItem::new("Swing", q1, -huge(), StatementType::ProfitAndLoss),
            LineItem::new("Swing", q2, huge(), StatementType::ProfitAndLoss),
        ];

        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        let swing = &table.rows()[0];
        assert_eq!(swing.period_over_period.get(&q2), Some(&None));
        assert_eq!(swing.deltas.prior_period_delta, None);
        assert!(table
            .degradations()
            .iter()
            .any(|d| d.reason == "change to 2024-P02 overflows and is not comparable"));
    }

    #[test]
    fn test_budget_overflow_is_an_error() {
        let p = PeriodKey::new(2024, 1);
        let mut budget = BudgetSeries::new();
        budget.insert("Sales", p, huge()).unwrap();
        let err = budget.insert("sales", p, huge()).unwrap_err();
        assert!(matches!(err, FinancialReportError::MalformedStatement { .. }));
        assert_eq!(budget.get("Sales").unwrap().get(&p), Some(&huge()));
    }

    #[test]
    fn test_adjustments_stay_out_of_period_amounts() {
        let p = PeriodKey::new(2024, 1);
        let adjustments = vec![
            Adjustment {
                account_name: "Sales".into(),
                statement_type: StatementType::ProfitAndLoss,
                fiscal_year: 2024,
                amount: d(5),
                role: RowRole::Account,
            },
            Adjustment {
                account_name: "Depreciation".into(),
                statement_type: StatementType::ProfitAndLoss,
                fiscal_year: 2024,
                amount: d(-12),
                role: RowRole::Account,
            },
        ];
        let table = SummaryAggregator::new()
            .with_adjustments(&adjustments)
            .aggregate(&[pl("Sales", p, 100)])
            .unwrap();

        let sales = table.find(StatementType::ProfitAndLoss, "Sales").unwrap();
        assert_eq!(sales.amount(&p), Some(d(100)));
        assert_eq!(sales.adjustments.get(&2024), Some(&d(5)));

        let depreciation = table.find(StatementType::ProfitAndLoss, "Depreciation").unwrap();
        assert_eq!(depreciation.amount(&p), None);
        assert_eq!(depreciation.adjustments.get(&2024), Some(&d(-12)));
    }

    #[test]
    fn test_roles_carry_over_to_rows() {
        let p = PeriodKey::new(2024, 1);
        let items = vec![
            pl("Sales", p, 100),
            pl("Total Income", p, 100).with_role(RowRole::Total),
        ];
        let table = SummaryAggregator::new().aggregate(&items).unwrap();
        assert_eq!(table.rows()[0].role, RowRole::Account);
        assert_eq!(table.rows()[1].role, RowRole::Total);
        assert_eq!(table.metrics().len(), crate::metrics::SummaryMetric::ALL.len());
    }
}
