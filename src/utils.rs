use crate::error::{FinancialReportError, Result};
use chrono::Month;
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn validate_fiscal_year_end_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(FinancialReportError::InvalidFiscalYearEndMonth(month));
    }
    Ok(())
}

/// Returns the 0-based index of the month within the fiscal year.
///
/// # Examples
/// - If FY ends in Dec (12): Jan=0, Feb=1, ..., Dec=11
/// - If FY ends in June (6): July=0, Aug=1, ..., June=11
pub fn get_fiscal_month_index(calendar_month: u32, fiscal_year_end_month: u32) -> usize {
    let fy_start_month = if fiscal_year_end_month == 12 {
        1
    } else {
        fiscal_year_end_month + 1
    };

    if calendar_month >= fy_start_month {
        (calendar_month - fy_start_month) as usize
    } else {
        (calendar_month + 12 - fy_start_month) as usize
    }
}

/// Recognises month column headers such as `July`, `Jul`, `Jul 24` or `July-2024`.
/// Returns the calendar month number (1-12).
pub fn parse_month_header(header: &str) -> Option<u32> {
    let mut tokens = header
        .split([' ', '-', '/', '_'])
        .map(str::trim)
        .filter(|t| !t.is_empty());

    let month = Month::from_str(tokens.next()?).ok()?;
    if tokens.all(|t| t.chars().all(|c| c.is_ascii_digit())) {
        Some(month.number_from_month())
    } else {
        None
    }
}

/// Maps a month column header onto its 1-based fiscal period.
pub fn fiscal_period_for_header(header: &str, fiscal_year_end_month: u32) -> Option<u32> {
    parse_month_header(header)
        .map(|month| get_fiscal_month_index(month, fiscal_year_end_month) as u32 + 1)
}

/// Canonical form used to compare account names: trimmed, single-spaced, lowercase.
pub fn normalize_account_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parses an amount cell as exported by accounting packages.
///
/// Blank cells are missing data (`Ok(None)`), a lone dash is zero, and
/// `(1,200.50)` is negative. Currency symbols and thousands separators are ignored.
pub fn parse_amount(raw: &str) -> std::result::Result<Option<Decimal>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if matches!(trimmed, "-" | "–" | "—") {
        return Ok(Some(Decimal::ZERO));
    }

    let (negative, body) = match trimmed
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
    {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let cleaned: String = body
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£' | ' '))
        .collect();

    let value = Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .map_err(|_| format!("'{}' is not a number", raw.trim()))?;

    Ok(Some(if negative { -value } else { value }))
}

/// Sum that reports overflow as `None` instead of panicking.
pub fn checked_sum<I>(values: I) -> Option<Decimal>
where
    I: IntoIterator<Item = Decimal>,
{
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiscal_month_index() {
        // Standard calendar year (Ends Dec)
        assert_eq!(get_fiscal_month_index(1, 12), 0); // Jan
        assert_eq!(get_fiscal_month_index(12, 12), 11); // Dec

        // June year end (FY starts July)
        assert_eq!(get_fiscal_month_index(7, 6), 0); // July is month 0
        assert_eq!(get_fiscal_month_index(12, 6), 5); // Dec is month 5
        assert_eq!(get_fiscal_month_index(6, 6), 11); // June is month 11
    }

    #[test]
    fn test_month_headers() {
        assert_eq!(parse_month_header("July"), Some(7));
        assert_eq!(parse_month_header("jan"), Some(1));
        assert_eq!(parse_month_header("Jul 24"), Some(7));
        assert_eq!(parse_month_header("March-2025"), Some(3));
        assert_eq!(parse_month_header("Adjustment Only"), None);
        assert_eq!(parse_month_header("Total"), None);
        assert_eq!(parse_month_header("May Adjustments"), None);

        assert_eq!(fiscal_period_for_header("July", 6), Some(1));
        assert_eq!(fiscal_period_for_header("June", 6), Some(12));
        assert_eq!(fiscal_period_for_header("January", 12), Some(1));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("").unwrap(), None);
        assert_eq!(parse_amount("   ").unwrap(), None);
        assert_eq!(parse_amount("-").unwrap(), Some(Decimal::ZERO));
        assert_eq!(parse_amount("1,200.50").unwrap(), Some(Decimal::new(120050, 2)));
        assert_eq!(parse_amount("$ 75").unwrap(), Some(Decimal::new(75, 0)));
        assert_eq!(parse_amount("(300.25)").unwrap(), Some(Decimal::new(-30025, 2)));
        assert_eq!(parse_amount("-42").unwrap(), Some(Decimal::new(-42, 0)));
        assert!(parse_amount("n/a").is_err());
    }

    #[test]
    fn test_normalize_account_name() {
        assert_eq!(normalize_account_name("  Cash   at Bank "), "cash at bank");
        assert_eq!(normalize_account_name("CASH AT BANK"), "cash at bank");
    }

    #[test]
    fn test_checked_sum_reports_overflow() {
        assert_eq!(
            checked_sum([Decimal::new(15, 1), Decimal::new(-5, 1)]),
            Some(Decimal::ONE)
        );
        assert_eq!(checked_sum(Vec::new()), Some(Decimal::ZERO));
        let big = Decimal::from_str("50000000000000000000000000000").unwrap();
        assert_eq!(checked_sum([big, big]), None);
    }

    #[test]
    fn test_validate_fiscal_year_end_month() {
        assert!(validate_fiscal_year_end_month(6).is_ok());
        assert!(validate_fiscal_year_end_month(0).is_err());
        assert!(validate_fiscal_year_end_month(13).is_err());
    }
}
