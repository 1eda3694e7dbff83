use crate::error::{FinancialReportError, Result};
use crate::ingestion::{LoaderOptions, ReconciliationPolicy};
use crate::llm::retry::RetryPolicy;
use crate::utils::validate_fiscal_year_end_month;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Settings shared by every run of an orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub artifact_root: PathBuf,
    pub fiscal_year_end_month: u32,
    pub reconciliation_tolerance: Decimal,
    pub reconciliation_policy: ReconciliationPolicy,
    pub llm_timeout_secs: u64,
    pub llm_max_tokens: u32,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_jitter: bool,
    pub max_chart_series: usize,
    pub entity: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            artifact_root: std::env::temp_dir().join("financial-report-builder"),
            fiscal_year_end_month: 6,
            reconciliation_tolerance: Decimal::new(1, 2),
            reconciliation_policy: ReconciliationPolicy::Reject,
            llm_timeout_secs: 60,
            llm_max_tokens: 4096,
            retry_max_attempts: retry.max_attempts,
            retry_initial_backoff_ms: retry.initial_backoff.as_millis() as u64,
            retry_max_backoff_ms: retry.max_backoff.as_millis() as u64,
            retry_jitter: retry.jitter,
            max_chart_series: 6,
            entity: None,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| FinancialReportError::Config(format!("{} has an invalid value '{}'", key, raw)))
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| FinancialReportError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `FINREPORT_*` variables on top of the defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("FINREPORT_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("FINREPORT_FISCAL_YEAR_END_MONTH") {
            config.fiscal_year_end_month = parse_var("FINREPORT_FISCAL_YEAR_END_MONTH", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_RECONCILIATION_TOLERANCE") {
            config.reconciliation_tolerance = parse_var("FINREPORT_RECONCILIATION_TOLERANCE", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_RECONCILIATION_POLICY") {
            config.reconciliation_policy = v.parse()?;
        }
        if let Some(v) = lookup("FINREPORT_LLM_TIMEOUT_SECS") {
            config.llm_timeout_secs = parse_var("FINREPORT_LLM_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_LLM_MAX_TOKENS") {
            config.llm_max_tokens = parse_var("FINREPORT_LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = parse_var("FINREPORT_RETRY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_RETRY_INITIAL_BACKOFF_MS") {
            config.retry_initial_backoff_ms = parse_var("FINREPORT_RETRY_INITIAL_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_RETRY_MAX_BACKOFF_MS") {
            config.retry_max_backoff_ms = parse_var("FINREPORT_RETRY_MAX_BACKOFF_MS", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_MAX_CHART_SERIES") {
            config.max_chart_series = parse_var("FINREPORT_MAX_CHART_SERIES", &v)?;
        }
        if let Some(v) = lookup("FINREPORT_ENTITY") {
            if !v.trim().is_empty() {
                config.entity = Some(v.trim().to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_fiscal_year_end_month(self.fiscal_year_end_month)?;
        if self.reconciliation_tolerance.is_sign_negative() {
            return Err(FinancialReportError::Config(
                "reconciliation tolerance must not be negative".to_string(),
            ));
        }
        if self.llm_timeout_secs == 0 {
            return Err(FinancialReportError::Config(
                "LLM timeout must be at least one second".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(FinancialReportError::Config(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err(FinancialReportError::Config(
                "initial retry backoff exceeds the maximum backoff".to_string(),
            ));
        }
        if self.max_chart_series == 0 {
            return Err(FinancialReportError::Config(
                "charts need at least one series".to_string(),
            ));
        }
        Ok(())
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions {
            fiscal_year_end_month: self.fiscal_year_end_month,
            reconciliation_tolerance: self.reconciliation_tolerance,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            jitter: self.retry_jitter,
            ..RetryPolicy::default()
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}
