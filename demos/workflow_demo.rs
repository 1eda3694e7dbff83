use async_trait::async_trait;
use dotenv::dotenv;
use financial_report_builder::*;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Stands in for a hosted model when no API key is configured.
struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn complete(&self, _prompt: &str, _max_tokens: u32, _timeout: Duration) -> Result<String> {
        Ok(r#"{
            "title": "Demo Management Report",
            "executive_summary": "Offline narrative: revenue rose from P01 to P02 and liquidity held.",
            "sections": [
                {"heading": "Profitability", "content": "Net profit was steady across both periods."}
            ]
        }"#
        .to_string())
    }

    fn name(&self) -> &str {
        "offline"
    }
}

#[cfg(feature = "gemini")]
fn text_generator() -> Arc<dyn TextGenerator> {
    match GeminiTextGenerator::from_env() {
        Ok(client) => {
            println!("🤖 Using Gemini model '{}'", client.name());
            Arc::new(client)
        }
        Err(e) => {
            println!("⚠️  {} - falling back to the offline narrative", e);
            Arc::new(OfflineGenerator)
        }
    }
}

#[cfg(not(feature = "gemini"))]
fn text_generator() -> Arc<dyn TextGenerator> {
    println!("🤖 Built without the 'gemini' feature, using the offline narrative");
    Arc::new(OfflineGenerator)
}

fn sample_statements() -> Result<Vec<StatementSource>> {
    let p1: PeriodKey = "2024-P01".parse()?;
    let p2: PeriodKey = "2024-P02".parse()?;
    Ok(vec![
        StatementSource::new(
            p1,
            StatementType::ProfitAndLoss,
            "pl_p01.csv",
            "Account Name,Amount\nIncome,\nSales,1200\nOther Revenue,300\nTotal Income,1500\n\
             Expenses,\nWages Expense,600\nRent Expense,200\nTotal Expenses,800\nNet Profit,700\n",
        ),
        StatementSource::new(
            p2,
            StatementType::ProfitAndLoss,
            "pl_p02.csv",
            "Account Name,Amount\nIncome,\nSales,1300\nOther Revenue,250\nTotal Income,1550\n\
             Expenses,\nWages Expense,650\nRent Expense,200\nTotal Expenses,850\nNet Profit,700\n",
        ),
        StatementSource::new(
            p1,
            StatementType::BalanceSheet,
            "bs_p01.csv",
            "Account Name,Balance\nCurrent Assets,\nCash at Bank,500\nTrade Debtors,300\n\
             Total Current Assets,800\nCurrent Liabilities,\nTrade Creditors,400\n\
             Total Current Liabilities,400\n",
        ),
        StatementSource::new(
            p2,
            StatementType::BalanceSheet,
            "bs_p02.csv",
            "Account Name,Balance\nCurrent Assets,\nCash at Bank,700\nTrade Debtors,300\n\
             Total Current Assets,1000\nCurrent Liabilities,\nTrade Creditors,500\n\
             Total Current Liabilities,500\n",
        ),
    ])
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    dotenv().ok();

    println!("📊 Financial Report Builder demo\n");

    let config = PipelineConfig::from_env()?;
    let orchestrator = Orchestrator::new(config, text_generator())?;

    let mut budget = BudgetSeries::new();
    budget.insert("Sales", "2024-P01".parse()?, rust_decimal::Decimal::new(1100, 0))?;
    budget.insert("Sales", "2024-P02".parse()?, rust_decimal::Decimal::new(1400, 0))?;
    let options = orchestrator.options().with_budget(budget);

    let mut run = orchestrator
        .execute_workflow(sample_statements()?, &Stage::FAN_OUT, options)
        .await;

    println!("{}", serde_json::to_string_pretty(&run)?);

    match run.state {
        RunState::Completed => println!("\n✅ Run {} completed", run.run_id),
        state => println!("\n⚠️  Run {} ended as {:?}: {:?}", run.run_id, state, run.failed_stages()),
    }

    if let Some(report) = run
        .stage(Stage::Reporting)
        .and_then(|r| r.artifacts.first())
        .cloned()
    {
        println!("\n{}", String::from_utf8_lossy(&run.read_artifact(&report)?));
    }

    if let Some(dir) = run.retain_artifacts() {
        println!("📁 Artifacts kept in {}", dir.display());
    }

    Ok(())
}
