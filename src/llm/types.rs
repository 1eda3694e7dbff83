use crate::error::{FinancialReportError, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The text-generation service behind the report stage.
///
/// Implementations map their transport failures onto
/// [`FinancialReportError::UpstreamTimeout`], [`FinancialReportError::UpstreamRateLimit`]
/// or [`FinancialReportError::UpstreamContent`].
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32, timeout: Duration) -> Result<String>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NarrativeSection {
    pub heading: String,
    /// Markdown body of the section.
    pub content: String,
}

/// Structured narrative requested from the text generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReportNarrative {
    pub title: String,
    /// Two or three sentences a director can read on their own.
    pub executive_summary: String,
    pub sections: Vec<NarrativeSection>,
}

pub const DEFAULT_REPORT_TITLE: &str = "Financial Analysis Report";

/// Pulls the JSON object out of a response that may wrap it in a code fence.
pub fn extract_json(content: &str) -> &str {
    if let Some(start) = content.find("```json") {
        if let Some(end) = content[start + 7..].find("```") {
            return content[start + 7..start + 7 + end].trim();
        }
    }
    if let Some(start) = content.find("```") {
        if let Some(end) = content[start + 3..].find("```") {
            let inner = content[start + 3..start + 3 + end].trim();
            if inner.starts_with('{') {
                return inner;
            }
        }
    }
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            return &content[start..=end];
        }
    }
    content.trim()
}

/// Interprets a text-generation response.
///
/// Empty bodies and JSON that does not fit [`ReportNarrative`] are content errors.
/// A plain prose answer is kept as a single "Analysis" section.
pub fn parse_narrative(body: &str) -> Result<ReportNarrative> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(FinancialReportError::UpstreamContent(
            "empty response body".to_string(),
        ));
    }

    if trimmed.starts_with('{') || trimmed.starts_with("```") {
        let narrative: ReportNarrative = serde_json::from_str(extract_json(trimmed)).map_err(|e| {
            FinancialReportError::UpstreamContent(format!(
                "response is not a valid narrative object: {}",
                e
            ))
        })?;
        if narrative.executive_summary.trim().is_empty() && narrative.sections.is_empty() {
            return Err(FinancialReportError::UpstreamContent(
                "narrative has no summary and no sections".to_string(),
            ));
        }
        return Ok(narrative);
    }

    Ok(ReportNarrative {
        title: DEFAULT_REPORT_TITLE.to_string(),
        executive_summary: trimmed
            .split("\n\n")
            .next()
            .unwrap_or(trimmed)
            .chars()
            .take(500)
            .collect(),
        sections: vec![NarrativeSection {
            heading: "Analysis".to_string(),
            content: trimmed.to_string(),
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fence() {
        let input = "Here you go:\n```json\n{\"title\": \"T\"}\n```";
        assert_eq!(extract_json(input), "{\"title\": \"T\"}");
        assert_eq!(extract_json("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn test_parse_structured_narrative() {
        let body = r#"{"title":"FY24 Review","executive_summary":"Revenue grew.","sections":[{"heading":"Profitability","content":"Margins held."}]}"#;
        let narrative = parse_narrative(body).unwrap();
        assert_eq!(narrative.title, "FY24 Review");
        assert_eq!(narrative.sections[0].heading, "Profitability");
    }

    #[test]
    fn test_plain_text_becomes_single_section() {
        let narrative = parse_narrative("Revenue rose 12%.\n\nCosts were flat.").unwrap();
        assert_eq!(narrative.executive_summary, "Revenue rose 12%.");
        assert_eq!(narrative.sections.len(), 1);
        assert_eq!(narrative.sections[0].heading, "Analysis");
    }

    #[test]
    fn test_content_errors() {
        assert!(matches!(
            parse_narrative("   "),
            Err(FinancialReportError::UpstreamContent(_))
        ));
        assert!(matches!(
            parse_narrative("{\"title\": \"missing fields\""),
            Err(FinancialReportError::UpstreamContent(_))
        ));
    }
}
