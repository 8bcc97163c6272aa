use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::image_data::ImageData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextIssue {
    None,
    Missing,
    Wrong,
    Extra,
}

impl TextIssue {
    /// Lenient parse of the evaluator's text-issue label.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NONE" | "NO_ISSUE" | "OK" => Some(Self::None),
            "MISSING" | "MISSING_TEXT" => Some(Self::Missing),
            "WRONG" | "WRONG_TEXT" | "MISSPELLED" => Some(Self::Wrong),
            "EXTRA" | "EXTRA_TEXT" => Some(Self::Extra),
            _ => None,
        }
    }

    pub fn is_issue(&self) -> bool {
        !matches!(self, Self::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub generation_tokens: u64,
    pub evaluation_tokens: u64,
}

impl UsageSummary {
    pub fn add(&mut self, other: &UsageSummary) {
        self.generation_tokens += other.generation_tokens;
        self.evaluation_tokens += other.evaluation_tokens;
    }
}

/// Evaluation provider output before score normalization.
///
/// `score` keeps whatever shape the provider produced (number, "Score: 8/10",
/// "80", ...); the quality gate decides what it means.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawEvaluation {
    pub score: Option<Value>,
    pub verdict: Option<String>,
    pub reasoning: Option<String>,
    pub text_issue: Option<String>,
    pub expected_text: Option<String>,
    pub actual_text: Option<String>,
    pub raw_text: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityResult {
    /// 0-100, `None` when no encoding could be recognised.
    pub score: Option<u8>,
    pub verdict: String,
    pub reasoning: String,
    pub text_issue: Option<TextIssue>,
    pub expected_text: Option<String>,
    pub actual_text: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub image_data: ImageData,
    pub score: Option<u8>,
    pub reasoning: Option<String>,
    pub text_issue: Option<TextIssue>,
    pub generation_model_id: String,
    pub evaluation_model_id: Option<String>,
    #[serde(default)]
    pub usage: UsageSummary,
}

impl CacheEntry {
    /// An entry that went through an evaluator (even if unscored).
    pub fn was_evaluated(&self) -> bool {
        self.evaluation_model_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{CacheEntry, TextIssue, TokenUsage, UsageSummary};
    use crate::image_data::ImageData;

    #[test]
    fn text_issue_parse_is_lenient() {
        assert_eq!(TextIssue::parse(" missing "), Some(TextIssue::Missing));
        assert_eq!(TextIssue::parse("WRONG_TEXT"), Some(TextIssue::Wrong));
        assert_eq!(TextIssue::parse("none"), Some(TextIssue::None));
        assert_eq!(TextIssue::parse("blurry"), None);
        assert!(!TextIssue::None.is_issue());
        assert!(TextIssue::Extra.is_issue());
    }

    #[test]
    fn cache_entry_uses_camel_case_wire_names() -> anyhow::Result<()> {
        let entry = CacheEntry {
            image_data: ImageData::png(vec![7]),
            score: Some(80),
            reasoning: Some("clean".to_string()),
            text_issue: Some(TextIssue::None),
            generation_model_id: "gen".to_string(),
            evaluation_model_id: Some("eval".to_string()),
            usage: UsageSummary {
                generation_tokens: 10,
                evaluation_tokens: 4,
            },
        };
        let value = serde_json::to_value(&entry)?;
        assert_eq!(value["textIssue"], json!("NONE"));
        assert_eq!(value["generationModelId"], json!("gen"));
        assert_eq!(value["usage"]["evaluationTokens"], json!(4));
        assert!(entry.was_evaluated());
        Ok(())
    }

    #[test]
    fn token_usage_totals_and_summaries_accumulate() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);

        let mut total = UsageSummary::default();
        total.add(&UsageSummary {
            generation_tokens: 5,
            evaluation_tokens: 1,
        });
        total.add(&UsageSummary {
            generation_tokens: 2,
            evaluation_tokens: 3,
        });
        assert_eq!(total.generation_tokens, 7);
        assert_eq!(total.evaluation_tokens, 4);
    }
}
