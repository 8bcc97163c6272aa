use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::image_data::ImageData;
use crate::quality::{TextIssue, UsageSummary};

/// One entry of a session's retry history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RetryAttempt {
    Generation {
        attempt: u32,
        score: Option<u8>,
        text_issue: Option<TextIssue>,
        image_data: ImageData,
        model_id: String,
    },
    SafetyBlockRewrite {
        attempt: u32,
        original_scene: String,
        rewritten_scene: String,
        error: String,
    },
    GenerationFailed {
        attempt: u32,
        error: String,
    },
}

impl RetryAttempt {
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Generation { attempt, .. }
            | Self::SafetyBlockRewrite { attempt, .. }
            | Self::GenerationFailed { attempt, .. } => *attempt,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generation { .. } => "generation",
            Self::SafetyBlockRewrite { .. } => "safetyBlockRewrite",
            Self::GenerationFailed { .. } => "generationFailed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOutcome {
    Accepted,
    Exhausted,
}

/// What a retry session hands back to page assembly and usage telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IllustrationResult {
    pub outcome: SessionOutcome,
    pub image_data: ImageData,
    pub score: Option<u8>,
    pub reasoning: Option<String>,
    pub text_issue: Option<TextIssue>,
    pub was_regenerated: bool,
    pub retry_history: Vec<RetryAttempt>,
    pub total_attempts: u32,
    pub generation_model_id: String,
    pub evaluation_model_id: Option<String>,
    /// Usage recorded with the returned image.
    pub usage: UsageSummary,
    /// Usage across every fresh generation in the session.
    pub session_usage: UsageSummary,
    pub scene_was_rewritten: bool,
}

impl IllustrationResult {
    pub fn is_accepted(&self) -> bool {
        self.outcome == SessionOutcome::Accepted
    }

    /// JSON view with every image payload replaced by `<omitted>`.
    pub fn summary(&self) -> Value {
        strip_image_payloads(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

fn strip_image_payloads(value: &Value) -> Value {
    match value {
        Value::Array(rows) => Value::Array(rows.iter().map(strip_image_payloads).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                if key == "imageData" {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), strip_image_payloads(row));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{IllustrationResult, RetryAttempt, SessionOutcome};
    use crate::image_data::ImageData;
    use crate::quality::{TextIssue, UsageSummary};

    fn sample_result() -> IllustrationResult {
        IllustrationResult {
            outcome: SessionOutcome::Accepted,
            image_data: ImageData::png(vec![1, 2, 3]),
            score: Some(90),
            reasoning: Some("matches the brief".to_string()),
            text_issue: None,
            was_regenerated: true,
            retry_history: vec![
                RetryAttempt::SafetyBlockRewrite {
                    attempt: 1,
                    original_scene: "a duel".to_string(),
                    rewritten_scene: "a friendly contest".to_string(),
                    error: "blocked".to_string(),
                },
                RetryAttempt::Generation {
                    attempt: 1,
                    score: Some(90),
                    text_issue: Some(TextIssue::None),
                    image_data: ImageData::png(vec![1, 2, 3]),
                    model_id: "gen".to_string(),
                },
            ],
            total_attempts: 1,
            generation_model_id: "gen".to_string(),
            evaluation_model_id: Some("eval".to_string()),
            usage: UsageSummary::default(),
            session_usage: UsageSummary::default(),
            scene_was_rewritten: true,
        }
    }

    #[test]
    fn history_entries_are_tagged_by_kind() -> anyhow::Result<()> {
        let value = serde_json::to_value(sample_result().retry_history)?;
        assert_eq!(value[0]["kind"], json!("safetyBlockRewrite"));
        assert_eq!(value[0]["originalScene"], json!("a duel"));
        assert_eq!(value[1]["kind"], json!("generation"));
        assert_eq!(value[1]["modelId"], json!("gen"));
        assert_eq!(value[1]["textIssue"], json!("NONE"));
        Ok(())
    }

    #[test]
    fn summary_omits_image_payloads() {
        let summary = sample_result().summary();
        assert_eq!(summary["imageData"], json!("<omitted>"));
        assert_eq!(summary["retryHistory"][1]["imageData"], json!("<omitted>"));
        assert_eq!(summary["outcome"], json!("ACCEPTED"));
        assert_eq!(summary["totalAttempts"], json!(1));
    }

    #[test]
    fn attempt_accessors_cover_every_variant() {
        let failed = RetryAttempt::GenerationFailed {
            attempt: 3,
            error: "network".to_string(),
        };
        assert_eq!(failed.attempt(), 3);
        assert_eq!(failed.kind(), "generationFailed");
        assert!(sample_result().is_accepted());
    }
}
