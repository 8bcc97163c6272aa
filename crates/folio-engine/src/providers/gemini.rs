use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use folio_contracts::image_data::ImageData;
use folio_contracts::quality::{RawEvaluation, TokenUsage};
use folio_contracts::request::EvaluationMode;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{
    EvaluationCall, EvaluationProvider, GeneratedImage, GenerationCall, GenerationProvider,
    LabeledImage, RewriteCall, RewriteProvider,
};
use crate::config::non_empty_env;
use crate::error::{truncate_text, ProviderError};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

/// Shared transport for the three Gemini adapters.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(api_base: &str, api_key: Option<String>, timeout_s: f64) -> Self {
        Self {
            api_base: api_base.trim().trim_end_matches('/').to_string(),
            api_key: api_key
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
            http: HttpClient::new(),
            timeout: Duration::from_secs_f64(timeout_s.max(1.0)),
        }
    }

    pub fn from_env(timeout_s: f64) -> Self {
        let api_base = non_empty_env("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let api_key = non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"));
        Self::new(&api_base, api_key, timeout_s)
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn generate_content(&self, model: &str, payload: &Value) -> Result<Value, ProviderError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(ProviderError::unavailable(
                "gemini",
                "GEMINI_API_KEY or GOOGLE_API_KEY not set",
            ));
        };
        let endpoint = self.endpoint_for_model(model);
        debug!(%endpoint, "gemini generateContent");
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(payload)
            .send()?;
        response_json_or_error(response)
    }
}

pub struct GeminiGenerator {
    client: GeminiClient,
}

impl GeminiGenerator {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    fn build_parts(call: &GenerationCall) -> Vec<Value> {
        let mut parts = Vec::new();
        push_labeled_images(&mut parts, &call.references, "Reference photo");
        if let Some(previous) = call.previous_page.as_ref() {
            parts.push(json!({
                "text": "Previous page (cropped). Match its art style, palette and character designs; do not reproduce its composition.",
            }));
            parts.push(inline_part(previous));
        }
        parts.push(json!({ "text": call.prompt }));
        parts
    }
}

impl GenerationProvider for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, call: &GenerationCall) -> Result<GeneratedImage, ProviderError> {
        let payload = json!({
            "contents": [{ "role": "user", "parts": Self::build_parts(call) }],
            "generationConfig": {
                "candidateCount": 1,
                "responseModalities": ["IMAGE"],
            },
        });
        let response = self.client.generate_content(&call.model, &payload)?;
        if let Some(reason) = block_reason(&response) {
            return Err(ProviderError::SafetyBlocked(reason));
        }
        let Some(image) = extract_image(&response)? else {
            return Err(ProviderError::MalformedResponse(
                "Gemini returned no image".to_string(),
            ));
        };
        Ok(GeneratedImage {
            image,
            model_id: response_model_id(&response).unwrap_or_else(|| call.model.clone()),
            usage: extract_usage(&response),
        })
    }
}

pub struct GeminiEvaluator {
    client: GeminiClient,
}

impl GeminiEvaluator {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    fn rubric(call: &EvaluationCall) -> String {
        let mut rubric = format!(
            "You are reviewing an illustration for a children's picture book.\n\
Score how well the GENERATED IMAGE matches the PROMPT and, when reference photos are given, \
whether the characters resemble them. Penalise anatomy errors, extra limbs, duplicated \
characters, garbled details and style breaks.\n\
Return JSON only (no markdown) with this schema:\n\
{{\"score\": 0-10 number, \"verdict\": \"PASS|FAIL\", \"reasoning\": \"string\", \
\"text_issue\": \"NONE|MISSING|WRONG|EXTRA\", \"expected_text\": \"string\", \"actual_text\": \"string\"}}\n\
PROMPT:\n{}",
            call.prompt
        );
        if call.mode == EvaluationMode::Cover {
            let expected = call.expected_text.as_deref().unwrap_or("NO TEXT");
            rubric.push_str(&format!(
                "\n\nThis is the BOOK COVER. Read every piece of text on the image and compare it \
character by character with EXPECTED TEXT: \"{expected}\".\n\
- text_issue NONE: the text matches exactly.\n\
- MISSING: expected text is absent. WRONG: misspelled or altered. EXTRA: additional text appears.\n\
If EXPECTED TEXT is NO TEXT the cover must not contain any lettering."
            ));
        } else {
            rubric.push_str("\n\nThis is an interior page; it should contain no lettering. Use text_issue NONE unless stray text appears (EXTRA).");
        }
        rubric
    }
}

impl EvaluationProvider for GeminiEvaluator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn evaluate(&self, call: &EvaluationCall) -> Result<Option<RawEvaluation>, ProviderError> {
        if !self.client.is_configured() {
            return Ok(None);
        }
        let mut parts = vec![json!({ "text": Self::rubric(call) })];
        parts.push(json!({ "text": "GENERATED IMAGE:" }));
        parts.push(inline_part(&call.image));
        push_labeled_images(&mut parts, &call.references, "Reference photo");

        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": 0.2,
                "responseMimeType": "application/json",
            },
        });
        let response = self.client.generate_content(&call.model, &payload)?;
        let text = extract_text(&response);
        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "Gemini evaluation returned no text".to_string(),
            ));
        }
        Ok(Some(parse_evaluation_text(&text, extract_usage(&response))))
    }
}

pub struct GeminiRewriter {
    client: GeminiClient,
}

impl GeminiRewriter {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

impl RewriteProvider for GeminiRewriter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn rewrite_scene(&self, call: &RewriteCall) -> Result<String, ProviderError> {
        let instruction = format!(
            "An image generator refused the scene below from a children's storybook because of its \
content policy. Rewrite the scene so it keeps the same story beat, characters, setting and \
emotional tone, but removes anything that could read as violent, frightening, unsafe or \
suggestive. Keep it about the same length. Return only the rewritten scene text.\n\n\
STORY CONTEXT:\n{}\n\nSCENE:\n{}",
            truncate_text(&call.prompt, 2000),
            call.scene
        );
        let payload = json!({
            "contents": [{ "role": "user", "parts": [{ "text": instruction }] }],
            "generationConfig": { "temperature": 0.7 },
        });
        let response = self.client.generate_content(&call.model, &payload)?;
        if let Some(reason) = block_reason(&response) {
            return Err(ProviderError::SafetyBlocked(reason));
        }
        let rewritten = strip_code_fence(&extract_text(&response));
        if rewritten.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "Gemini rewrite returned no text".to_string(),
            ));
        }
        Ok(rewritten)
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, ProviderError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| ProviderError::Network(format!("Gemini response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| {
        ProviderError::MalformedResponse(format!("Gemini returned invalid JSON payload: {err}"))
    })
}

fn inline_part(image: &ImageData) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.to_base64(),
        }
    })
}

fn push_labeled_images(parts: &mut Vec<Value>, images: &[LabeledImage], prefix: &str) {
    for labeled in images {
        if let Some(label) = labeled.label.as_deref() {
            parts.push(json!({ "text": format!("{prefix}: {label}") }));
        }
        parts.push(inline_part(&labeled.image));
    }
}

fn candidate_parts(payload: &Value) -> Vec<Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
        })
        .flatten()
        .cloned()
        .collect()
}

/// Safety rejection reason, from either prompt feedback or a candidate's
/// finish reason.
pub(crate) fn block_reason(payload: &Value) -> Option<String> {
    let feedback = payload
        .get("promptFeedback")
        .or_else(|| payload.get("prompt_feedback"));
    if let Some(reason) = feedback
        .and_then(|feedback| feedback.get("blockReason").or_else(|| feedback.get("block_reason")))
        .and_then(Value::as_str)
        .filter(|reason| !reason.is_empty())
    {
        return Some(reason.to_string());
    }
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("finishReason")
                .or_else(|| candidate.get("finish_reason"))
                .and_then(Value::as_str)
        })
        .find(|reason| SAFETY_FINISH_REASONS.contains(reason))
        .map(str::to_string)
}

/// First inline image, accepting both camelCase and snake_case field names.
pub(crate) fn extract_image(payload: &Value) -> Result<Option<ImageData>, ProviderError> {
    for part in candidate_parts(payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
            ProviderError::MalformedResponse(format!("Gemini image base64 decode failed: {err}"))
        })?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        return Ok(Some(ImageData::new(mime_type, bytes)));
    }
    Ok(None)
}

pub(crate) fn extract_text(payload: &Value) -> String {
    candidate_parts(payload)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}

pub(crate) fn extract_usage(payload: &Value) -> TokenUsage {
    let Some(metadata) = payload
        .get("usageMetadata")
        .or_else(|| payload.get("usage_metadata"))
        .and_then(Value::as_object)
    else {
        return TokenUsage::default();
    };
    let read = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| metadata.get(*key).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    let input = read(&["promptTokenCount", "prompt_token_count"]);
    let output = read(&["candidatesTokenCount", "candidates_token_count"]);
    let total = read(&["totalTokenCount", "total_token_count"]);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total.max(input + output),
    }
}

fn response_model_id(payload: &Value) -> Option<String> {
    payload
        .get("modelVersion")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Structured fields when the reply is JSON; otherwise the free text is kept
/// for the quality gate's text parsers.
pub(crate) fn parse_evaluation_text(text: &str, usage: TokenUsage) -> RawEvaluation {
    let Some(object) = extract_json_object_from_text(text) else {
        return RawEvaluation {
            raw_text: Some(text.to_string()),
            usage,
            ..RawEvaluation::default()
        };
    };
    let field = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    RawEvaluation {
        score: object
            .get("score")
            .or_else(|| object.get("quality_score"))
            .filter(|value| !value.is_null())
            .cloned(),
        verdict: field(&["verdict"]),
        reasoning: field(&["reasoning", "reason"]),
        text_issue: field(&["text_issue", "textIssue"]),
        expected_text: field(&["expected_text", "expectedText"]),
        actual_text: field(&["actual_text", "actualText"]),
        raw_text: Some(text.to_string()),
        usage,
    }
}

fn extract_json_object_from_text(text: &str) -> Option<Map<String, Value>> {
    let raw = strip_code_fence(text);
    if raw.is_empty() {
        return None;
    }
    let mut candidates = vec![raw.clone()];
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if end > start {
            candidates.push(raw[start..=end].to_string());
        }
    }
    candidates.into_iter().find_map(|candidate| {
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .and_then(|parsed| parsed.as_object().cloned())
    })
}

fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end().trim_end_matches("```").trim().to_string()
}

#[cfg(test)]
mod tests {
    use folio_contracts::image_data::ImageData;
    use folio_contracts::quality::TokenUsage;
    use folio_contracts::request::EvaluationMode;
    use serde_json::json;

    use super::{
        block_reason, extract_image, extract_text, extract_usage, parse_evaluation_text,
        strip_code_fence, GeminiClient, GeminiEvaluator, GeminiGenerator,
    };
    use crate::error::ProviderError;
    use crate::providers::{
        EvaluationCall, EvaluationProvider, GenerationCall, GenerationProvider, LabeledImage,
    };
    use crate::quality_gate::normalize_score;

    fn unconfigured() -> GeminiClient {
        GeminiClient::new("http://127.0.0.1:9/v1beta/", None, 5.0)
    }

    #[test]
    fn extracts_images_in_either_casing() -> anyhow::Result<()> {
        let camel = json!({"candidates": [{"content": {"parts": [
            {"text": "here you go"},
            {"inlineData": {"mimeType": "image/jpeg", "data": "AQID"}}
        ]}}]});
        let snake = json!({"candidates": [{"content": {"parts": [
            {"inline_data": {"mime_type": "image/webp", "data": "BAU="}}
        ]}}]});
        assert_eq!(
            extract_image(&camel)?,
            Some(ImageData::jpeg(vec![1, 2, 3]))
        );
        assert_eq!(
            extract_image(&snake)?,
            Some(ImageData::new("image/webp", vec![4, 5]))
        );
        assert_eq!(extract_image(&json!({"candidates": []}))?, None);
        Ok(())
    }

    #[test]
    fn corrupt_image_payload_is_malformed() {
        let payload = json!({"candidates": [{"content": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "%%%"}}
        ]}}]});
        assert!(matches!(
            extract_image(&payload),
            Err(ProviderError::MalformedResponse(_))
        ));
    }

    #[test]
    fn detects_prompt_and_candidate_safety_blocks() {
        assert_eq!(
            block_reason(&json!({"promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}})),
            Some("PROHIBITED_CONTENT".to_string())
        );
        assert_eq!(
            block_reason(&json!({"candidates": [{"finishReason": "IMAGE_SAFETY"}]})),
            Some("IMAGE_SAFETY".to_string())
        );
        assert_eq!(
            block_reason(&json!({"candidates": [{"finishReason": "STOP"}]})),
            None
        );
    }

    #[test]
    fn reads_usage_metadata() {
        let usage = extract_usage(&json!({"usageMetadata": {
            "promptTokenCount": 120, "candidatesTokenCount": 1290, "totalTokenCount": 1410
        }}));
        assert_eq!(usage, TokenUsage::new(120, 1290));
        assert_eq!(extract_usage(&json!({})), TokenUsage::default());
    }

    #[test]
    fn parses_fenced_json_evaluation() {
        let text = "```json\n{\"score\": 8, \"verdict\": \"PASS\", \"reasoning\": \"faithful\", \"text_issue\": \"NONE\"}\n```";
        let parsed = parse_evaluation_text(text, TokenUsage::new(1, 2));
        assert_eq!(parsed.score, Some(json!(8)));
        assert_eq!(parsed.verdict.as_deref(), Some("PASS"));
        assert_eq!(parsed.text_issue.as_deref(), Some("NONE"));
        assert_eq!(parsed.usage.total_tokens, 3);
    }

    #[test]
    fn fractional_string_score_in_json_reply_is_scored() {
        let parsed = parse_evaluation_text(
            "{\"score\": \"8/10\", \"verdict\": \"PASS\"}",
            TokenUsage::default(),
        );
        assert_eq!(parsed.score, Some(json!("8/10")));
        assert_eq!(normalize_score(&parsed), Some(80));
    }

    #[test]
    fn free_text_evaluation_keeps_raw_text() {
        let parsed = parse_evaluation_text("Looks great. Score: 7/10", TokenUsage::default());
        assert_eq!(parsed.score, None);
        assert_eq!(parsed.raw_text.as_deref(), Some("Looks great. Score: 7/10"));
        assert_eq!(strip_code_fence("```\nhello\n```"), "hello");
        assert_eq!(
            extract_text(&json!({"candidates": [{"content": {"parts": [{"text": " a "}, {"text": "b"}]}}]})),
            "a\nb"
        );
    }

    #[test]
    fn unconfigured_client_degrades_per_adapter() -> anyhow::Result<()> {
        let image = ImageData::png(vec![1]);
        let evaluation = GeminiEvaluator::new(unconfigured()).evaluate(&EvaluationCall {
            model: "gemini-2.5-flash".to_string(),
            image: image.clone(),
            prompt: "p".to_string(),
            references: Vec::new(),
            mode: EvaluationMode::Scene,
            expected_text: None,
        })?;
        assert!(evaluation.is_none());

        let generation = GeminiGenerator::new(unconfigured()).generate(&GenerationCall {
            model: "gemini-2.5-flash-image".to_string(),
            prompt: "p".to_string(),
            references: vec![LabeledImage {
                label: Some("Mia".to_string()),
                image,
            }],
            previous_page: None,
        });
        assert!(matches!(generation, Err(ProviderError::Unavailable { .. })));
        Ok(())
    }

    #[test]
    fn generation_parts_label_references_and_end_with_prompt() {
        let call = GenerationCall {
            model: "m".to_string(),
            prompt: "Mia flies a kite".to_string(),
            references: vec![
                LabeledImage {
                    label: Some("Mia".to_string()),
                    image: ImageData::png(vec![1]),
                },
                LabeledImage {
                    label: None,
                    image: ImageData::png(vec![2]),
                },
            ],
            previous_page: Some(ImageData::jpeg(vec![3])),
        };
        let parts = GeminiGenerator::build_parts(&call);
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0]["text"], json!("Reference photo: Mia"));
        assert!(parts[1].get("inlineData").is_some());
        assert!(parts[2].get("inlineData").is_some());
        assert_eq!(parts[5]["text"], json!("Mia flies a kite"));
    }

    #[test]
    fn cover_rubric_names_expected_text() {
        let call = EvaluationCall {
            model: "m".to_string(),
            image: ImageData::png(vec![1]),
            prompt: "cover".to_string(),
            references: Vec::new(),
            mode: EvaluationMode::Cover,
            expected_text: Some("Mia's Big Day".to_string()),
        };
        assert!(GeminiEvaluator::rubric(&call).contains("EXPECTED TEXT: \"Mia's Big Day\""));
    }
}
