use std::sync::OnceLock;

use folio_contracts::quality::{QualityResult, RawEvaluation, TextIssue};
use folio_contracts::request::EvaluationMode;
use regex::Regex;
use serde_json::Value;

type ScoreParser = fn(&RawEvaluation) -> Option<u8>;

/// Tried in order; the first parser that recognises the evaluation wins.
const SCORE_PARSERS: &[ScoreParser] = &[
    structured_out_of_ten,
    text_out_of_ten,
    text_out_of_hundred,
    bare_numeric,
];

const NO_TEXT_MARKERS: &[&str] = &["no text", "none", "no-text", "(no text)"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    /// Score used for gating and best-result tracking; unscored counts as 0.
    pub effective_score: u8,
    pub accepted: bool,
    pub blocking_text_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityGate {
    threshold: u8,
}

impl QualityGate {
    pub fn new(threshold: u8) -> Self {
        Self {
            threshold: threshold.min(100),
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn normalize(&self, raw: &RawEvaluation) -> QualityResult {
        let score = normalize_score(raw);
        let verdict = raw.verdict.clone().unwrap_or_else(|| match score {
            Some(value) if value >= self.threshold => "PASS".to_string(),
            Some(_) => "FAIL".to_string(),
            None => "UNSCORED".to_string(),
        });
        QualityResult {
            score,
            verdict,
            reasoning: raw
                .reasoning
                .clone()
                .or_else(|| raw.raw_text.clone())
                .unwrap_or_default(),
            text_issue: raw.text_issue.as_deref().and_then(TextIssue::parse),
            expected_text: raw.expected_text.clone(),
            actual_text: raw.actual_text.clone(),
            usage: raw.usage,
        }
    }

    pub fn decide(
        &self,
        score: Option<u8>,
        text_issue: Option<TextIssue>,
        mode: EvaluationMode,
        expected_text: Option<&str>,
    ) -> GateDecision {
        let effective_score = score.unwrap_or(0);
        let blocking_text_error = has_blocking_text_error(text_issue, mode, expected_text);
        GateDecision {
            effective_score,
            accepted: score.is_some()
                && effective_score >= self.threshold
                && !blocking_text_error,
            blocking_text_error,
        }
    }
}

pub fn normalize_score(raw: &RawEvaluation) -> Option<u8> {
    SCORE_PARSERS.iter().find_map(|parser| parser(raw))
}

/// Cover-only. A missing-text report is not an error when the cover was
/// supposed to carry no text.
pub fn has_blocking_text_error(
    text_issue: Option<TextIssue>,
    mode: EvaluationMode,
    expected_text: Option<&str>,
) -> bool {
    if mode != EvaluationMode::Cover {
        return false;
    }
    match text_issue {
        Some(TextIssue::Missing) if expected_text.map(is_no_text).unwrap_or(false) => false,
        Some(issue) => issue.is_issue(),
        None => false,
    }
}

pub fn is_no_text(expected_text: &str) -> bool {
    let folded = expected_text.trim().to_lowercase();
    NO_TEXT_MARKERS.contains(&folded.as_str())
}

fn structured_out_of_ten(raw: &RawEvaluation) -> Option<u8> {
    let value = raw.score.as_ref()?.as_f64()?;
    scale(value, 10.0)
}

fn text_out_of_ten(raw: &RawEvaluation) -> Option<u8> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r#"(?i)(?:score"?\s*[:=]?\s*"?|^\s*)(\d+(?:\.\d+)?)\s*/\s*10\b"#).ok())
        .as_ref()?;
    first_capture(pattern, raw).and_then(|value| scale(value, 10.0))
}

fn text_out_of_hundred(raw: &RawEvaluation) -> Option<u8> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r#"(?i)(?:score"?\s*[:=]?\s*"?|^\s*)(\d+(?:\.\d+)?)\s*/\s*100\b"#).ok())
        .as_ref()?;
    first_capture(pattern, raw).and_then(|value| scale(value, 100.0))
}

fn bare_numeric(raw: &RawEvaluation) -> Option<u8> {
    let value = match raw.score.as_ref()? {
        Value::String(text) => text.trim().parse::<f64>().ok()?,
        Value::Number(number) => number.as_f64()?,
        _ => return None,
    };
    scale(value, 100.0)
}

fn first_capture(pattern: &Regex, raw: &RawEvaluation) -> Option<f64> {
    let score_text = raw.score.as_ref().and_then(Value::as_str);
    [
        score_text,
        raw.raw_text.as_deref(),
        raw.verdict.as_deref(),
        raw.reasoning.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find_map(|text| {
        pattern
            .captures(text)
            .and_then(|captures| captures.get(1))
            .and_then(|group| group.as_str().parse::<f64>().ok())
    })
}

/// Maps `value` on a 0..=`max` scale onto 0..=100, rejecting out-of-range input.
fn scale(value: f64, max: f64) -> Option<u8> {
    if !value.is_finite() || value < 0.0 || value > max {
        return None;
    }
    Some((value * 100.0 / max).round() as u8)
}
