use std::env;
use std::str::FromStr;

use tracing::warn;

pub const DEFAULT_QUALITY_THRESHOLD: u8 = 50;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_GENERATION_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_EVALUATION_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REWRITE_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REQUEST_TIMEOUT_S: f64 = 120.0;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Minimum normalized score (0-100) for acceptance, applied to every mode.
    pub quality_threshold: u8,
    pub max_attempts: u32,
    /// Accept the first image outright when no evaluator is available.
    pub accept_unevaluated: bool,
    pub generation_model: String,
    pub evaluation_model: String,
    pub rewrite_model: String,
    pub request_timeout_s: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            accept_unevaluated: false,
            generation_model: DEFAULT_GENERATION_MODEL.to_string(),
            evaluation_model: DEFAULT_EVALUATION_MODEL.to_string(),
            rewrite_model: DEFAULT_REWRITE_MODEL.to_string(),
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(non_empty_env)
    }

    /// Builds a config from an arbitrary key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let threshold = parse_or_default::<u32>(
            &lookup,
            "IMAGE_QUALITY_THRESHOLD",
            u32::from(defaults.quality_threshold),
        );
        Self {
            quality_threshold: threshold.min(100) as u8,
            max_attempts: parse_or_default(&lookup, "IMAGE_MAX_ATTEMPTS", defaults.max_attempts)
                .max(1),
            accept_unevaluated: lookup("IMAGE_ACCEPT_UNEVALUATED")
                .and_then(|raw| parse_bool(&raw))
                .unwrap_or(defaults.accept_unevaluated),
            generation_model: lookup("IMAGE_GENERATION_MODEL")
                .unwrap_or(defaults.generation_model),
            evaluation_model: lookup("IMAGE_EVALUATION_MODEL")
                .unwrap_or(defaults.evaluation_model),
            rewrite_model: lookup("SCENE_REWRITE_MODEL").unwrap_or(defaults.rewrite_model),
            request_timeout_s: parse_or_default(
                &lookup,
                "PROVIDER_REQUEST_TIMEOUT",
                defaults.request_timeout_s,
            )
            .clamp(5.0, 600.0),
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or_default<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "ignoring unparseable config value");
            default
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
