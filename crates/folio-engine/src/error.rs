use thiserror::Error;

/// Classified provider failures. The retry controller only branches on
/// [`ProviderError::SafetyBlocked`]; everything else consumes an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("{provider} is not configured: {reason}")]
    Unavailable { provider: String, reason: String },

    #[error("content blocked by provider safety policy: {0}")]
    SafetyBlocked(String),

    #[error("provider returned no usable output: {0}")]
    MalformedResponse(String),

    #[error("provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider request failed ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    pub fn unavailable(provider: &str, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_safety_block(&self) -> bool {
        matches!(self, Self::SafetyBlocked(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_))
    }

    /// Maps a non-success HTTP status to the taxonomy.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate_text(body.trim(), 512);
        match status {
            429 => Self::RateLimited(message),
            401 | 403 => Self::Unavailable {
                provider: "provider".to_string(),
                reason: format!("credentials rejected ({status}): {message}"),
            },
            _ => Self::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), &err.to_string());
        }
        Self::Network(err.to_string())
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
