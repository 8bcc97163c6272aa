mod gemini;

use folio_contracts::image_data::ImageData;
use folio_contracts::quality::{RawEvaluation, TokenUsage};
use folio_contracts::request::EvaluationMode;

use crate::error::ProviderError;
use crate::imaging::solid_color_png;

pub use gemini::{GeminiClient, GeminiEvaluator, GeminiGenerator, GeminiRewriter};

/// An inline image with an optional label sent as a preceding text part.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImage {
    pub label: Option<String>,
    pub image: ImageData,
}

#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub model: String,
    pub prompt: String,
    pub references: Vec<LabeledImage>,
    /// Already cropped for continuity.
    pub previous_page: Option<ImageData>,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub image: ImageData,
    pub model_id: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct EvaluationCall {
    pub model: String,
    pub image: ImageData,
    pub prompt: String,
    pub references: Vec<LabeledImage>,
    pub mode: EvaluationMode,
    pub expected_text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RewriteCall {
    pub model: String,
    pub scene: String,
    /// Full prompt for continuity context; not to be echoed back.
    pub prompt: String,
}

pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, call: &GenerationCall) -> Result<GeneratedImage, ProviderError>;
}

pub trait EvaluationProvider: Send + Sync {
    fn name(&self) -> &str;
    /// `Ok(None)` means no evaluator is available; that is not an error.
    fn evaluate(&self, call: &EvaluationCall) -> Result<Option<RawEvaluation>, ProviderError>;
}

pub trait RewriteProvider: Send + Sync {
    fn name(&self) -> &str;
    fn rewrite_scene(&self, call: &RewriteCall) -> Result<String, ProviderError>;
}

/// Solid-color PNG per prompt, no network.
pub struct DryrunGenerator {
    pub width: u32,
    pub height: u32,
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
        }
    }
}

impl GenerationProvider for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, call: &GenerationCall) -> Result<GeneratedImage, ProviderError> {
        let image = solid_color_png(&call.prompt, self.width, self.height)
            .map_err(|err| ProviderError::MalformedResponse(format!("{err:#}")))?;
        Ok(GeneratedImage {
            image,
            model_id: call.model.clone(),
            usage: TokenUsage::default(),
        })
    }
}

/// Always reports "no evaluator configured".
pub struct DryrunEvaluator;

impl EvaluationProvider for DryrunEvaluator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn evaluate(&self, _call: &EvaluationCall) -> Result<Option<RawEvaluation>, ProviderError> {
        Ok(None)
    }
}

pub struct DryrunRewriter;

impl RewriteProvider for DryrunRewriter {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn rewrite_scene(&self, _call: &RewriteCall) -> Result<String, ProviderError> {
        Err(ProviderError::unavailable(
            "dryrun",
            "scene rewriting needs a text provider",
        ))
    }
}
