use std::sync::Arc;

use folio_contracts::image_data::{is_image_data_uri, ImageData};
use folio_contracts::models::{Capability, ModelSelector};
use folio_contracts::request::GenerationRequest;
use folio_contracts::session::IllustrationResult;
use tracing::{debug, warn};

use crate::compression::{CompressionCache, CompressionProfile};
use crate::config::EngineConfig;
use crate::error::ProviderError;
use crate::imaging::continuity_page;
use crate::providers::{
    DryrunEvaluator, DryrunGenerator, DryrunRewriter, EvaluationProvider, GeminiClient,
    GeminiEvaluator, GeminiGenerator, GeminiRewriter, GenerationProvider, LabeledImage,
    RewriteProvider,
};
use crate::quality_gate::QualityGate;
use crate::result_cache::ResultCache;
use crate::retry::{Collaborators, ModelFallback, RetrySession, SessionHooks, SessionPlan};

/// Long-lived generation service. Build once and share (`Arc`) across
/// sessions; the result cache and both reference caches live as long as it.
pub struct IllustrationEngine {
    config: EngineConfig,
    selector: ModelSelector,
    generator: Arc<dyn GenerationProvider>,
    evaluator: Arc<dyn EvaluationProvider>,
    rewriter: Arc<dyn RewriteProvider>,
    results: Arc<ResultCache>,
    generation_refs: CompressionCache,
    evaluation_refs: CompressionCache,
}

impl IllustrationEngine {
    pub fn new(
        config: EngineConfig,
        generator: Arc<dyn GenerationProvider>,
        evaluator: Arc<dyn EvaluationProvider>,
        rewriter: Arc<dyn RewriteProvider>,
    ) -> Self {
        Self {
            config,
            selector: ModelSelector::default(),
            generator,
            evaluator,
            rewriter,
            results: Arc::new(ResultCache::new()),
            generation_refs: CompressionCache::new(CompressionProfile::GENERATION),
            evaluation_refs: CompressionCache::new(CompressionProfile::EVALUATION),
        }
    }

    /// Gemini adapters with credentials from the environment.
    pub fn gemini(config: EngineConfig) -> Self {
        let client = GeminiClient::from_env(config.request_timeout_s);
        if !client.is_configured() {
            warn!("GEMINI_API_KEY/GOOGLE_API_KEY not set; generation will fail and evaluation is disabled");
        }
        Self::new(
            config,
            Arc::new(GeminiGenerator::new(client.clone())),
            Arc::new(GeminiEvaluator::new(client.clone())),
            Arc::new(GeminiRewriter::new(client)),
        )
    }

    /// Offline adapters; no credentials needed.
    pub fn dryrun(config: EngineConfig) -> Self {
        let config = EngineConfig {
            generation_model: "dryrun-image-1".to_string(),
            evaluation_model: "dryrun-vision-1".to_string(),
            rewrite_model: "dryrun-vision-1".to_string(),
            ..config
        };
        Self::new(
            config,
            Arc::new(DryrunGenerator::default()),
            Arc::new(DryrunEvaluator),
            Arc::new(DryrunRewriter),
        )
    }

    pub fn with_result_cache(mut self, results: Arc<ResultCache>) -> Self {
        self.results = results;
        self
    }

    pub fn with_model_selector(mut self, selector: ModelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.results
    }

    /// Runs one retry session for `request`.
    ///
    /// Returns the accepted image, or the best attempt once attempts run
    /// out. Errors only when no attempt produced an image, or when no model
    /// can serve the request.
    pub fn illustrate(
        &self,
        request: &GenerationRequest,
        hooks: &SessionHooks,
    ) -> Result<IllustrationResult, ProviderError> {
        let plan = self.plan(request)?;
        let ctx = Collaborators {
            generator: self.generator.as_ref(),
            evaluator: self.evaluator.as_ref(),
            rewriter: self.rewriter.as_ref(),
            cache: self.results.as_ref(),
            gate: QualityGate::new(self.config.quality_threshold),
            max_attempts: self.config.max_attempts.max(1),
            accept_unevaluated: self.config.accept_unevaluated,
        };
        RetrySession::new(ctx, plan, hooks).run()
    }

    fn plan(&self, request: &GenerationRequest) -> Result<SessionPlan, ProviderError> {
        let mut model_fallbacks = Vec::new();
        let generation_model = self.resolve_model(
            request.generation_override(),
            Capability::Image,
            &self.config.generation_model,
            &mut model_fallbacks,
        )?;
        let evaluation_model = self.resolve_model(
            request.evaluation_override(),
            Capability::Vision,
            &self.config.evaluation_model,
            &mut model_fallbacks,
        )?;
        let rewrite_model = self.resolve_model(
            None,
            Capability::Text,
            &self.config.rewrite_model,
            &mut model_fallbacks,
        )?;
        let (generation_refs, evaluation_refs) = self.prepare_references(request);
        let previous_page = self.prepare_previous_page(request);
        Ok(SessionPlan {
            prompt: request.prompt.clone(),
            references: request.reference_photos.clone(),
            // Only a page that was actually chained in marks the result as sequential.
            sequential: previous_page.is_some(),
            generation_refs,
            evaluation_refs,
            previous_page,
            mode: request.evaluation_mode,
            expected_text: request.expected_text.clone(),
            generation_model,
            evaluation_model,
            rewrite_model,
            model_fallbacks,
        })
    }

    fn resolve_model(
        &self,
        requested: Option<&str>,
        capability: Capability,
        default_model: &str,
        fallbacks: &mut Vec<ModelFallback>,
    ) -> Result<String, ProviderError> {
        let selection = self
            .selector
            .select(requested, capability, default_model)
            .map_err(|reason| ProviderError::unavailable("models", reason))?;
        if let Some(reason) = selection.fallback_reason {
            warn!(model = %selection.model.name, %reason, "model fallback");
            fallbacks.push(ModelFallback {
                capability: capability.as_str(),
                requested: selection.requested,
                model: selection.model.name.clone(),
                reason,
            });
        }
        Ok(selection.model.name)
    }

    /// Decodes and compresses each image reference under both profiles.
    /// References that are not image data, or fail to decode, are skipped.
    fn prepare_references(
        &self,
        request: &GenerationRequest,
    ) -> (Vec<LabeledImage>, Vec<LabeledImage>) {
        let mut generation = Vec::new();
        let mut evaluation = Vec::new();
        for reference in &request.reference_photos {
            if !is_image_data_uri(reference.uri()) {
                debug!(name = ?reference.name(), "skipping non-image reference");
                continue;
            }
            let label = reference.name().map(str::to_string);
            let prepared = ImageData::from_data_uri(reference.uri()).and_then(|original| {
                Ok((
                    self.generation_refs.compress(&original)?,
                    self.evaluation_refs.compress(&original)?,
                ))
            });
            match prepared {
                Ok((for_generation, for_evaluation)) => {
                    generation.push(LabeledImage {
                        label: label.clone(),
                        image: for_generation,
                    });
                    evaluation.push(LabeledImage {
                        label,
                        image: for_evaluation,
                    });
                }
                Err(err) => {
                    warn!(name = ?label, error = %format!("{err:#}"), "reference photo skipped")
                }
            }
        }
        (generation, evaluation)
    }

    fn prepare_previous_page(&self, request: &GenerationRequest) -> Option<ImageData> {
        let uri = request.previous_image.as_deref()?.trim();
        if uri.is_empty() {
            return None;
        }
        let profile = CompressionProfile::GENERATION;
        let prepared = ImageData::from_data_uri(uri)
            .and_then(|previous| continuity_page(&previous, profile.max_side, profile.quality));
        match prepared {
            Ok(image) => Some(image),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "previous page dropped from continuity");
                None
            }
        }
    }
}
