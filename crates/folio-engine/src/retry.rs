use folio_contracts::events::{EventPayload, EventWriter};
use folio_contracts::image_data::ImageData;
use folio_contracts::quality::{CacheEntry, QualityResult, TokenUsage, UsageSummary};
use folio_contracts::request::{EvaluationMode, ReferencePhoto};
use folio_contracts::session::{IllustrationResult, RetryAttempt, SessionOutcome};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::fingerprint::{derive_fingerprint, CacheFingerprint};
use crate::providers::{
    EvaluationCall, EvaluationProvider, GeneratedImage, GenerationCall, GenerationProvider,
    LabeledImage, RewriteCall, RewriteProvider,
};
use crate::quality_gate::QualityGate;
use crate::result_cache::ResultCache;
use crate::scene::{extract_scene, splice};

pub type ImageReadyHook = Box<dyn Fn(&ImageData, &str) -> anyhow::Result<()> + Send + Sync>;
pub type UsageTracker = Box<dyn Fn(&TokenUsage, Option<&TokenUsage>, &ModelIds) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelIds {
    pub generation: String,
    pub evaluation: Option<String>,
}

/// Caller-side boundary of a session. Every hook is optional and
/// fire-and-forget; a failing hook never aborts the session.
#[derive(Default)]
pub struct SessionHooks {
    /// Called with each image as soon as it exists, before scoring.
    pub on_image_ready: Option<ImageReadyHook>,
    /// Called after every fresh generation, never for cache hits.
    pub usage_tracker: Option<UsageTracker>,
    pub events: Option<EventWriter>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_image_ready(
        mut self,
        hook: impl Fn(&ImageData, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_image_ready = Some(Box::new(hook));
        self
    }

    pub fn usage_tracker(
        mut self,
        tracker: impl Fn(&TokenUsage, Option<&TokenUsage>, &ModelIds) + Send + Sync + 'static,
    ) -> Self {
        self.usage_tracker = Some(Box::new(tracker));
        self
    }

    pub fn events(mut self, writer: EventWriter) -> Self {
        self.events = Some(writer);
        self
    }
}

/// A model the registry substituted for the one asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFallback {
    pub capability: &'static str,
    pub requested: Option<String>,
    pub model: String,
    pub reason: String,
}

/// Inputs resolved by the engine before the first attempt.
#[derive(Debug, Clone)]
pub(crate) struct SessionPlan {
    pub prompt: String,
    pub references: Vec<ReferencePhoto>,
    pub sequential: bool,
    pub generation_refs: Vec<LabeledImage>,
    pub evaluation_refs: Vec<LabeledImage>,
    pub previous_page: Option<ImageData>,
    pub mode: EvaluationMode,
    pub expected_text: Option<String>,
    pub generation_model: String,
    pub evaluation_model: String,
    pub rewrite_model: String,
    pub model_fallbacks: Vec<ModelFallback>,
}

pub(crate) struct Collaborators<'a> {
    pub generator: &'a dyn GenerationProvider,
    pub evaluator: &'a dyn EvaluationProvider,
    pub rewriter: &'a dyn RewriteProvider,
    pub cache: &'a ResultCache,
    pub gate: QualityGate,
    pub max_attempts: u32,
    pub accept_unevaluated: bool,
}

enum State {
    Generating,
    Evaluating {
        fingerprint: CacheFingerprint,
        generated: GeneratedImage,
    },
    Scored {
        entry: CacheEntry,
        effective_score: u8,
        accepted: bool,
    },
    SafetyRewrite(ProviderError),
    Failed {
        error: ProviderError,
        note: Option<String>,
    },
    Retry,
    Accepted(CacheEntry),
    Exhausted,
}

/// One request's attempts. Runs strictly sequentially and owns all of its
/// state; sessions only share the caches.
pub(crate) struct RetrySession<'a> {
    ctx: Collaborators<'a>,
    plan: SessionPlan,
    hooks: &'a SessionHooks,
    prompt: String,
    attempt: u32,
    history: Vec<RetryAttempt>,
    best: Option<CacheEntry>,
    best_score: i32,
    rewrite_attempted: bool,
    scene_was_rewritten: bool,
    session_usage: UsageSummary,
    last_error: Option<ProviderError>,
}

impl<'a> RetrySession<'a> {
    pub(crate) fn new(ctx: Collaborators<'a>, plan: SessionPlan, hooks: &'a SessionHooks) -> Self {
        let prompt = plan.prompt.clone();
        Self {
            ctx,
            plan,
            hooks,
            prompt,
            attempt: 1,
            history: Vec::new(),
            best: None,
            best_score: -1,
            rewrite_attempted: false,
            scene_was_rewritten: false,
            session_usage: UsageSummary::default(),
            last_error: None,
        }
    }

    pub(crate) fn run(mut self) -> Result<IllustrationResult, ProviderError> {
        self.emit(
            "session_started",
            json!({
                "mode": self.plan.mode.as_str(),
                "sequential": self.plan.sequential,
                "references": self.plan.generation_refs.len(),
                "generation_model": self.plan.generation_model,
                "evaluation_model": self.plan.evaluation_model,
                "threshold": self.ctx.gate.threshold(),
                "max_attempts": self.ctx.max_attempts,
                "model_fallbacks": self
                    .plan
                    .model_fallbacks
                    .iter()
                    .map(|fallback| {
                        json!({
                            "capability": fallback.capability,
                            "requested": fallback.requested,
                            "model": fallback.model,
                            "reason": fallback.reason,
                        })
                    })
                    .collect::<Vec<_>>(),
            }),
        );
        let mut state = State::Generating;
        loop {
            state = match state {
                State::Generating => self.generate(),
                State::Evaluating {
                    fingerprint,
                    generated,
                } => self.evaluate(&fingerprint, generated),
                State::Scored {
                    entry,
                    effective_score,
                    accepted,
                } => self.score(entry, effective_score, accepted),
                State::SafetyRewrite(error) => self.rewrite(error),
                State::Failed { error, note } => self.record_failure(error, note),
                State::Retry => {
                    if self.attempt >= self.ctx.max_attempts {
                        State::Exhausted
                    } else {
                        self.attempt += 1;
                        State::Generating
                    }
                }
                State::Accepted(entry) => return Ok(self.finish(SessionOutcome::Accepted, entry)),
                State::Exhausted => return self.exhaust(),
            };
        }
    }

    fn generate(&mut self) -> State {
        let fingerprint =
            derive_fingerprint(&self.prompt, &self.plan.references, self.plan.sequential);
        if self.attempt == 1 {
            if let Some(entry) = self.ctx.cache.get(&fingerprint) {
                return self.replay_cached(&fingerprint, entry);
            }
        } else if self.ctx.cache.delete(&fingerprint) {
            debug!(%fingerprint, attempt = self.attempt, "cleared cached result before retry");
        }

        let call = GenerationCall {
            model: self.plan.generation_model.clone(),
            prompt: self.prompt.clone(),
            references: self.plan.generation_refs.clone(),
            previous_page: self.plan.previous_page.clone(),
        };
        debug!(
            attempt = self.attempt,
            model = %call.model,
            provider = self.ctx.generator.name(),
            "generating illustration"
        );
        match self.ctx.generator.generate(&call) {
            Ok(generated) => {
                self.deliver(&generated.image, &generated.model_id, false);
                State::Evaluating {
                    fingerprint,
                    generated,
                }
            }
            Err(error) if error.is_safety_block() && !self.rewrite_attempted => {
                State::SafetyRewrite(error)
            }
            Err(error) => State::Failed { error, note: None },
        }
    }

    fn replay_cached(&mut self, fingerprint: &CacheFingerprint, entry: CacheEntry) -> State {
        info!(%fingerprint, score = ?entry.score, "result cache hit");
        self.emit(
            "cache_hit",
            json!({
                "fingerprint": fingerprint.as_str(),
                "score": entry.score,
                "generation_model_id": entry.generation_model_id,
            }),
        );
        self.deliver(&entry.image_data, &entry.generation_model_id, true);
        let decision = self.ctx.gate.decide(
            entry.score,
            entry.text_issue,
            self.plan.mode,
            self.plan.expected_text.as_deref(),
        );
        let accepted =
            decision.accepted || (self.ctx.accept_unevaluated && !entry.was_evaluated());
        self.history.push(RetryAttempt::Generation {
            attempt: self.attempt,
            score: entry.score,
            text_issue: entry.text_issue,
            image_data: entry.image_data.clone(),
            model_id: entry.generation_model_id.clone(),
        });
        State::Scored {
            entry,
            effective_score: decision.effective_score,
            accepted,
        }
    }

    fn evaluate(&mut self, fingerprint: &CacheFingerprint, generated: GeneratedImage) -> State {
        let call = EvaluationCall {
            model: self.plan.evaluation_model.clone(),
            image: generated.image.clone(),
            prompt: self.prompt.clone(),
            references: self.plan.evaluation_refs.clone(),
            mode: self.plan.mode,
            expected_text: self.plan.expected_text.clone(),
        };
        let mut evaluator_unavailable = false;
        let (quality, evaluation_model_id): (Option<QualityResult>, Option<String>) =
            match self.ctx.evaluator.evaluate(&call) {
                Ok(Some(raw)) => (Some(self.ctx.gate.normalize(&raw)), Some(call.model.clone())),
                Ok(None) => {
                    evaluator_unavailable = true;
                    debug!(attempt = self.attempt, "no evaluator available; image is unscored");
                    (None, None)
                }
                Err(err) => {
                    warn!(attempt = self.attempt, error = %err, "evaluation failed; treating image as unscored");
                    (None, Some(call.model.clone()))
                }
            };

        let score = quality.as_ref().and_then(|result| result.score);
        let text_issue = quality.as_ref().and_then(|result| result.text_issue);
        let evaluation_usage = quality.as_ref().map(|result| result.usage);
        let usage = UsageSummary {
            generation_tokens: generated.usage.total_tokens,
            evaluation_tokens: evaluation_usage.map(|usage| usage.total_tokens).unwrap_or(0),
        };
        self.session_usage.add(&usage);
        if let Some(tracker) = &self.hooks.usage_tracker {
            tracker(
                &generated.usage,
                evaluation_usage.as_ref(),
                &ModelIds {
                    generation: generated.model_id.clone(),
                    evaluation: evaluation_model_id.clone(),
                },
            );
        }

        let entry = CacheEntry {
            image_data: generated.image,
            score,
            reasoning: quality
                .as_ref()
                .map(|result| result.reasoning.trim().to_string())
                .filter(|reasoning| !reasoning.is_empty()),
            text_issue,
            generation_model_id: generated.model_id,
            evaluation_model_id,
            usage,
        };
        self.ctx.cache.put(fingerprint, entry.clone());

        let decision = self.ctx.gate.decide(
            score,
            text_issue,
            self.plan.mode,
            self.plan.expected_text.as_deref(),
        );
        let accepted = decision.accepted || (evaluator_unavailable && self.ctx.accept_unevaluated);
        self.history.push(RetryAttempt::Generation {
            attempt: self.attempt,
            score,
            text_issue,
            image_data: entry.image_data.clone(),
            model_id: entry.generation_model_id.clone(),
        });
        info!(
            attempt = self.attempt,
            score = ?score,
            accepted,
            blocking_text_error = decision.blocking_text_error,
            "attempt scored"
        );
        self.emit(
            "attempt_scored",
            json!({
                "attempt": self.attempt,
                "fingerprint": fingerprint.as_str(),
                "score": score,
                "text_issue": text_issue,
                "accepted": accepted,
                "blocking_text_error": decision.blocking_text_error,
                "usage": usage,
            }),
        );
        State::Scored {
            entry,
            effective_score: decision.effective_score,
            accepted,
        }
    }

    fn score(&mut self, entry: CacheEntry, effective_score: u8, accepted: bool) -> State {
        self.last_error = None;
        if i32::from(effective_score) > self.best_score {
            self.best_score = i32::from(effective_score);
            self.best = Some(entry.clone());
        }
        if accepted {
            State::Accepted(entry)
        } else {
            State::Retry
        }
    }

    /// One-shot recovery from a safety block. Does not consume an attempt.
    fn rewrite(&mut self, error: ProviderError) -> State {
        self.rewrite_attempted = true;
        let Some(fragment) = extract_scene(&self.prompt) else {
            warn!(attempt = self.attempt, "safety block but no scene description to rewrite");
            return State::Failed {
                error,
                note: Some("no scene description found to rewrite".to_string()),
            };
        };
        let call = RewriteCall {
            model: self.plan.rewrite_model.clone(),
            scene: fragment.text.clone(),
            prompt: self.prompt.clone(),
        };
        match self.ctx.rewriter.rewrite_scene(&call) {
            Ok(rewritten) => {
                let rewritten = rewritten.trim().to_string();
                info!(attempt = self.attempt, "scene rewritten after safety block");
                self.emit(
                    "safety_rewrite",
                    json!({
                        "attempt": self.attempt,
                        "error": error.to_string(),
                        "original_scene": fragment.text,
                        "rewritten_scene": rewritten,
                    }),
                );
                self.prompt = splice(&self.prompt, &fragment, &rewritten);
                self.history.push(RetryAttempt::SafetyBlockRewrite {
                    attempt: self.attempt,
                    original_scene: fragment.text,
                    rewritten_scene: rewritten,
                    error: error.to_string(),
                });
                self.scene_was_rewritten = true;
                State::Generating
            }
            Err(rewrite_error) => {
                warn!(attempt = self.attempt, error = %rewrite_error, "scene rewrite failed");
                State::Failed {
                    error,
                    note: Some(format!("scene rewrite failed: {rewrite_error}")),
                }
            }
        }
    }

    fn record_failure(&mut self, error: ProviderError, note: Option<String>) -> State {
        let message = match note {
            Some(note) => format!("{error} ({note})"),
            None => error.to_string(),
        };
        warn!(
            attempt = self.attempt,
            transient = error.is_transient(),
            error = %message,
            "generation attempt failed"
        );
        self.emit(
            "generation_failed",
            json!({
                "attempt": self.attempt,
                "error": message,
            }),
        );
        self.history.push(RetryAttempt::GenerationFailed {
            attempt: self.attempt,
            error: message,
        });
        self.last_error = Some(error);
        State::Retry
    }

    fn exhaust(mut self) -> Result<IllustrationResult, ProviderError> {
        if let Some(best) = self.best.take() {
            return Ok(self.finish(SessionOutcome::Exhausted, best));
        }
        let error = self.last_error.take().unwrap_or_else(|| {
            ProviderError::MalformedResponse("no attempt produced an image".to_string())
        });
        self.emit(
            "session_finished",
            json!({
                "outcome": "FAILED",
                "total_attempts": self.attempt,
                "error": error.to_string(),
            }),
        );
        Err(error)
    }

    fn finish(self, outcome: SessionOutcome, entry: CacheEntry) -> IllustrationResult {
        let was_regenerated = outcome == SessionOutcome::Exhausted || self.attempt > 1;
        info!(
            outcome = ?outcome,
            score = ?entry.score,
            total_attempts = self.attempt,
            scene_was_rewritten = self.scene_was_rewritten,
            "illustration session finished"
        );
        self.emit(
            "session_finished",
            json!({
                "outcome": outcome,
                "score": entry.score,
                "total_attempts": self.attempt,
                "was_regenerated": was_regenerated,
                "scene_was_rewritten": self.scene_was_rewritten,
                "session_usage": self.session_usage,
            }),
        );
        IllustrationResult {
            outcome,
            image_data: entry.image_data,
            score: entry.score,
            reasoning: entry.reasoning,
            text_issue: entry.text_issue,
            was_regenerated,
            retry_history: self.history,
            total_attempts: self.attempt,
            generation_model_id: entry.generation_model_id,
            evaluation_model_id: entry.evaluation_model_id,
            usage: entry.usage,
            session_usage: self.session_usage,
            scene_was_rewritten: self.scene_was_rewritten,
        }
    }

    fn deliver(&self, image: &ImageData, model_id: &str, cached: bool) {
        if let Some(hook) = &self.hooks.on_image_ready {
            if let Err(err) = hook(image, model_id) {
                warn!(attempt = self.attempt, error = %format!("{err:#}"), "image-ready callback failed");
            }
        }
        self.emit(
            "image_ready",
            json!({
                "attempt": self.attempt,
                "model_id": model_id,
                "bytes": image.len(),
                "cached": cached,
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = &self.hooks.events else {
            return;
        };
        if let Err(err) = events.emit(event_type, map_object(payload)) {
            warn!(event_type, error = %format!("{err:#}"), "event write failed");
        }
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
