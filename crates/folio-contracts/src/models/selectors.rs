use super::registry::{Capability, ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    /// Resolves a per-request override, falling back to the configured default
    /// and then to the first registered model with the capability.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: Capability,
        default_model: &str,
    ) -> Result<ModelSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let mut fallback_reason = None;
        if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            fallback_reason = Some(format!(
                "Requested model '{requested_value}' unavailable for capability '{}'.",
                capability.as_str()
            ));
        }

        let model = match self.registry.ensure(default_model, capability) {
            Some(model) => model,
            None => {
                let Some(first) = self.registry.by_capability(capability).first().cloned() else {
                    return Err(format!(
                        "No models available for capability '{}'.",
                        capability.as_str()
                    ));
                };
                let reason = format!(
                    "Default model '{default_model}' unavailable for capability '{}'; using '{}'.",
                    capability.as_str(),
                    first.name
                );
                fallback_reason = Some(match fallback_reason {
                    Some(existing) => format!("{existing} {reason}"),
                    None => reason,
                });
                first
            }
        };
        Ok(ModelSelection {
            model,
            requested: requested.map(str::to_string),
            fallback_reason,
        })
    }
}
