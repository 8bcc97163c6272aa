use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Produces images.
    Image,
    /// Reads images and answers in text.
    Vision,
    Text,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Vision => "vision",
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<Capability>,
}

impl ModelSpec {
    pub fn new(name: &str, provider: &str, capabilities: &[Capability]) -> Self {
        Self {
            name: name.to_string(),
            provider: provider.to_string(),
            capabilities: capabilities.to_vec(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn register(&mut self, spec: ModelSpec) {
        self.models.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: Capability) -> Option<ModelSpec> {
        self.get(name.trim())
            .filter(|model| model.supports(capability))
            .cloned()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    use Capability::{Image, Text, Vision};

    [
        ModelSpec::new("gemini-2.5-flash-image", "gemini", &[Image]),
        ModelSpec::new("gemini-3-pro-image-preview", "gemini", &[Image]),
        ModelSpec::new("gemini-2.5-flash", "gemini", &[Text, Vision]),
        ModelSpec::new("gemini-2.5-pro", "gemini", &[Text, Vision]),
        ModelSpec::new("gemini-3-pro-preview", "gemini", &[Text, Vision]),
        ModelSpec::new("dryrun-image-1", "dryrun", &[Image]),
        ModelSpec::new("dryrun-vision-1", "dryrun", &[Text, Vision]),
    ]
    .into_iter()
    .map(|spec| (spec.name.clone(), spec))
    .collect()
}
