use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    #[default]
    Scene,
    Cover,
}

impl EvaluationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scene => "scene",
            Self::Cover => "cover",
        }
    }
}

impl std::str::FromStr for EvaluationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scene" => Ok(Self::Scene),
            "cover" => Ok(Self::Cover),
            other => Err(format!("unknown evaluation mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedReference {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "photo_uri")]
    pub photo_uri: String,
    #[serde(default, alias = "photo_hash")]
    pub photo_hash: Option<String>,
}

/// A reference photo as supplied by callers: either a bare URI string or a
/// `{name, photoUri, photoHash}` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReferencePhoto {
    Uri(String),
    Named(NamedReference),
}

impl ReferencePhoto {
    pub fn named(name: impl Into<String>, photo_uri: impl Into<String>) -> Self {
        Self::Named(NamedReference {
            name: Some(name.into()),
            photo_uri: photo_uri.into(),
            photo_hash: None,
        })
    }

    pub fn uri(&self) -> &str {
        match self {
            Self::Uri(uri) => uri.as_str(),
            Self::Named(named) => named.photo_uri.as_str(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Named(named) => named
                .name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty()),
        }
    }

    pub fn photo_hash(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Named(named) => named
                .photo_hash
                .as_deref()
                .map(str::trim)
                .filter(|hash| !hash.is_empty()),
        }
    }
}

impl From<&str> for ReferencePhoto {
    fn from(uri: &str) -> Self {
        Self::Uri(uri.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelOverrides {
    #[serde(default)]
    pub generation_model: Option<String>,
    #[serde(default)]
    pub evaluation_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub reference_photos: Vec<ReferencePhoto>,
    /// Previous page image chained in for continuity mode.
    #[serde(default)]
    pub previous_image: Option<String>,
    #[serde(default)]
    pub evaluation_mode: EvaluationMode,
    /// Text the cover must show; only consulted in cover mode.
    #[serde(default)]
    pub expected_text: Option<String>,
    #[serde(default)]
    pub model_overrides: Option<ModelOverrides>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_photos: Vec::new(),
            previous_image: None,
            evaluation_mode: EvaluationMode::Scene,
            expected_text: None,
            model_overrides: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<ReferencePhoto>) -> Self {
        self.reference_photos.push(reference.into());
        self
    }

    pub fn with_previous_image(mut self, photo_uri: impl Into<String>) -> Self {
        self.previous_image = Some(photo_uri.into());
        self
    }

    pub fn cover(mut self, expected_text: impl Into<String>) -> Self {
        self.evaluation_mode = EvaluationMode::Cover;
        self.expected_text = Some(expected_text.into());
        self
    }

    pub fn with_overrides(mut self, overrides: ModelOverrides) -> Self {
        self.model_overrides = Some(overrides);
        self
    }

    pub fn generation_override(&self) -> Option<&str> {
        self.model_overrides
            .as_ref()
            .and_then(|overrides| overrides.generation_model.as_deref())
    }

    pub fn evaluation_override(&self) -> Option<&str> {
        self.model_overrides
            .as_ref()
            .and_then(|overrides| overrides.evaluation_model.as_deref())
    }
}
