use std::ops::Range;
use std::sync::OnceLock;

use regex::Regex;

/// Scene labels as they appear in prompts for each output language.
const SCENE_LABELS: &[&str] = &[
    "Scene",
    "Scene description",
    "Szene",
    "Szenenbeschreibung",
    "Scène",
    "Description de la scène",
    "Escena",
    "Descripción de la escena",
];

/// The scene-description text of a prompt and where it sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneFragment {
    /// Byte range of the trimmed fragment within the prompt.
    pub range: Range<usize>,
    pub text: String,
}

fn label_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        SCENE_LABELS
            .iter()
            .filter_map(|label| {
                Regex::new(&format!(
                    r"(?im)^[ \t>*#-]*{}[ \t*]*:\**",
                    regex::escape(label)
                ))
                .ok()
            })
            .collect()
    })
}

fn blank_line() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\n[ \t]*\r?\n").ok())
        .as_ref()
}

/// Finds the first labelled scene description; runs to the next blank line.
pub fn extract_scene(prompt: &str) -> Option<SceneFragment> {
    label_patterns().iter().find_map(|pattern| {
        let label = pattern.find(prompt)?;
        let rest = &prompt[label.end()..];
        let body_len = blank_line()
            .and_then(|blank| blank.find(rest))
            .map(|hit| hit.start())
            .unwrap_or(rest.len());
        let body = &rest[..body_len];
        let text = body.trim();
        if text.is_empty() {
            return None;
        }
        let start = label.end() + (body.len() - body.trim_start().len());
        Some(SceneFragment {
            range: start..start + text.len(),
            text: text.to_string(),
        })
    })
}

/// Replaces the fragment's text in `prompt`, leaving everything else as is.
pub fn splice(prompt: &str, fragment: &SceneFragment, rewritten: &str) -> String {
    let mut out = String::with_capacity(prompt.len() + rewritten.len());
    out.push_str(&prompt[..fragment.range.start]);
    out.push_str(rewritten.trim());
    out.push_str(&prompt[fragment.range.end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::{extract_scene, splice};

    #[test]
    fn extracts_english_scene_until_blank_line() -> anyhow::Result<()> {
        let prompt = "Style: watercolor\nScene: Mia chases a dragon through the burning village.\nIt roars.\n\nCharacters: Mia";
        let fragment = extract_scene(prompt).ok_or_else(|| anyhow::anyhow!("no scene"))?;
        assert_eq!(
            fragment.text,
            "Mia chases a dragon through the burning village.\nIt roars."
        );
        let spliced = splice(prompt, &fragment, "Mia races a friendly dragon across the meadow.");
        assert_eq!(
            spliced,
            "Style: watercolor\nScene: Mia races a friendly dragon across the meadow.\n\nCharacters: Mia"
        );
        Ok(())
    }

    #[test]
    fn recognises_other_languages_and_long_labels() {
        let german = "Stil: Aquarell\nSzenenbeschreibung: Leo klettert auf den Baum.";
        assert_eq!(
            extract_scene(german).map(|fragment| fragment.text),
            Some("Leo klettert auf den Baum.".to_string())
        );
        let french = "Scène : Le renard traverse la rivière.";
        assert_eq!(
            extract_scene(french).map(|fragment| fragment.text),
            Some("Le renard traverse la rivière.".to_string())
        );
        let spanish = "**Descripción de la escena:** El gato duerme.";
        assert_eq!(
            extract_scene(spanish).map(|fragment| fragment.text),
            Some("El gato duerme.".to_string())
        );
        let english = "Scene description: Two kids build a fort.";
        assert_eq!(
            extract_scene(english).map(|fragment| fragment.text),
            Some("Two kids build a fort.".to_string())
        );
    }

    #[test]
    fn unlabelled_or_empty_scene_yields_nothing() {
        assert!(extract_scene("A fox in the snow, watercolor").is_none());
        assert!(extract_scene("Scene:\n\nCharacters: Mia").is_none());
        assert!(extract_scene("The previous scene: a fox").is_none());
    }
}
