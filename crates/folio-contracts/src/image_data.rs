use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

const DATA_IMAGE_PREFIX: &str = "data:image/";

/// Encoded image bytes plus their mime type.
///
/// Serialized as `{"mimeType": "...", "data": "<base64>"}` so cache snapshots and
/// result summaries stay plain JSON.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    pub mime_type: String,
    #[serde(rename = "data", with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl ImageData {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new("image/jpeg", bytes)
    }

    pub fn png(bytes: Vec<u8>) -> Self {
        Self::new("image/png", bytes)
    }

    /// Parses a `data:image/<kind>;base64,<payload>` URI.
    pub fn from_data_uri(uri: &str) -> anyhow::Result<Self> {
        let trimmed = uri.trim();
        if !is_image_data_uri(trimmed) {
            bail!("not an image data URI");
        }
        let Some((header, payload)) = trimmed.split_once(',') else {
            bail!("image data URI has no payload");
        };
        let Some(meta) = header.strip_prefix("data:") else {
            bail!("image data URI has no data: scheme");
        };
        let mut segments = meta.split(';');
        let mime_type = segments.next().unwrap_or("image/png").to_string();
        if !segments.any(|segment| segment.eq_ignore_ascii_case("base64")) {
            bail!("image data URI is not base64 encoded");
        }
        let bytes = BASE64
            .decode(payload.trim().as_bytes())
            .context("image data URI base64 decode failed")?;
        Ok(Self { mime_type, bytes })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for ImageData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageData")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

pub fn is_image_data_uri(uri: &str) -> bool {
    uri.trim_start()
        .get(..DATA_IMAGE_PREFIX.len())
        .map(|prefix| prefix.eq_ignore_ascii_case(DATA_IMAGE_PREFIX))
        .unwrap_or(false)
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{is_image_data_uri, ImageData};

    #[test]
    fn parses_base64_data_uri() -> anyhow::Result<()> {
        let image = ImageData::from_data_uri("data:image/jpeg;base64,AQID")?;
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.bytes, vec![1, 2, 3]);
        assert_eq!(image.to_data_uri(), "data:image/jpeg;base64,AQID");
        Ok(())
    }

    #[test]
    fn rejects_non_image_uris() {
        assert!(ImageData::from_data_uri("https://example.com/cat.png").is_err());
        assert!(ImageData::from_data_uri("data:text/plain;base64,AQID").is_err());
        assert!(ImageData::from_data_uri("data:image/png,rawtext").is_err());
        assert!(!is_image_data_uri("blob:1234"));
        assert!(is_image_data_uri("  DATA:IMAGE/png;base64,AA=="));
    }

    #[test]
    fn serializes_bytes_as_base64() -> anyhow::Result<()> {
        let image = ImageData::png(vec![1, 2, 3]);
        let value = serde_json::to_value(&image)?;
        assert_eq!(value, json!({"mimeType": "image/png", "data": "AQID"}));
        let parsed: ImageData = serde_json::from_value(value)?;
        assert_eq!(parsed, image);
        assert!(serde_json::from_value::<ImageData>(json!({"mimeType": "image/png", "data": 5}))
            .is_err());
        assert_eq!(format!("{image:?}"), "ImageData { mime_type: \"image/png\", len: 3 }");
        Ok(())
    }
}
