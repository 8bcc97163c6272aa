use folio_contracts::image_data::is_image_data_uri;
use folio_contracts::request::ReferencePhoto;
use sha2::{Digest, Sha256};

pub const FINGERPRINT_LEN: usize = 32;

/// Cache identity of a generation request.
///
/// Stable under reference reordering; sensitive to every prompt byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheFingerprint(String);

impl CacheFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn derive_fingerprint(
    prompt: &str,
    references: &[ReferencePhoto],
    sequential: bool,
) -> CacheFingerprint {
    let mut reference_hashes: Vec<String> = references
        .iter()
        .filter(|reference| is_image_data_uri(reference.uri()))
        .map(|reference| {
            reference
                .photo_hash()
                .map(str::to_string)
                .unwrap_or_else(|| sha256_hex(reference.uri().as_bytes()))
        })
        .collect();
    reference_hashes.sort();

    let continuity = if sequential { "seq" } else { "single" };
    let material = format!("{prompt}|{}|{continuity}", reference_hashes.join(","));
    let mut digest = sha256_hex(material.as_bytes());
    digest.truncate(FINGERPRINT_LEN);
    CacheFingerprint(digest)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
