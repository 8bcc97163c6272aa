use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use folio_contracts::image_data::ImageData;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::imaging::compress_to_jpeg;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionProfile {
    pub name: &'static str,
    pub max_side: u32,
    pub quality: u8,
}

impl CompressionProfile {
    /// References sent alongside the generation prompt.
    pub const GENERATION: Self = Self {
        name: "generation",
        max_side: 1024,
        quality: 85,
    };

    /// References sent to the evaluator, which only needs likeness cues.
    pub const EVALUATION: Self = Self {
        name: "evaluation",
        max_side: 512,
        quality: 70,
    };
}

/// Process-lifetime cache of compressed reference photos for one profile,
/// keyed by the sha256 of the original bytes. No eviction.
#[derive(Debug)]
pub struct CompressionCache {
    profile: CompressionProfile,
    entries: Mutex<HashMap<String, ImageData>>,
}

impl CompressionCache {
    pub fn new(profile: CompressionProfile) -> Self {
        Self {
            profile,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> CompressionProfile {
        self.profile
    }

    pub fn compress(&self, original: &ImageData) -> Result<ImageData> {
        let key = hex::encode(Sha256::digest(&original.bytes));
        if let Some(hit) = self.lock()?.get(&key) {
            return Ok(hit.clone());
        }

        // Compression runs outside the lock; a concurrent miss on the same
        // photo just does the work twice.
        let compressed = compress_to_jpeg(original, self.profile.max_side, self.profile.quality)?;
        debug!(
            profile = self.profile.name,
            original_bytes = original.len(),
            compressed_bytes = compressed.len(),
            "compressed reference photo"
        );
        self.lock()?.insert(key, compressed.clone());
        Ok(compressed)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ImageData>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("compression cache lock poisoned"))
    }
}
