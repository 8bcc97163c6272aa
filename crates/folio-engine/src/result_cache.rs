use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use folio_contracts::cache_store::CacheStore;
use folio_contracts::quality::CacheEntry;
use tracing::warn;

use crate::fingerprint::CacheFingerprint;

/// Fingerprint → generated image plus its quality metadata.
///
/// Built once and shared by every session. Concurrent misses on the same
/// fingerprint are not coalesced; the last `put` wins.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: RwLock<HashMap<CacheFingerprint, CacheEntry>>,
    snapshot: Option<Mutex<CacheStore>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes through to a JSON file and falls back to it on memory misses.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            snapshot: Some(Mutex::new(CacheStore::new(path))),
        }
    }

    pub fn get(&self, fingerprint: &CacheFingerprint) -> Option<CacheEntry> {
        if let Ok(entries) = self.entries.read() {
            if let Some(entry) = entries.get(fingerprint) {
                return Some(entry.clone());
            }
        }
        let entry = self
            .snapshot
            .as_ref()?
            .lock()
            .ok()?
            .get::<CacheEntry>(fingerprint.as_str())?;
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(fingerprint.clone(), entry.clone());
        }
        Some(entry)
    }

    pub fn put(&self, fingerprint: &CacheFingerprint, entry: CacheEntry) {
        if let Some(snapshot) = &self.snapshot {
            match snapshot.lock() {
                Ok(mut store) => {
                    if let Err(err) = store.set(fingerprint.as_str(), &entry) {
                        warn!(%fingerprint, error = %err, "result cache snapshot write failed");
                    }
                }
                Err(_) => warn!(%fingerprint, "result cache snapshot lock poisoned"),
            }
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(fingerprint.clone(), entry);
        }
    }

    /// Returns whether anything was removed.
    pub fn delete(&self, fingerprint: &CacheFingerprint) -> bool {
        let mut removed = self
            .entries
            .write()
            .map(|mut entries| entries.remove(fingerprint).is_some())
            .unwrap_or(false);
        if let Some(snapshot) = &self.snapshot {
            if let Ok(mut store) = snapshot.lock() {
                match store.remove(fingerprint.as_str()) {
                    Ok(existed) => removed |= existed,
                    Err(err) => {
                        warn!(%fingerprint, error = %err, "result cache snapshot delete failed")
                    }
                }
            }
        }
        removed
    }

    /// Drops every entry, including those in the file snapshot.
    pub fn clear(&self) {
        if let Some(snapshot) = &self.snapshot {
            match snapshot.lock() {
                Ok(mut store) => {
                    if let Err(err) = store.clear() {
                        warn!(error = %err, "result cache snapshot clear failed");
                    }
                }
                Err(_) => warn!("result cache snapshot lock poisoned"),
            }
        }
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn size(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use folio_contracts::image_data::ImageData;
    use folio_contracts::quality::{CacheEntry, UsageSummary};

    use super::ResultCache;
    use crate::fingerprint::derive_fingerprint;

    fn entry(score: u8) -> CacheEntry {
        CacheEntry {
            image_data: ImageData::png(vec![score]),
            score: Some(score),
            reasoning: None,
            text_issue: None,
            generation_model_id: "gen".to_string(),
            evaluation_model_id: Some("eval".to_string()),
            usage: UsageSummary::default(),
        }
    }

    #[test]
    fn get_put_delete_clear() {
        let cache = ResultCache::new();
        let key = derive_fingerprint("p", &[], false);
        assert!(cache.get(&key).is_none());

        cache.put(&key, entry(40));
        cache.put(&key, entry(70));
        assert_eq!(cache.get(&key).and_then(|hit| hit.score), Some(70));
        assert_eq!(cache.size(), 1);

        assert!(cache.delete(&key));
        assert!(!cache.delete(&key));
        assert_eq!(cache.size(), 0);

        cache.put(&key, entry(10));
        cache.clear();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn snapshot_survives_a_new_cache_instance() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results.json");
        let key = derive_fingerprint("page", &[], true);

        ResultCache::with_snapshot(&path).put(&key, entry(88));

        let reopened = ResultCache::with_snapshot(&path);
        assert_eq!(reopened.size(), 0);
        assert_eq!(reopened.get(&key).and_then(|hit| hit.score), Some(88));
        assert_eq!(reopened.size(), 1);

        assert!(reopened.delete(&key));
        assert!(ResultCache::with_snapshot(&path).get(&key).is_none());
        Ok(())
    }

    #[test]
    fn clear_also_empties_the_snapshot() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("results.json");
        let key = derive_fingerprint("page", &[], false);

        let cache = ResultCache::with_snapshot(&path);
        cache.put(&key, entry(75));
        cache.clear();

        assert_eq!(cache.size(), 0);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.size(), 0);
        assert!(ResultCache::with_snapshot(&path).get(&key).is_none());
        Ok(())
    }

    #[test]
    fn concurrent_writers_do_not_corrupt_the_map() {
        let cache = Arc::new(ResultCache::new());
        let handles: Vec<_> = (0..16u8)
            .map(|idx| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let key = derive_fingerprint(&format!("page {}", idx % 4), &[], false);
                    cache.put(&key, entry(idx));
                    cache.get(&key).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("worker panicked"));
        }
        assert_eq!(cache.size(), 4);
    }
}
