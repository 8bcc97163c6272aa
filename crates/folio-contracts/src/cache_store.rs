use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// JSON-object file keyed by string, re-read on every access so several
/// processes can share one snapshot. Writes only touch the keys this handle
/// changed.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    payload: Map<String, Value>,
    dirty_keys: BTreeSet<String>,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
            dirty_keys: BTreeSet::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        self.refresh();
        let value = self.payload.get(key)?.clone();
        serde_json::from_value(value).ok()
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.refresh();
        self.payload.contains_key(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> anyhow::Result<()> {
        self.refresh();
        let snapshot = serde_json::to_value(value)?;
        if self.payload.get(key) == Some(&snapshot) {
            return Ok(());
        }
        self.payload.insert(key.to_string(), snapshot);
        self.dirty_keys.insert(key.to_string());
        self.flush()
    }

    /// Returns whether the key was present.
    pub fn remove(&mut self, key: &str) -> anyhow::Result<bool> {
        self.refresh();
        if self.payload.remove(key).is_none() {
            return Ok(false);
        }
        self.dirty_keys.insert(key.to_string());
        self.flush()?;
        Ok(true)
    }

    /// Drops every key currently in the file. Returns how many were removed.
    pub fn clear(&mut self) -> anyhow::Result<usize> {
        self.refresh();
        let keys: Vec<String> = self.payload.keys().cloned().collect();
        self.payload.clear();
        self.dirty_keys.extend(keys.iter().cloned());
        self.flush()?;
        Ok(keys.len())
    }

    pub fn len(&mut self) -> usize {
        self.refresh();
        self.payload.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        if self.dirty_keys.is_empty() {
            return Ok(());
        }

        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        for key in &self.dirty_keys {
            match self.payload.get(key) {
                Some(value) => {
                    on_disk.insert(key.clone(), value.clone());
                }
                None => {
                    on_disk.remove(key);
                }
            }
        }
        write_json_object(&self.path, &on_disk)?;
        self.payload = on_disk;
        self.dirty_keys.clear();
        Ok(())
    }

    fn refresh(&mut self) {
        if self.dirty_keys.is_empty() {
            self.payload = read_json_object(&self.path).unwrap_or_default();
        }
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(
        path,
        serde_json::to_string_pretty(&Value::Object(payload.clone()))?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::CacheStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        value: u32,
    }

    #[test]
    fn set_then_get_round_trips_typed_rows() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = CacheStore::new(temp.path().join("cache.json"));
        store.set("key", &Row { value: 1 })?;
        assert_eq!(store.get::<Row>("key"), Some(Row { value: 1 }));
        assert_eq!(store.get::<Row>("other"), None);
        assert!(store.contains("key"));
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn set_merges_with_concurrent_writer() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut store_a = CacheStore::new(&path);
        let mut store_b = CacheStore::new(&path);

        store_a.set("a", &Row { value: 1 })?;
        store_b.set("b", &Row { value: 2 })?;
        store_a.set("c", &Row { value: 3 })?;

        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get::<Row>("a"), Some(Row { value: 1 }));
        assert_eq!(reloaded.get::<Row>("b"), Some(Row { value: 2 }));
        assert_eq!(reloaded.get::<Row>("c"), Some(Row { value: 3 }));
        Ok(())
    }

    #[test]
    fn remove_only_drops_the_named_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut store_a = CacheStore::new(&path);
        let mut store_b = CacheStore::new(&path);

        store_a.set("a", &Row { value: 1 })?;
        store_b.set("b", &Row { value: 2 })?;
        assert!(store_a.remove("a")?);
        assert!(!store_a.remove("a")?);

        assert_eq!(store_b.get::<Row>("a"), None);
        assert_eq!(store_b.get::<Row>("b"), Some(Row { value: 2 }));
        Ok(())
    }

    #[test]
    fn clear_drops_every_key() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut store_a = CacheStore::new(&path);
        let mut store_b = CacheStore::new(&path);

        store_a.set("a", &Row { value: 1 })?;
        store_b.set("b", &Row { value: 2 })?;
        assert_eq!(store_a.clear()?, 2);

        assert!(store_b.is_empty());
        assert_eq!(CacheStore::new(path).get::<Row>("a"), None);
        Ok(())
    }

    #[test]
    fn get_refreshes_between_instances() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        let mut store_a = CacheStore::new(&path);
        let mut store_b = CacheStore::new(&path);

        store_a.set("key", &Row { value: 1 })?;
        assert_eq!(store_b.get::<Row>("key"), Some(Row { value: 1 }));

        store_b.set("key", &Row { value: 2 })?;
        assert_eq!(store_a.get::<Row>("key"), Some(Row { value: 2 }));

        store_a.set("key", &Row { value: 1 })?;
        let mut reloaded = CacheStore::new(path);
        assert_eq!(reloaded.get::<Row>("key"), Some(Row { value: 1 }));
        Ok(())
    }

    #[test]
    fn corrupt_snapshot_reads_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("cache.json");
        std::fs::write(&path, "not json")?;
        let mut store = CacheStore::new(&path);
        assert!(store.is_empty());
        store.set("key", &Row { value: 5 })?;
        assert_eq!(store.get::<Row>("key"), Some(Row { value: 5 }));
        Ok(())
    }
}
