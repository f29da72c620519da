//! Key/record persistence used by the scheduler and by extensions.
//!
//! Records are JSON values grouped into named collections.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex as StdMutex,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{Error, Result};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool>;

    /// All records of a collection, ordered by key.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

/// In-memory store. Shared across "restarts" in tests by cloning the `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    collections: StdMutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, BTreeMap<String, Value>>) -> T) -> Result<T> {
        let mut guard = self
            .collections
            .lock()
            .map_err(|_| Error::Store("memory store poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.with(|c| c.get(collection).and_then(|m| m.get(key)).cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        self.with(|c| {
            c.entry(collection.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        self.with(|c| {
            c.get_mut(collection)
                .map(|m| m.remove(key).is_some())
                .unwrap_or(false)
        })
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        self.with(|c| {
            c.get(collection)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        })
    }
}

/// One pretty-printed JSON object per collection under `dir`.
///
/// Collections are cached after first read; every mutation rewrites the file
/// through a temp file and a rename so a crash never leaves a torn file.
pub struct JsonFileStore {
    dir: PathBuf,
    cache: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> Result<PathBuf> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            && !collection.starts_with('.');
        if !valid {
            return Err(Error::Store(format!("invalid collection name: {collection:?}")));
        }
        Ok(self.dir.join(format!("{collection}.json")))
    }

    async fn read_collection(&self, collection: &str) -> Result<BTreeMap<String, Value>> {
        let path = self.path_for(collection)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                Error::Store(format!("corrupt collection file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_collection(
        &self,
        collection: &str,
        records: &BTreeMap<String, Value>,
    ) -> Result<()> {
        let path = self.path_for(collection)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let tmp = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(records)?;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn cached<'a>(
        &self,
        cache: &'a mut HashMap<String, BTreeMap<String, Value>>,
        collection: &str,
    ) -> Result<&'a mut BTreeMap<String, Value>> {
        if !cache.contains_key(collection) {
            let loaded = self.read_collection(collection).await?;
            cache.insert(collection.to_string(), loaded);
        }
        cache
            .get_mut(collection)
            .ok_or_else(|| Error::Store(format!("collection {collection:?} vanished")))
    }

    async fn read_with<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&BTreeMap<String, Value>) -> T,
    ) -> Result<T> {
        let mut cache = self.cache.lock().await;
        let records = self.cached(&mut cache, collection).await?;
        Ok(f(records))
    }

    /// Apply `f` to a copy of the collection; the cache only takes the copy
    /// once it is on disk. `f` returns whether it changed anything.
    async fn update<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut BTreeMap<String, Value>) -> (T, bool),
    ) -> Result<T> {
        let mut cache = self.cache.lock().await;
        let records = self.cached(&mut cache, collection).await?;

        let mut staged = records.clone();
        let (out, dirty) = f(&mut staged);
        if dirty {
            self.write_collection(collection, &staged).await?;
            *records = staged;
        }
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        self.read_with(collection, |m| m.get(key).cloned()).await
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        self.update(collection, |m| {
            m.insert(key.to_string(), value);
            ((), true)
        })
        .await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool> {
        self.update(collection, |m| {
            let removed = m.remove(key).is_some();
            (removed, removed)
        })
        .await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        self.read_with(collection, |m| {
            m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn memory_store_crud() {
        let store = MemoryStore::new();
        store.put("tags", "b", json!(2)).await.unwrap();
        store.put("tags", "a", json!({"x": 1})).await.unwrap();

        assert_eq!(store.get("tags", "a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.get("tags", "zz").await.unwrap(), None);
        assert_eq!(store.get("other", "a").await.unwrap(), None);

        let keys: Vec<_> = store
            .list("tags")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);

        assert!(store.delete("tags", "a").await.unwrap());
        assert!(!store.delete("tags", "a").await.unwrap());
    }

    #[tokio::test]
    async fn json_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();

        {
            let store = JsonFileStore::new(dir.path());
            store.put("tasks", "1", json!({"due": 5})).await.unwrap();
            store.put("tasks", "2", json!({"due": 6})).await.unwrap();
            assert!(store.delete("tasks", "2").await.unwrap());
        }

        let store = JsonFileStore::new(dir.path());
        assert_eq!(store.get("tasks", "1").await.unwrap(), Some(json!({"due": 5})));
        assert_eq!(store.list("tasks").await.unwrap().len(), 1);
        assert!(dir.path().join("tasks.json").exists());
        assert!(!dir.path().join("tasks.json.tmp").exists());
    }

    #[tokio::test]
    async fn failed_writes_leave_the_cache_untouched() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("data");
        let store = JsonFileStore::new(&dir);
        store.put("tasks", "1", json!("old")).await.unwrap();

        // Replace the directory with a plain file so the next write fails.
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "not a directory").unwrap();

        assert!(store.put("tasks", "1", json!("new")).await.is_err());
        assert!(store.put("tasks", "2", json!("extra")).await.is_err());
        assert!(store.delete("tasks", "1").await.is_err());

        assert_eq!(store.get("tasks", "1").await.unwrap(), Some(json!("old")));
        assert_eq!(store.get("tasks", "2").await.unwrap(), None);
        assert_eq!(store.list("tasks").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_store_rejects_path_like_collections() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.put("../escape", "k", json!(1)).await.is_err());
        assert!(store.get("", "k").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        match store.list("broken").await {
            Err(Error::Store(msg)) => assert!(msg.contains("corrupt")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
