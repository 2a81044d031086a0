//! JSON file persistence: one file per entity under the data directory,
//! written atomically (temp file then rename) with per-key async locks so
//! concurrent writers to the same entity serialize instead of interleaving.
//!
//! Collections in use: `tracks`, `leaderboards`, `replays`. Nothing here
//! is ever touched from a room tick; rooms talk to storage through the
//! leaderboard recorder task.

use gridrush_core::track::Track;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("track error: {0}")]
    Track(#[from] gridrush_core::track::TrackError),
    #[error("entity is protected")]
    Protected,
}

pub struct JsonStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key.contains("..")
            || key.starts_with('.')
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn path_for(&self, collection: &str, key: &str) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", key))
    }

    async fn lock_for(&self, collection: &str, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(format!("{}/{}", collection, key))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn write<T: Serialize>(
        &self,
        collection: &str,
        key: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        Self::validate_key(key)?;
        let lock = self.lock_for(collection, key).await;
        let _guard = lock.lock().await;

        let dir = self.root.join(collection);
        fs::create_dir_all(&dir).await?;

        let path = self.path_for(collection, key);
        let tmp = dir.join(format!("{}.json.tmp", key));
        let data = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        Self::validate_key(key)?;
        let path = self.path_for(collection, key);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_keys(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.root.join(collection);
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn delete(&self, collection: &str, key: &str) -> Result<bool, StorageError> {
        Self::validate_key(key)?;
        let lock = self.lock_for(collection, key).await;
        let _guard = lock.lock().await;

        match fs::remove_file(self.path_for(collection, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory track catalog backed by the `tracks` collection. Rooms only
/// ever read from the cache; disk IO happens at startup and on editor
/// uploads.
pub struct TrackStore {
    store: JsonStore,
    cache: RwLock<HashMap<String, Arc<Track>>>,
    protected: HashSet<String>,
    default_id: String,
}

impl TrackStore {
    /// Load every persisted track and seed the built-in defaults that are
    /// missing. Default tracks are protected from deletion.
    pub async fn open(data_dir: PathBuf, defaults: Vec<Track>) -> Result<Self, StorageError> {
        let store = JsonStore::new(data_dir);
        let mut cache = HashMap::new();

        for key in store.list_keys("tracks").await? {
            match store.read::<Track>("tracks", &key).await {
                Ok(Some(track)) => match track.validate() {
                    Ok(()) => {
                        cache.insert(track.id.clone(), Arc::new(track));
                    }
                    Err(e) => warn!(track = %key, "skipping invalid stored track: {}", e),
                },
                Ok(None) => {}
                Err(e) => warn!(track = %key, "failed to load track: {}", e),
            }
        }

        let mut protected = HashSet::new();
        let default_id = defaults
            .first()
            .map(|t| t.id.clone())
            .unwrap_or_else(|| "default-speedway".to_string());
        for track in defaults {
            protected.insert(track.id.clone());
            if !cache.contains_key(&track.id) {
                store.write("tracks", &track.id, &track).await?;
                cache.insert(track.id.clone(), Arc::new(track));
            }
        }

        info!("track store ready with {} track(s)", cache.len());
        Ok(Self {
            store,
            cache: RwLock::new(cache),
            protected,
            default_id,
        })
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Track>> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn default_track(&self) -> Arc<Track> {
        self.cache
            .read()
            .await
            .get(&self.default_id)
            .cloned()
            .expect("default track seeded at startup")
    }

    pub async fn list(&self) -> Vec<Arc<Track>> {
        let mut tracks: Vec<Arc<Track>> = self.cache.read().await.values().cloned().collect();
        tracks.sort_by(|a, b| a.name.cmp(&b.name));
        tracks
    }

    /// Validate, strip editor-only elements and persist. The cache keeps
    /// serving the last known-good state if the disk write fails.
    pub async fn insert(&self, mut track: Track) -> Result<(), StorageError> {
        track.strip_editor_elements();
        track.validate()?;
        self.store.write("tracks", &track.id, &track).await?;
        self.cache
            .write()
            .await
            .insert(track.id.clone(), Arc::new(track));
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        if self.protected.contains(id) {
            return Err(StorageError::Protected);
        }
        let removed = self.store.delete("tracks", id).await?;
        self.cache.write().await.remove(id);
        Ok(removed)
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.protected.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        value: u32,
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().to_path_buf());

        let doc = Doc {
            name: "alpha".to_string(),
            value: 7,
        };
        store.write("docs", "a", &doc).await.unwrap();
        let back: Option<Doc> = store.read("docs", "a").await.unwrap();
        assert_eq!(back, Some(doc));
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().to_path_buf());
        let back: Option<Doc> = store.read("docs", "missing").await.unwrap();
        assert!(back.is_none());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().to_path_buf());

        for key in ["b", "a", "c"] {
            store
                .write(
                    "docs",
                    key,
                    &Doc {
                        name: key.to_string(),
                        value: 1,
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(store.list_keys("docs").await.unwrap(), vec!["a", "b", "c"]);

        assert!(store.delete("docs", "b").await.unwrap());
        assert!(!store.delete("docs", "b").await.unwrap());
        assert_eq!(store.list_keys("docs").await.unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_no_stray_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().to_path_buf());
        store
            .write(
                "docs",
                "a",
                &Doc {
                    name: "a".to_string(),
                    value: 1,
                },
            )
            .await
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join("docs"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json"]);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().to_path_buf());
        let doc = Doc {
            name: "evil".to_string(),
            value: 0,
        };
        assert!(store.write("docs", "../evil", &doc).await.is_err());
        assert!(store.write("docs", "a/b", &doc).await.is_err());
        assert!(store.read::<Doc>("docs", "..").await.is_err());
    }

    #[tokio::test]
    async fn test_track_store_seeds_and_protects_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackStore::open(dir.path().to_path_buf(), vec![Track::default_speedway()])
            .await
            .unwrap();

        let default = store.default_track().await;
        assert_eq!(default.id, "default-speedway");
        assert!(store.is_protected(&default.id));
        assert!(matches!(
            store.delete(&default.id).await,
            Err(StorageError::Protected)
        ));

        // Re-open sees the persisted seed.
        let store2 = TrackStore::open(dir.path().to_path_buf(), vec![Track::default_speedway()])
            .await
            .unwrap();
        assert!(store2.get("default-speedway").await.is_some());
    }

    #[tokio::test]
    async fn test_track_store_insert_strips_editor_elements() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrackStore::open(dir.path().to_path_buf(), vec![Track::default_speedway()])
            .await
            .unwrap();

        let mut track = Track::default_speedway();
        track.id = "custom-1".to_string();
        track.elements.push(gridrush_core::TrackElement {
            id: "editor-cursor".to_string(),
            kind: gridrush_core::ElementKind::Select,
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            rotation: 0.0,
            layer: None,
            checkpoint_index: None,
            properties: None,
        });
        store.insert(track).await.unwrap();

        let stored = store.get("custom-1").await.unwrap();
        assert!(stored
            .elements
            .iter()
            .all(|e| e.kind != gridrush_core::ElementKind::Select));
        assert!(store.delete("custom-1").await.unwrap());
    }
}
