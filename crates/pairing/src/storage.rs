use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::PairingError;

/// Key/value storage scoped to one operator session.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PairingError>;
    async fn set(&self, key: &str, value: String) -> Result<(), PairingError>;
    async fn remove(&self, key: &str) -> Result<(), PairingError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemorySessionStorage {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, PairingError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PairingError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PairingError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

/// JSON object on disk. Every write rewrites the whole file through a
/// temporary sibling so a crash never leaves a half-written session.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl FileSessionStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PairingError> {
        let path = path.into();
        let entries = load_entries(&path)?;
        Ok(Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), PairingError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(PairingError::storage)?;
        }
        let payload = serde_json::to_vec_pretty(entries).map_err(PairingError::storage)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, payload)
            .await
            .map_err(PairingError::storage)?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(PairingError::storage)?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> Result<BTreeMap<String, String>, PairingError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let raw = fs::read_to_string(path).map_err(PairingError::storage)?;
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw).map_err(PairingError::storage)
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, PairingError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PairingError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.persist(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), PairingError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_storage_survives_reopen() -> Result<(), PairingError> {
        let dir = tempfile::tempdir().map_err(PairingError::storage)?;
        let path = dir.path().join("session").join("pairing.json");

        let storage = FileSessionStorage::open(&path)?;
        storage.set("linear-verification", "linear-abc".to_string()).await?;
        storage.set("githubContext", "{}".to_string()).await?;
        storage.remove("githubContext").await?;

        let reopened = FileSessionStorage::open(&path)?;
        assert_eq!(
            reopened.get("linear-verification").await?.as_deref(),
            Some("linear-abc")
        );
        assert_eq!(reopened.get("githubContext").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_sets_all_reach_disk() -> Result<(), PairingError> {
        let dir = tempfile::tempdir().map_err(PairingError::storage)?;
        let path = dir.path().join("pairing.json");
        let storage = FileSessionStorage::open(&path)?;

        let mut writers = tokio::task::JoinSet::new();
        for index in 0..16 {
            let storage = storage.clone();
            writers.spawn(async move {
                storage
                    .set(&format!("key-{index}"), index.to_string())
                    .await
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.map_err(PairingError::storage)??;
        }

        let reopened = FileSessionStorage::open(&path)?;
        for index in 0..16 {
            assert_eq!(
                reopened.get(&format!("key-{index}")).await?,
                Some(index.to_string())
            );
        }
        Ok(())
    }
}
