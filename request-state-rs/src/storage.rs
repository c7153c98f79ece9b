//! # Request Storage
//!
//! Durable storage behind the state machine. [`MemoryStore`] keeps records in
//! process (tests, ephemeral deployments); [`FileStore`] writes one JSON
//! document per request and replaces it atomically via temp file + rename, so
//! a crash mid-write leaves the previous version intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::request::Request;

#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    async fn write(&self, request: &Request) -> Result<(), StoreError>;

    async fn read(&self, id: Uuid) -> Result<Option<Request>, StoreError>;

    /// Deleting an absent record is not an error.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<Uuid, Request>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn write(&self, request: &Request) -> Result<(), StoreError> {
        self.records.insert(request.id, request.clone());
        Ok(())
    }

    async fn read(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.records.remove(&id);
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.records.iter().map(|r| *r.key()).collect())
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates the directory if needed.
    pub async fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened request file store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl RequestStore for FileStore {
    async fn write(&self, request: &Request) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(request)?;
        let path = self.path_for(request.id);
        let tmp = self.dir.join(format!("{}.json.tmp", request.id));

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read(&self, id: Uuid) -> Result<Option<Request>, StoreError> {
        match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(Uuid::parse_str);
            match parsed {
                Some(Ok(id)) => ids.push(id),
                _ => warn!(path = %path.display(), "Skipping unrecognised file in request store"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn request(prompt: &str) -> Request {
        Request::new(prompt.into(), HashMap::new(), Utc::now())
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("requests")).await.unwrap();

        let mut req = request("glassy pad");
        store.write(&req).await.unwrap();
        req.attempts = 2;
        store.write(&req).await.unwrap();

        let back = store.read(req.id).await.unwrap().unwrap();
        assert_eq!(back, req);
        assert_eq!(store.list_ids().await.unwrap(), vec![req.id]);

        store.delete(req.id).await.unwrap();
        store.delete(req.id).await.unwrap();
        assert!(store.read(req.id).await.unwrap().is_none());
        assert!(store.list_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_ignores_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hi").await.unwrap();
        tokio::fs::write(dir.path().join("not-a-uuid.json"), b"{}").await.unwrap();

        let req = request("x");
        store.write(&req).await.unwrap();
        assert_eq!(store.list_ids().await.unwrap(), vec![req.id]);
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(dir.path().join(format!("{id}.json")), b"{broken").await.unwrap();
        assert!(matches!(store.read(id).await, Err(StoreError::Serialization(_))));
    }

    #[test]
    fn memory_store_basics() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let req = request("y");
            tokio_test::assert_ok!(store.write(&req).await);
            assert_eq!(store.len(), 1);
            assert_eq!(store.read(req.id).await.unwrap(), Some(req.clone()));
            tokio_test::assert_ok!(store.delete(req.id).await);
            assert!(store.is_empty());
        });
    }
}
