//! Run record persistence.
//!
//! The core only needs three operations from a store: insert, update by id,
//! and "most recent record matching a filter". Recency is insertion order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::{GrabberError, NewRunRecord, RunFilter, RunPatch, RunRecord};

/// Durable log of grab attempts.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    /// Persist a new record and return its id.
    async fn insert(&self, collection: &str, record: NewRunRecord) -> Result<String, GrabberError>;

    /// Apply a status transition to an existing record.
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: RunPatch,
    ) -> Result<(), GrabberError>;

    /// Most recently inserted record matching `filter`, if any.
    async fn query_latest(
        &self,
        collection: &str,
        filter: &RunFilter,
    ) -> Result<Option<RunRecord>, GrabberError>;
}

/// In-memory store, for tests and single-process use.
#[derive(Clone, Default)]
pub struct MemoryRunLogStore {
    collections: Arc<RwLock<HashMap<String, Vec<RunRecord>>>>,
}

impl MemoryRunLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of a collection, oldest first.
    pub async fn records(&self, collection: &str) -> Vec<RunRecord> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunLogStore for MemoryRunLogStore {
    async fn insert(&self, collection: &str, record: NewRunRecord) -> Result<String, GrabberError> {
        record.extra.check_fields()?;
        let id = uuid::Uuid::new_v4().to_string();
        let record = RunRecord::from_new(id.clone(), record, Utc::now());
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }

    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: RunPatch,
    ) -> Result<(), GrabberError> {
        patch.extra.check_fields()?;
        let mut collections = self.collections.write().await;
        let record = collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| r.id == id))
            .ok_or_else(|| not_found(collection, id))?;
        record.apply(patch, Utc::now());
        Ok(())
    }

    async fn query_latest(
        &self,
        collection: &str,
        filter: &RunFilter,
    ) -> Result<Option<RunRecord>, GrabberError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|records| records.iter().rev().find(|r| filter.matches(r)))
            .cloned())
    }
}

/// File-backed store: one JSON array per collection under a directory.
///
/// Writes go through a temp file and a rename. Access is serialized within
/// the process only.
pub struct FileRunLogStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileRunLogStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, GrabberError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf, GrabberError> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(GrabberError::InvalidConfig(format!(
                "invalid collection name: {:?}",
                collection
            )));
        }
        Ok(self.dir.join(format!("{}.json", collection)))
    }

    async fn load(&self, path: &Path) -> Result<Vec<RunRecord>, GrabberError> {
        match tokio::fs::read(path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, path: &Path, records: &[RunRecord]) -> Result<(), GrabberError> {
        let json = serde_json::to_vec_pretty(records)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), count = records.len(), "saved run log");
        Ok(())
    }
}

#[async_trait]
impl RunLogStore for FileRunLogStore {
    #[tracing::instrument(skip(self, record), fields(vendor_code = %record.lineage.vendor_code))]
    async fn insert(&self, collection: &str, record: NewRunRecord) -> Result<String, GrabberError> {
        let path = self.collection_path(collection)?;
        record.extra.check_fields()?;
        let _guard = self.lock.lock().await;

        let mut records = self.load(&path).await?;
        let id = uuid::Uuid::new_v4().to_string();
        records.push(RunRecord::from_new(id.clone(), record, Utc::now()));
        self.save(&path, &records).await?;
        Ok(id)
    }

    #[tracing::instrument(skip(self, patch), fields(status = %patch.status))]
    async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        patch: RunPatch,
    ) -> Result<(), GrabberError> {
        let path = self.collection_path(collection)?;
        patch.extra.check_fields()?;
        let _guard = self.lock.lock().await;

        let mut records = self.load(&path).await?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found(collection, id))?;
        record.apply(patch, Utc::now());
        self.save(&path, &records).await
    }

    async fn query_latest(
        &self,
        collection: &str,
        filter: &RunFilter,
    ) -> Result<Option<RunRecord>, GrabberError> {
        let path = self.collection_path(collection)?;
        let _guard = self.lock.lock().await;

        let records = self.load(&path).await?;
        Ok(records.into_iter().rev().find(|r| filter.matches(r)))
    }
}

fn not_found(collection: &str, id: &str) -> GrabberError {
    GrabberError::RecordNotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}
