//! In-memory [`DocumentStore`] implementation for tests.
//!
//! Uses `HashMap`s behind `tokio::sync::RwLock`. Each method takes the lock
//! once, so every call is atomic with respect to the others.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::HarnessError;
use crate::models::{Chunk, Dataset, Document, DocumentUpdate};

use super::DocumentStore;

type Key = (String, String);

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<Key, Document>>,
    chunks: RwLock<HashMap<String, Vec<Chunk>>>,
    datasets: RwLock<HashMap<String, Dataset>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(scope: &str, path: &str) -> Key {
    (scope.to_string(), path.to_string())
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get_by_path(&self, scope: &str, path: &str) -> Result<Option<Document>> {
        Ok(self.docs.read().await.get(&key(scope, path)).cloned())
    }

    async fn create(&self, doc: &Document) -> Result<()> {
        let mut docs = self.docs.write().await;
        let k = key(&doc.scope, &doc.path);
        if docs.contains_key(&k) {
            return Err(HarnessError::PersistenceConflict {
                scope: doc.scope.clone(),
                path: doc.path.clone(),
                reason: "document already exists".to_string(),
            }
            .into());
        }
        docs.insert(k, doc.clone());
        Ok(())
    }

    async fn update_fields(&self, scope: &str, path: &str, update: &DocumentUpdate) -> Result<()> {
        let mut docs = self.docs.write().await;
        let doc = docs.get_mut(&key(scope, path)).ok_or_else(|| {
            anyhow::anyhow!("document not found: {}:{}", scope, path)
        })?;
        match update {
            DocumentUpdate::Content {
                content_hash,
                body,
                provenance,
                metadata_json,
            } => {
                doc.content_hash = content_hash.clone();
                doc.body = body.clone();
                doc.provenance = provenance.clone();
                doc.metadata_json = metadata_json.clone();
            }
            DocumentUpdate::Reactivate => {}
        }
        doc.active = true;
        doc.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn soft_delete(&self, scope: &str, path: &str) -> Result<bool> {
        let mut docs = self.docs.write().await;
        match docs.get_mut(&key(scope, path)) {
            Some(doc) if doc.active => {
                doc.active = false;
                doc.updated_at = chrono::Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_paths(&self, scope: &str) -> Result<Vec<String>> {
        let docs = self.docs.read().await;
        let mut paths: Vec<String> = docs
            .values()
            .filter(|d| d.scope == scope && d.active)
            .map(|d| d.path.clone())
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn replace_chunks(&self, source_key: &str, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().await;
        if chunks.is_empty() {
            stored.remove(source_key);
        } else {
            stored.insert(source_key.to_string(), chunks.to_vec());
        }
        Ok(())
    }

    async fn chunks_for(&self, source_key: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks
            .read()
            .await
            .get(source_key)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_dataset(&self, scope: &str) -> Result<Option<Dataset>> {
        Ok(self.datasets.read().await.get(scope).cloned())
    }

    async fn record_dataset(&self, dataset: &Dataset) -> Result<()> {
        self.datasets
            .write()
            .await
            .entry(dataset.scope.clone())
            .or_insert_with(|| dataset.clone());
        Ok(())
    }

    async fn set_dataset_dims(&self, scope: &str, dims: usize) -> Result<()> {
        if let Some(ds) = self.datasets.write().await.get_mut(scope) {
            ds.dims = Some(dims);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddingIdentity, Provenance};

    fn doc(path: &str) -> Document {
        Document {
            id: uuid::Uuid::new_v4().to_string(),
            scope: "notes".into(),
            path: path.into(),
            content_hash: "h".into(),
            body: "b".into(),
            active: true,
            provenance: Provenance::default(),
            metadata_json: "{}".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = InMemoryStore::new();
        store.create(&doc("a.md")).await.unwrap();
        let err = store.create(&doc("a.md")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::PersistenceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_soft_delete_and_list() {
        let store = InMemoryStore::new();
        store.create(&doc("b.md")).await.unwrap();
        store.create(&doc("a.md")).await.unwrap();
        assert_eq!(store.list_active_paths("notes").await.unwrap(), vec!["a.md", "b.md"]);
        assert!(store.soft_delete("notes", "a.md").await.unwrap());
        assert!(!store.soft_delete("notes", "a.md").await.unwrap());
        assert_eq!(store.list_active_paths("notes").await.unwrap(), vec!["b.md"]);
        store
            .update_fields("notes", "a.md", &DocumentUpdate::Reactivate)
            .await
            .unwrap();
        assert!(store.get_by_path("notes", "a.md").await.unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn test_record_dataset_keeps_first() {
        let store = InMemoryStore::new();
        let first = Dataset {
            scope: "notes".into(),
            identity: EmbeddingIdentity::new("hash", "hash-256"),
            dims: None,
            created_at: 0,
        };
        let mut second = first.clone();
        second.identity = EmbeddingIdentity::new("openai", "x");
        store.record_dataset(&first).await.unwrap();
        store.record_dataset(&second).await.unwrap();
        store.set_dataset_dims("notes", 256).await.unwrap();
        let ds = store.get_dataset("notes").await.unwrap().unwrap();
        assert_eq!(ds.identity, first.identity);
        assert_eq!(ds.dims, Some(256));
    }
}
