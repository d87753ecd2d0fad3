//! Embedding backends and dataset identity binding.
//!
//! Defines the [`Embedder`] trait and its backends:
//! - **[`HashEmbedder`]**: deterministic feature hashing of word tokens; no
//!   model, no network. Used offline and in tests.
//! - **[`remote::OpenAiEmbedder`]** / **[`remote::OllamaEmbedder`]**: HTTP
//!   backends with batching and retry.
//! - **`local::LocalEmbedder`**: fastembed, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! # Identity binding
//!
//! A dataset's vectors are only comparable with query vectors from the same
//! model. The first ingest into a scope records the configured
//! [`EmbeddingIdentity`] in the scope's [`Dataset`] row, and every later
//! ingest or query into that scope goes through [`IdentityBinder`], which
//! always resolves the *recorded* identity. If configuration has since moved
//! to a different model, the binder logs a
//! [`ConfigurationMismatch`](crate::error::HarnessError::ConfigurationMismatch)
//! and still uses the recorded one.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding

#[cfg(feature = "local-embeddings-fastembed")]
pub mod local;
pub mod remote;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::EmbeddingConfig;
use crate::error::HarnessError;
use crate::models::{Dataset, EmbeddingIdentity};
use crate::normalize::word_tokens;
use crate::store::DocumentStore;

const DEFAULT_HASH_DIMS: usize = 256;
const DEFAULT_LOCAL_MODEL: &str = "all-minilm-l6-v2";

/// An embedding backend bound to one model identity.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn identity(&self) -> &EmbeddingIdentity;

    /// Embed documents, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }
}

/// Builds embedders for identities.
pub trait EmbedderFactory: Send + Sync {
    /// The identity selected by current configuration.
    fn configured_identity(&self) -> Result<EmbeddingIdentity>;

    fn build(&self, identity: &EmbeddingIdentity) -> Result<Arc<dyn Embedder>>;
}

// ============ Hash Embedder ============

/// Signed feature hashing of lowercase word tokens into `dims` buckets,
/// L2-normalised. Texts sharing vocabulary get high cosine similarity.
pub struct HashEmbedder {
    identity: EmbeddingIdentity,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            identity: EmbeddingIdentity::new("hash", format!("hash-{}", dims)),
            dims,
        }
    }

    /// Parse `hash-<dims>` model names.
    pub fn from_model(model: &str) -> Result<Self> {
        let dims = model
            .strip_prefix("hash-")
            .and_then(|d| d.parse::<usize>().ok())
            .filter(|d| *d > 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid hash embedding model: '{}'", model))?;
        Ok(Self::new(dims))
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in word_tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(bytes);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn identity(&self) -> &EmbeddingIdentity {
        &self.identity
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Config-driven factory ============

/// Builds embedders from `[embedding]` configuration.
///
/// | Backend | Model default |
/// |---------|---------------|
/// | `hash` | `hash-<dims>` (dims default 256) |
/// | `openai` | required |
/// | `ollama` | required |
/// | `local` | `all-minilm-l6-v2` |
pub struct ConfigEmbedderFactory {
    config: EmbeddingConfig,
}

impl ConfigEmbedderFactory {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self { config }
    }
}

impl EmbedderFactory for ConfigEmbedderFactory {
    fn configured_identity(&self) -> Result<EmbeddingIdentity> {
        let provider = self.config.provider.as_str();
        let model = match provider {
            "disabled" => bail!("Embedding provider is disabled"),
            "hash" => format!("hash-{}", self.config.dims.unwrap_or(DEFAULT_HASH_DIMS)),
            "local" => self
                .config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL.to_string()),
            "openai" | "ollama" => self
                .config
                .model
                .clone()
                .ok_or_else(|| anyhow::anyhow!("embedding.model required for {}", provider))?,
            other => bail!("Unknown embedding provider: {}", other),
        };
        Ok(EmbeddingIdentity::new(provider, model))
    }

    fn build(&self, identity: &EmbeddingIdentity) -> Result<Arc<dyn Embedder>> {
        match identity.backend.as_str() {
            "hash" => Ok(Arc::new(HashEmbedder::from_model(&identity.model)?)),
            "openai" => Ok(Arc::new(remote::OpenAiEmbedder::new(
                &self.config,
                &identity.model,
            )?)),
            "ollama" => Ok(Arc::new(remote::OllamaEmbedder::new(
                &self.config,
                &identity.model,
            )?)),
            #[cfg(feature = "local-embeddings-fastembed")]
            "local" => Ok(Arc::new(local::LocalEmbedder::new(
                &self.config,
                &identity.model,
            )?)),
            #[cfg(not(feature = "local-embeddings-fastembed"))]
            "local" => bail!(
                "Local embedding backend requires --features local-embeddings-fastembed"
            ),
            other => bail!("Unknown embedding backend: {}", other),
        }
    }
}

// ============ Identity binding ============

/// Resolves the embedder for a scope from the scope's recorded identity.
pub struct IdentityBinder {
    store: Arc<dyn DocumentStore>,
    factory: Arc<dyn EmbedderFactory>,
    cache: Mutex<HashMap<EmbeddingIdentity, Arc<dyn Embedder>>>,
    warned: Mutex<HashSet<String>>,
}

impl IdentityBinder {
    pub fn new(store: Arc<dyn DocumentStore>, factory: Arc<dyn EmbedderFactory>) -> Self {
        Self {
            store,
            factory,
            cache: Mutex::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub async fn resolve(&self, identity: &EmbeddingIdentity) -> Result<Arc<dyn Embedder>> {
        let mut cache = self.cache.lock().await;
        if let Some(e) = cache.get(identity) {
            return Ok(e.clone());
        }
        let embedder = self.factory.build(identity)?;
        cache.insert(identity.clone(), embedder.clone());
        Ok(embedder)
    }

    /// Embedder for writing into `scope`. Records the configured identity
    /// on first use of the scope.
    pub async fn bind_for_ingest(&self, scope: &str) -> Result<Arc<dyn Embedder>> {
        let dataset = match self.store.get_dataset(scope).await? {
            Some(ds) => ds,
            None => {
                let identity = self.factory.configured_identity()?;
                let ds = Dataset {
                    scope: scope.to_string(),
                    identity,
                    dims: None,
                    created_at: chrono::Utc::now().timestamp(),
                };
                self.store.record_dataset(&ds).await?;
                // Re-read: a concurrent writer may have recorded first.
                match self.store.get_dataset(scope).await? {
                    Some(recorded) => {
                        info!(scope, identity = %recorded.identity, "recorded embedding identity");
                        recorded
                    }
                    None => ds,
                }
            }
        };
        self.check_mismatch(&dataset).await;
        self.resolve(&dataset.identity).await
    }

    /// Embedder for querying `scope`, or `None` if nothing was ever
    /// embedded there.
    pub async fn bind_for_query(&self, scope: &str) -> Result<Option<Arc<dyn Embedder>>> {
        match self.store.get_dataset(scope).await? {
            Some(dataset) => {
                self.check_mismatch(&dataset).await;
                Ok(Some(self.resolve(&dataset.identity).await?))
            }
            None => Ok(None),
        }
    }

    pub async fn record_dims(&self, scope: &str, dims: usize) -> Result<()> {
        if let Some(ds) = self.store.get_dataset(scope).await? {
            if ds.dims != Some(dims) {
                self.store.set_dataset_dims(scope, dims).await?;
            }
        }
        Ok(())
    }

    async fn check_mismatch(&self, dataset: &Dataset) {
        let configured = match self.factory.configured_identity() {
            Ok(c) => c,
            Err(_) => return,
        };
        if let Some(err) = identity_mismatch(dataset, &configured) {
            let mut warned = self.warned.lock().await;
            if warned.insert(dataset.scope.clone()) {
                warn!("{}", err);
            }
        }
    }
}

/// The mismatch error if `configured` differs from what `dataset` recorded.
pub fn identity_mismatch(dataset: &Dataset, configured: &EmbeddingIdentity) -> Option<HarnessError> {
    if &dataset.identity == configured {
        None
    } else {
        Some(HarnessError::ConfigurationMismatch {
            scope: dataset.scope.clone(),
            recorded: dataset.identity.to_string(),
            configured: configured.to_string(),
        })
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use corpus_harness::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched
/// lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
