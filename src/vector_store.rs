//! # VectorStore
//!
//! Narrow interface to an approximate nearest-neighbor store, plus the
//! [`VectorIndex`] handle the pipelines use.
//!
//! A store hosts named collections. Each collection has a fixed embedding
//! dimension, uses inner product as its metric, and goes through the same
//! lifecycle regardless of backend:
//!
//! 1. **create**: [`VectorIndex::create`] drops any same-named collection and
//!    makes an empty one. This is destructive; nothing is merged or migrated.
//! 2. **insert**: bulk append, ids are assigned by the store.
//! 3. **build**: construct the ANN structure over the current contents.
//! 4. **load**: make the collection searchable. Searching before this fails.
//! 5. **release**: drop the queryable state (every teardown path calls it).
//!
//! Two backends implement [`VectorStore`]:
//! - [`MilvusStore`](milvus::MilvusStore): Milvus over its RESTful v2 API.
//! - [`LocalStore`](local::LocalStore): collections on local disk with an
//!   in-process HNSW graph.
//!
//! ## Persisted schema
//! | field       | type                  |
//! |-------------|-----------------------|
//! | `id`        | int64, primary, auto  |
//! | `source`    | varchar(512)          |
//! | `chunk`     | varchar(4096)         |
//! | `embedding` | float vector (`dim`)  |

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;

pub mod local;
pub mod milvus;

/// Maximum byte length of a record's `source` field.
pub const MAX_SOURCE_LEN: usize = 512;
/// Maximum byte length of a record's `chunk` field.
pub const MAX_CHUNK_LEN: usize = 4096;
/// Maximum byte length of a collection name.
pub const MAX_NAME_LEN: usize = 255;

/// Similarity metric. Only inner product is used: embeddings are unit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Metric {
    #[default]
    #[serde(rename = "IP")]
    InnerProduct,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::InnerProduct => "IP",
        }
    }
}

/// ANN build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParams {
    pub index_type: String,
    pub metric: Metric,
    /// Number of clusters for IVF index types.
    pub nlist: u32,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            index_type: "IVF_FLAT".to_string(),
            metric: Metric::InnerProduct,
            nlist: 128,
        }
    }
}

/// A record to insert; the store assigns its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub source: String,
    pub chunk: String,
    pub embedding: Vec<f32>,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: i64,
    pub source: String,
    pub chunk: String,
    /// Inner-product similarity to the query; higher is closer.
    pub score: f32,
}

/// Backend operations on named collections.
///
/// Implementations must be safe to share across concurrent request tasks once
/// a collection is loaded.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Human-readable location of the backend, for logs and errors.
    fn endpoint(&self) -> String;

    /// Open a session. Fails with [`StoreError::Connection`] when unreachable.
    async fn connect(&self) -> Result<(), StoreError>;

    async fn disconnect(&self) -> Result<(), StoreError>;

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Create an empty collection. The name must not already exist.
    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), StoreError>;

    /// Append records, returning assigned ids in input order.
    async fn insert(&self, name: &str, records: &[NewRecord]) -> Result<Vec<i64>, StoreError>;

    async fn create_index(&self, name: &str, params: &IndexParams) -> Result<(), StoreError>;

    async fn load_collection(&self, name: &str) -> Result<(), StoreError>;

    async fn release_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Whether the collection is currently loaded and searchable, by anyone.
    async fn is_loaded(&self, name: &str) -> Result<bool, StoreError>;

    /// Number of records stored in the collection.
    async fn count(&self, name: &str) -> Result<usize, StoreError>;

    /// Up to `k` hits by descending inner product. `nprobe` widens the scan.
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;
}

/// Collection names are a letter or underscore followed by letters, digits
/// or underscores. Both backends accept this set, and it keeps a name from
/// ever escaping the local store's root directory.
pub fn validate_collection_name(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid = name.len() <= MAX_NAME_LEN
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Check a record against the persisted schema.
pub(crate) fn validate_record(record: &NewRecord, dimension: usize) -> Result<(), StoreError> {
    if record.embedding.len() != dimension {
        return Err(StoreError::DimensionMismatch {
            expected: dimension,
            actual: record.embedding.len(),
        });
    }
    if record.source.len() > MAX_SOURCE_LEN {
        return Err(StoreError::Backend {
            message: format!(
                "source length {} exceeds max length {MAX_SOURCE_LEN}",
                record.source.len()
            ),
        });
    }
    if record.chunk.len() > MAX_CHUNK_LEN {
        return Err(StoreError::Backend {
            message: format!(
                "chunk length {} exceeds max length {MAX_CHUNK_LEN}",
                record.chunk.len()
            ),
        });
    }
    Ok(())
}

/// Handle on one named collection in a [`VectorStore`].
///
/// Cheap to clone; clones share the same backend.
#[derive(Clone)]
pub struct VectorIndex {
    store: Arc<dyn VectorStore>,
    name: String,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("name", &self.name)
            .field("endpoint", &self.store.endpoint())
            .finish()
    }
}

impl VectorIndex {
    /// Refer to an existing collection without touching the store.
    pub fn open(store: Arc<dyn VectorStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    /// Create `name` with `dimension`, dropping any existing collection of
    /// that name first. Prior records are discarded, not merged.
    pub async fn create(
        store: Arc<dyn VectorStore>,
        name: impl Into<String>,
        dimension: usize,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        if store.has_collection(&name).await? {
            info!(collection = %name, "Dropping existing collection");
            store.drop_collection(&name).await?;
        }
        store.create_collection(&name, dimension).await?;
        info!(collection = %name, dimension, "Created collection");
        Ok(Self { store, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn exists(&self) -> Result<bool, StoreError> {
        self.store.has_collection(&self.name).await
    }

    /// Insert `records` in batches of at most `batch_size`, returning ids in
    /// input order.
    pub async fn insert(
        &self,
        records: &[NewRecord],
        batch_size: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::with_capacity(records.len());
        for batch in records.chunks(batch_size.max(1)) {
            let assigned = self.store.insert(&self.name, batch).await?;
            if assigned.len() != batch.len() {
                return Err(StoreError::Backend {
                    message: format!(
                        "store assigned {} ids for {} records",
                        assigned.len(),
                        batch.len()
                    ),
                });
            }
            debug!(collection = %self.name, batch = batch.len(), "Inserted batch");
            ids.extend(assigned);
        }
        Ok(ids)
    }

    pub async fn build(&self, params: &IndexParams) -> Result<(), StoreError> {
        self.store.create_index(&self.name, params).await
    }

    pub async fn load(&self) -> Result<(), StoreError> {
        self.store.load_collection(&self.name).await
    }

    pub async fn release(&self) -> Result<(), StoreError> {
        self.store.release_collection(&self.name).await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count(&self.name).await
    }

    pub async fn is_loaded(&self) -> Result<bool, StoreError> {
        self.store.is_loaded(&self.name).await
    }

    /// One-off search for short-lived callers.
    ///
    /// Load state on a shared server belongs to whoever loaded the
    /// collection. If it is already loaded it is searched as is and left
    /// loaded; otherwise it is loaded for this search and released after.
    pub async fn search_once(
        &self,
        vector: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if self.is_loaded().await? {
            return self.search(vector, k, nprobe).await;
        }
        self.load().await?;
        let hits = self.search(vector, k, nprobe).await;
        if let Err(e) = self.release().await {
            warn!(collection = %self.name, error = %e, "Failed to release collection");
        }
        hits
    }

    /// Top `k` hits for `vector`, best first.
    pub async fn search(
        &self,
        vector: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut hits = self.store.search(&self.name, vector, k, nprobe).await?;
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        debug!(collection = %self.name, hits = hits.len(), k, nprobe, "Search complete");
        Ok(hits)
    }
}

/// Build the backend selected by `config`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>, StoreError> {
    let store: Arc<dyn VectorStore> = match config.backend {
        StoreBackend::Milvus => Arc::new(milvus::MilvusStore::new(
            &config.host,
            config.port,
            config.token.clone(),
            std::time::Duration::from_secs_f64(config.timeout_secs),
        )?),
        StoreBackend::Local => Arc::new(local::LocalStore::new(config.data_dir.clone())),
    };
    Ok(store)
}

/// Inner product of two equal-length vectors.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
