//! On-disk collections with an in-process HNSW graph.
//!
//! Each collection lives in `<root>/<name>/`:
//! - `meta.yaml`: name, dimension, metric, build parameters once built, next
//!   id, record count and the committed length of `records.bin`.
//! - `records.bin`: bincode-encoded record batches, appended one per insert.
//!
//! `meta.yaml` is rewritten atomically (temp file + rename) after every
//! append and is the commit point: bytes past its committed length are a torn
//! or unacknowledged batch, ignored on read and truncated by the next insert.
//! Ingestion therefore writes each record once.
//!
//! Loading reads the records and builds a [HNSW](https://arxiv.org/abs/1603.09320)
//! graph over them with `hora`. The graph gathers candidates by Euclidean
//! distance, which ranks unit vectors the same way inner product does. A
//! search asks the graph for `k * nprobe` candidates and re-ranks them by
//! exact inner product, so `nprobe` trades latency for recall like it does on
//! an IVF index. When the candidate budget covers the whole collection the
//! scan is exhaustive.
//!
//! File access and graph construction run on the blocking thread pool.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric as HoraMetric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{
    IndexParams, Metric, NewRecord, SearchHit, VectorStore, inner_product,
    validate_collection_name, validate_record,
};
use crate::error::StoreError;

const META_FILE: &str = "meta.yaml";
const RECORDS_FILE: &str = "records.bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionMeta {
    name: String,
    dimension: usize,
    metric: Metric,
    index: Option<IndexParams>,
    next_id: i64,
    #[serde(default)]
    record_count: usize,
    /// Committed byte length of `records.bin`.
    #[serde(default)]
    records_len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    id: i64,
    source: String,
    chunk: String,
    embedding: Vec<f32>,
}

/// Paths of one collection on disk.
#[derive(Debug, Clone)]
struct CollectionFiles {
    dir: PathBuf,
    name: String,
}

impl CollectionFiles {
    fn exists(&self) -> bool {
        self.dir.join(META_FILE).is_file()
    }

    fn read_meta(&self) -> Result<CollectionMeta, StoreError> {
        let path = self.dir.join(META_FILE);
        if !path.is_file() {
            return Err(StoreError::CollectionNotFound {
                name: self.name.clone(),
            });
        }
        let content = fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| StoreError::Codec(e.to_string()))
    }

    fn write_meta(&self, meta: &CollectionMeta) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(meta).map_err(|e| StoreError::Codec(e.to_string()))?;
        write_atomic(&self.dir, META_FILE, yaml.as_bytes())
    }

    /// Decode every committed batch.
    fn read_records(&self, meta: &CollectionMeta) -> Result<Vec<StoredRecord>, StoreError> {
        if meta.records_len == 0 {
            return Ok(Vec::new());
        }
        let bytes = fs::read(self.dir.join(RECORDS_FILE))?;
        let committed = usize::try_from(meta.records_len)
            .ok()
            .and_then(|len| bytes.get(..len))
            .ok_or_else(|| {
                StoreError::Codec(format!(
                    "{RECORDS_FILE} holds {} bytes, {} committed",
                    bytes.len(),
                    meta.records_len
                ))
            })?;

        let mut records = Vec::with_capacity(meta.record_count);
        let mut offset = 0;
        while offset < committed.len() {
            let (batch, read): (Vec<StoredRecord>, usize) = bincode::serde::decode_from_slice(
                &committed[offset..],
                bincode::config::standard(),
            )
            .map_err(|e| StoreError::Codec(e.to_string()))?;
            records.extend(batch);
            offset += read;
        }
        Ok(records)
    }

    /// Append one batch after the committed length, then commit it in `meta`.
    fn append_records(
        &self,
        meta: &mut CollectionMeta,
        batch: &[StoredRecord],
    ) -> Result<(), StoreError> {
        let bytes = bincode::serde::encode_to_vec(batch, bincode::config::standard())
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(RECORDS_FILE))?;
        file.set_len(meta.records_len)?;
        file.seek(SeekFrom::Start(meta.records_len))?;
        file.write_all(&bytes)?;
        file.sync_data()?;

        meta.records_len += bytes.len() as u64;
        meta.record_count += batch.len();
        self.write_meta(meta)
    }
}

/// In-memory, read-only view of a loaded collection.
struct LoadedCollection {
    dimension: usize,
    records: Vec<StoredRecord>,
    /// Graph over positions in `records`; absent for an empty collection.
    graph: Option<HNSWIndex<f32, usize>>,
}

impl LoadedCollection {
    fn build(dimension: usize, records: Vec<StoredRecord>) -> Result<Self, StoreError> {
        let graph = if records.is_empty() {
            None
        } else {
            let mut graph = HNSWIndex::new(dimension, &HNSWParams::default());
            for (pos, record) in records.iter().enumerate() {
                graph
                    .add(&record.embedding, pos)
                    .map_err(|e| StoreError::Backend {
                        message: format!("HNSW add failed: {e}"),
                    })?;
            }
            graph
                .build(HoraMetric::Euclidean)
                .map_err(|e| StoreError::Backend {
                    message: format!("HNSW build failed: {e}"),
                })?;
            Some(graph)
        };
        Ok(Self {
            dimension,
            records,
            graph,
        })
    }

    fn search(&self, vector: &[f32], k: usize, nprobe: usize) -> Vec<SearchHit> {
        let budget = k.saturating_mul(nprobe.max(1));
        let positions: Vec<usize> = match &self.graph {
            Some(graph) if budget < self.records.len() => graph
                .search_nodes(vector, budget)
                .into_iter()
                .filter_map(|(node, _distance)| *node.idx())
                .collect(),
            _ => (0..self.records.len()).collect(),
        };

        let mut hits: Vec<SearchHit> = positions
            .into_iter()
            .filter_map(|pos| self.records.get(pos))
            .map(|record| SearchHit {
                id: record.id,
                source: record.source.clone(),
                chunk: record.chunk.clone(),
                score: inner_product(vector, &record.embedding),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }
}

/// Vector store backed by a local directory.
pub struct LocalStore {
    root: PathBuf,
    loaded: RwLock<HashMap<String, Arc<LoadedCollection>>>,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn files(&self, name: &str) -> Result<CollectionFiles, StoreError> {
        validate_collection_name(name)?;
        Ok(CollectionFiles {
            dir: self.root.join(name),
            name: name.to_string(),
        })
    }

    fn loaded(&self, name: &str) -> Option<Arc<LoadedCollection>> {
        self.loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    fn set_loaded(&self, name: &str, collection: Option<LoadedCollection>) {
        let mut loaded = self
            .loaded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match collection {
            Some(collection) => {
                loaded.insert(name.to_string(), Arc::new(collection));
            }
            None => {
                loaded.remove(name);
            }
        }
    }
}

fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(file_name))
        .map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::Backend {
            message: format!("local store task failed: {e}"),
        })?
}

#[async_trait]
impl VectorStore for LocalStore {
    fn endpoint(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn connect(&self) -> Result<(), StoreError> {
        let root = self.root.clone();
        let endpoint = self.endpoint();
        blocking(move || {
            fs::create_dir_all(&root).map_err(|e| StoreError::Connection {
                endpoint,
                message: e.to_string(),
            })
        })
        .await?;
        debug!(root = %self.root.display(), "Opened local store");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.loaded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool, StoreError> {
        let files = self.files(name)?;
        blocking(move || Ok(files.exists())).await
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let files = self.files(name)?;
        self.set_loaded(name, None);
        blocking(move || {
            if files.dir.exists() {
                fs::remove_dir_all(&files.dir)?;
            }
            Ok(())
        })
        .await
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<(), StoreError> {
        let files = self.files(name)?;
        blocking(move || {
            if files.exists() {
                return Err(StoreError::Backend {
                    message: format!("collection '{}' already exists", files.name),
                });
            }
            fs::create_dir_all(&files.dir)?;
            fs::File::create(files.dir.join(RECORDS_FILE))?;
            files.write_meta(&CollectionMeta {
                name: files.name.clone(),
                dimension,
                metric: Metric::InnerProduct,
                index: None,
                next_id: 0,
                record_count: 0,
                records_len: 0,
            })
        })
        .await
    }

    async fn insert(&self, name: &str, records: &[NewRecord]) -> Result<Vec<i64>, StoreError> {
        let files = self.files(name)?;
        let records = records.to_vec();
        blocking(move || {
            let mut meta = files.read_meta()?;
            for record in &records {
                validate_record(record, meta.dimension)?;
            }

            let mut ids = Vec::with_capacity(records.len());
            let batch: Vec<StoredRecord> = records
                .into_iter()
                .map(|record| {
                    let id = meta.next_id;
                    meta.next_id += 1;
                    ids.push(id);
                    StoredRecord {
                        id,
                        source: record.source,
                        chunk: record.chunk,
                        embedding: record.embedding,
                    }
                })
                .collect();

            files.append_records(&mut meta, &batch)?;
            Ok(ids)
        })
        .await
    }

    async fn create_index(&self, name: &str, params: &IndexParams) -> Result<(), StoreError> {
        let files = self.files(name)?;
        let params = params.clone();
        blocking(move || {
            let mut meta = files.read_meta()?;
            meta.index = Some(params);
            files.write_meta(&meta)
        })
        .await
    }

    async fn load_collection(&self, name: &str) -> Result<(), StoreError> {
        let files = self.files(name)?;
        let collection = blocking(move || {
            let meta = files.read_meta()?;
            if meta.index.is_none() {
                return Err(StoreError::NotBuilt { name: files.name });
            }
            let records = files.read_records(&meta)?;
            LoadedCollection::build(meta.dimension, records)
        })
        .await?;
        let count = collection.records.len();
        self.set_loaded(name, Some(collection));
        info!(collection = name, records = count, "Loaded collection into memory");
        Ok(())
    }

    async fn release_collection(&self, name: &str) -> Result<(), StoreError> {
        self.set_loaded(name, None);
        Ok(())
    }

    /// Load state is held by this process only.
    async fn is_loaded(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.loaded(name).is_some())
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        let files = self.files(name)?;
        blocking(move || Ok(files.read_meta()?.record_count)).await
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let collection = self.loaded(name).ok_or_else(|| StoreError::NotLoaded {
            name: name.to_string(),
        })?;
        if vector.len() != collection.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: collection.dimension,
                actual: vector.len(),
            });
        }
        Ok(collection.search(vector, k, nprobe))
    }
}
