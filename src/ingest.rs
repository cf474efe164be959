//! # Ingestion
//!
//! Offline batch job that turns a directory of `*.txt` files into a loaded
//! collection, in five stages:
//!
//! 1. read, chunk and embed every document (sorted by path),
//! 2. connect to the vector store,
//! 3. recreate the collection with the dimension of the first vector,
//! 4. insert all records in batches,
//! 5. build the ANN index and load the collection.
//!
//! Nothing touches the store until stage 2, so an empty corpus fails with
//! [`RagError::EmptyInput`] and leaves any existing collection alone. Later
//! failures abort the job and leave the collection as `create`/`insert` left
//! it; there is no rollback.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunker::{Chunker, Document};
use crate::embedder::Embedder;
use crate::error::RagError;
use crate::vector_store::{IndexParams, NewRecord, VectorIndex, VectorStore};

/// Default number of records per insert request.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub documents: usize,
    pub records: usize,
    pub dimension: usize,
    /// Store-assigned ids, in the order records were produced.
    pub ids: Vec<i64>,
}

/// All `*.txt` files under `root`, recursively, in lexicographic path order.
pub fn discover_documents(root: &Path) -> Result<Vec<PathBuf>, RagError> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "txt") {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Read a document, replacing invalid UTF-8 rather than failing.
pub fn read_document(path: &Path) -> Result<Document, RagError> {
    let bytes = fs::read(path)?;
    Ok(Document {
        path: path.to_path_buf(),
        text: String::from_utf8_lossy(&bytes).into_owned(),
    })
}

pub struct Ingestor {
    embedder: Embedder,
    chunker: Chunker,
    store: Arc<dyn VectorStore>,
    index_params: IndexParams,
    batch_size: usize,
    progress: bool,
}

impl Ingestor {
    pub fn new(embedder: Embedder, chunker: Chunker, store: Arc<dyn VectorStore>) -> Self {
        Self {
            embedder,
            chunker,
            store,
            index_params: IndexParams::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            progress: false,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_index_params(mut self, params: IndexParams) -> Self {
        self.index_params = params;
        self
    }

    /// Show a progress bar over files while embedding.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    }

    /// Stage 1: chunk and embed every document.
    async fn embed_documents(&self, paths: &[PathBuf]) -> Result<Vec<NewRecord>, RagError> {
        let pb = self.progress_bar(paths.len());
        let mut records = Vec::new();
        for path in paths {
            pb.set_message(path.display().to_string());
            let document = read_document(path)?;
            for chunk in self.chunker.chunk_document(&document) {
                let embedding = self.embedder.embed_async(chunk.text.clone()).await?;
                records.push(NewRecord {
                    source: chunk.source_path,
                    chunk: chunk.text,
                    embedding,
                });
            }
            debug!(path = %path.display(), records = records.len(), "Embedded document");
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(records)
    }

    /// Rebuild `collection` from the `*.txt` files under `source`.
    ///
    /// # Errors
    /// [`RagError::EmptyInput`] when there are no files or they hold no words.
    /// Embedding and store failures abort the job.
    pub async fn ingest(&self, source: &Path, collection: &str) -> Result<IngestReport, RagError> {
        let paths = discover_documents(source)?;
        if paths.is_empty() {
            return Err(RagError::EmptyInput {
                path: source.to_path_buf(),
            });
        }

        info!(
            "[1/5] Embedding {} docs with {}",
            paths.len(),
            self.embedder.model_id()
        );
        let records = self.embed_documents(&paths).await?;
        let Some(dimension) = records.first().map(|r| r.embedding.len()) else {
            return Err(RagError::EmptyInput {
                path: source.to_path_buf(),
            });
        };

        info!("[2/5] Connecting to {}", self.store.endpoint());
        self.store.connect().await?;

        info!("[3/5] Creating collection '{collection}' (dim={dimension})");
        let index = VectorIndex::create(Arc::clone(&self.store), collection, dimension).await?;

        info!("[4/5] Inserting {} vectors", records.len());
        let ids = index.insert(&records, self.batch_size).await?;

        info!("[5/5] Building index + loading");
        index.build(&self.index_params).await?;
        index.load().await?;

        info!("Done: {} vectors in '{collection}'", ids.len());
        Ok(IngestReport {
            documents: paths.len(),
            records: records.len(),
            dimension,
            ids,
        })
    }

    /// [`ingest`](Self::ingest), then disconnect from the store whether or
    /// not the job succeeded.
    pub async fn run(&self, source: &Path, collection: &str) -> Result<IngestReport, RagError> {
        let result = self.ingest(source, collection).await;
        if let Err(e) = self.store.disconnect().await {
            warn!(endpoint = %self.store.endpoint(), error = %e, "Failed to disconnect");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedStore, StubEmbeddingModel};
    use crate::vector_store::local::LocalStore;
    use tempfile::TempDir;

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn embedder() -> Embedder {
        Embedder::new(Arc::new(StubEmbeddingModel::new(1024)))
    }

    #[tokio::test]
    async fn test_two_documents_of_130_words_give_six_records() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 130)).unwrap();
        fs::write(data.path().join("b.txt"), words("beta", 130)).unwrap();

        let index_dir = TempDir::new().unwrap();
        let store: Arc<dyn VectorStore> = Arc::new(LocalStore::new(index_dir.path()));
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone())
            .with_batch_size(4);

        let report = ingestor.ingest(data.path(), "ravecraft").await.unwrap();
        assert_eq!(report.documents, 2);
        assert_eq!(report.records, 6);
        assert_eq!(report.dimension, 1024);
        assert_eq!(report.ids.len(), 6);

        let index = VectorIndex::open(store, "ravecraft");
        assert_eq!(index.count().await.unwrap(), 6);
        let query = embedder().embed(&words("beta", 10)).unwrap();
        let hits = index.search(&query, 1, 10).await.unwrap();
        assert!(hits[0].source.ends_with("b.txt"));
    }

    #[tokio::test]
    async fn test_reingest_replaces_previous_records() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 130)).unwrap();
        let index_dir = TempDir::new().unwrap();
        let store: Arc<dyn VectorStore> = Arc::new(LocalStore::new(index_dir.path()));
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone());

        ingestor.ingest(data.path(), "ravecraft").await.unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 10)).unwrap();
        let report = ingestor.ingest(data.path(), "ravecraft").await.unwrap();

        assert_eq!(report.records, 1);
        let index = VectorIndex::open(store, "ravecraft");
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_corpus_does_not_touch_store() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("notes.md"), "not a text file").unwrap();
        fs::write(data.path().join("blank.txt"), "  \n\t ").unwrap();

        let store = Arc::new(ScriptedStore::ready());
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone());

        let err = ingestor.ingest(data.path(), "ravecraft").await.unwrap_err();
        assert!(matches!(err, RagError::EmptyInput { .. }));

        let missing = data.path().join("does-not-exist");
        let err = ingestor.ingest(&missing, "ravecraft").await.unwrap_err();
        assert!(matches!(err, RagError::EmptyInput { .. }));

        assert!(store.events().is_empty());
    }

    #[test]
    fn test_discovery_is_recursive_and_sorted() {
        let data = TempDir::new().unwrap();
        fs::create_dir_all(data.path().join("sub/deeper")).unwrap();
        fs::write(data.path().join("b.txt"), "b").unwrap();
        fs::write(data.path().join("a.txt"), "a").unwrap();
        fs::write(data.path().join("sub/deeper/c.txt"), "c").unwrap();
        fs::write(data.path().join("sub/ignored.json"), "{}").unwrap();

        let found: Vec<PathBuf> = discover_documents(data.path())
            .unwrap()
            .into_iter()
            .map(|p| p.strip_prefix(data.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            found,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("sub/deeper/c.txt")
            ]
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let data = TempDir::new().unwrap();
        let path = data.path().join("latin1.txt");
        fs::write(&path, b"caf\xe9 prices").unwrap();
        let doc = read_document(&path).unwrap();
        assert!(doc.text.starts_with("caf"));
        assert!(doc.text.ends_with(" prices"));
    }

    #[tokio::test]
    async fn test_store_sees_stages_in_order() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 130)).unwrap();

        let store = Arc::new(ScriptedStore::never_appearing());
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone())
            .with_batch_size(2);
        let report = ingestor.ingest(data.path(), "ravecraft").await.unwrap();

        assert_eq!(report.records, 3);
        assert_eq!(
            store.events(),
            vec!["connect", "has", "create", "insert", "insert", "build", "load"]
        );
    }

    #[tokio::test]
    async fn test_run_disconnects_after_a_failed_job() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 130)).unwrap();

        let store = Arc::new(ScriptedStore::never_appearing().failing_load());
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone());
        let result = ingestor.run(data.path(), "ravecraft").await;

        assert!(matches!(result, Err(RagError::Store(_))));
        let events = store.events();
        assert_eq!(events[events.len() - 2..], ["load", "disconnect"]);
    }

    #[tokio::test]
    async fn test_run_disconnects_after_success() {
        let data = TempDir::new().unwrap();
        fs::write(data.path().join("a.txt"), words("alpha", 10)).unwrap();

        let store = Arc::new(ScriptedStore::never_appearing());
        let ingestor = Ingestor::new(embedder(), Chunker::new(128, 64).unwrap(), store.clone());
        ingestor.run(data.path(), "ravecraft").await.unwrap();

        assert_eq!(store.events().last().map(String::as_str), Some("disconnect"));
    }
}
