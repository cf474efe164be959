//! Test doubles shared by the unit tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::embedder::EmbeddingModel;
use crate::error::{EmbedError, GenerationError, StoreError};
use crate::generation::Generator;
use crate::vector_store::{IndexParams, NewRecord, SearchHit, VectorStore};

/// Bag-of-words hashing model: deterministic, non-zero for any text with a
/// word in it, all zeros for empty text.
pub struct StubEmbeddingModel {
    dimension: usize,
}

impl StubEmbeddingModel {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl EmbeddingModel for StubEmbeddingModel {
    fn model_id(&self) -> &str {
        "stub-embedding"
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0; self.dimension];
        for word in text.split_whitespace() {
            // FNV-1a
            let hash = word.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
            vector[(hash % self.dimension as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}

/// Generator that answers every prompt with a fixed string and records prompts.
pub struct StubGenerator {
    answer: String,
    prompts: Mutex<Vec<String>>,
}

impl StubGenerator {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.answer.clone())
    }
}

/// Generator that always fails.
pub struct FailingGenerator {
    transient: bool,
    calls: AtomicUsize,
}

impl FailingGenerator {
    /// Fails with a 500 status, as an overloaded backend would.
    pub fn transient() -> Self {
        Self {
            transient: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails with an unparseable reply.
    pub fn invalid_response() -> Self {
        Self {
            transient: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            Err(GenerationError::Status {
                status: 500,
                body: "model runner crashed".into(),
            })
        } else {
            Err(GenerationError::InvalidResponse {
                message: "expected value at line 1 column 1".into(),
            })
        }
    }
}

/// In-memory store that follows a script and logs every call it receives.
pub struct ScriptedStore {
    /// Poll (1-based) on which `has_collection` starts answering true.
    appears_on_poll: Option<u32>,
    polls: AtomicU32,
    hits: Vec<SearchHit>,
    fail_load: bool,
    loaded: AtomicBool,
    events: Mutex<Vec<String>>,
}

impl ScriptedStore {
    /// A store whose collection is present from the first poll.
    pub fn ready() -> Self {
        Self::appearing_on(1)
    }

    pub fn appearing_on(poll: u32) -> Self {
        Self {
            appears_on_poll: Some(poll),
            polls: AtomicU32::new(0),
            hits: Vec::new(),
            fail_load: false,
            loaded: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn never_appearing() -> Self {
        Self {
            appears_on_poll: None,
            ..Self::ready()
        }
    }

    /// Serve `chunks` as search hits, best first.
    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.hits = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| SearchHit {
                id: i as i64 + 1,
                source: format!("doc{i}.txt"),
                chunk: chunk.to_string(),
                score: 1.0 - i as f32 * 0.1,
            })
            .collect();
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Collection already loaded by another client.
    pub fn already_loaded(self) -> Self {
        self.loaded.store(true, Ordering::SeqCst);
        self
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

#[async_trait]
impl VectorStore for ScriptedStore {
    fn endpoint(&self) -> String {
        "scripted".into()
    }

    async fn connect(&self) -> Result<(), StoreError> {
        self.record("connect");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.record("disconnect");
        Ok(())
    }

    async fn has_collection(&self, _name: &str) -> Result<bool, StoreError> {
        self.record("has");
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.appears_on_poll.is_some_and(|p| poll >= p))
    }

    async fn drop_collection(&self, _name: &str) -> Result<(), StoreError> {
        self.record("drop");
        Ok(())
    }

    async fn create_collection(&self, _name: &str, _dimension: usize) -> Result<(), StoreError> {
        self.record("create");
        Ok(())
    }

    async fn insert(&self, _name: &str, records: &[NewRecord]) -> Result<Vec<i64>, StoreError> {
        self.record("insert");
        Ok((1..=records.len() as i64).collect())
    }

    async fn create_index(&self, _name: &str, _params: &IndexParams) -> Result<(), StoreError> {
        self.record("build");
        Ok(())
    }

    async fn load_collection(&self, name: &str) -> Result<(), StoreError> {
        self.record("load");
        if self.fail_load {
            return Err(StoreError::Backend {
                message: format!("failed to load {name}"),
            });
        }
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn release_collection(&self, _name: &str) -> Result<(), StoreError> {
        self.record("release");
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_loaded(&self, _name: &str) -> Result<bool, StoreError> {
        self.record("load_state");
        Ok(self.loaded.load(Ordering::SeqCst))
    }

    async fn count(&self, _name: &str) -> Result<usize, StoreError> {
        Ok(self.hits.len())
    }

    async fn search(
        &self,
        _name: &str,
        _vector: &[f32],
        k: usize,
        _nprobe: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        self.record("search");
        Ok(self.hits.iter().take(k).cloned().collect())
    }
}
