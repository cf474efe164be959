//! # Embedder
//!
//! Turns text into unit-length vectors.
//!
//! The raw capability is anything implementing [`EmbeddingModel`]; the
//! shipped one is [`CandleEmbedder`], a BERT sentence-embedding model pulled
//! from the Hugging Face hub and run on CPU with Candle (pure Rust, no Python).
//! [`Embedder`] wraps a shared model handle and L2-normalizes every output so
//! that inner product equals cosine similarity in the index.
//!
//! The same [`Embedder`] value is constructed once at startup and handed to
//! both the ingestor and the query pipeline; tests hand in a stub model.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ravecraft::embedder::{CandleEmbedder, Embedder};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = CandleEmbedder::load("sentence-transformers/all-MiniLM-L6-v2", "main")?;
//! let embedder = Embedder::new(Arc::new(model));
//! let v = embedder.embed("How much are the LED glasses?")?;
//! assert_eq!(v.len(), 384);
//! # Ok(()) }
//! ```

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, DTYPE};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::error::EmbedError;

/// A raw text-to-vector capability. Outputs need not be normalized.
pub trait EmbeddingModel: Send + Sync {
    /// Identity of the model, used to check ingestion and query agree.
    fn model_id(&self) -> &str;

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError>;
}

/// Shared, normalizing front for an [`EmbeddingModel`].
#[derive(Clone)]
pub struct Embedder {
    model: Arc<dyn EmbeddingModel>,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model", &self.model.model_id())
            .finish()
    }
}

impl Embedder {
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        Self { model }
    }

    pub fn model_id(&self) -> &str {
        self.model.model_id()
    }

    /// Embed `text` and scale the result to unit L2 norm.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let raw = self.model.encode(text)?;
        normalize(raw)
    }

    /// [`embed`](Self::embed) on the blocking pool, for use from request tasks.
    pub async fn embed_async(&self, text: String) -> Result<Vec<f32>, EmbedError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.embed(&text))
            .await
            .map_err(|e| EmbedError::Join(e.to_string()))?
    }
}

/// Scale `vector` to unit length.
///
/// # Errors
/// [`EmbedError::ZeroVector`] when the norm is zero or not finite.
pub fn normalize(mut vector: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(EmbedError::ZeroVector);
    }
    for x in &mut vector {
        *x /= norm;
    }
    Ok(vector)
}

/// Sentence embeddings model using Candle (pure Rust).
pub struct CandleEmbedder {
    model_id: String,
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl CandleEmbedder {
    /// Download (or reuse the hub cache for) `model_id` at `revision` and load it.
    pub fn load(model_id: &str, revision: &str) -> Result<Self, EmbedError> {
        let load_err = |message: String| EmbedError::ModelLoad {
            model: model_id.to_string(),
            message,
        };
        let device = Device::Cpu;
        info!(model = model_id, revision, "Loading embedding model");

        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new().map_err(|e| load_err(e.to_string()))?;
        let api_repo = api.repo(repo);

        let config_filename = api_repo
            .get("config.json")
            .map_err(|e| load_err(e.to_string()))?;
        let tokenizer_filename = api_repo
            .get("tokenizer.json")
            .map_err(|e| load_err(e.to_string()))?;
        let weights_filename = api_repo
            .get("model.safetensors")
            .map_err(|e| load_err(e.to_string()))?;

        let config_text =
            std::fs::read_to_string(config_filename).map_err(|e| load_err(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&config_text).map_err(|e| load_err(e.to_string()))?;
        let max_len = serde_json::from_str::<serde_json::Value>(&config_text)
            .ok()
            .and_then(|raw| raw["max_position_embeddings"].as_u64())
            .unwrap_or(512) as usize;

        let mut tokenizer =
            Tokenizer::from_file(tokenizer_filename).map_err(|e| load_err(e.to_string()))?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: max_len,
                ..Default::default()
            }))
            .map_err(|e| load_err(e.to_string()))?;

        // SAFETY: the weights file is owned by the hub cache and not modified while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)
                .map_err(|e| load_err(e.to_string()))?
        };
        let model = BertModel::load(vb, &config).map_err(|e| load_err(e.to_string()))?;

        Ok(Self {
            model_id: model_id.to_string(),
            model,
            tokenizer,
            device,
        })
    }

    /// Mean pooling over token embeddings, considering attention mask
    fn mean_pooling(&self, embeddings: &Tensor, attention_mask: &[u32]) -> Result<Tensor, EmbedError> {
        // embeddings: [1, seq_len, hidden]; mask broadcast as [1, seq_len, 1]
        let mask = Tensor::new(attention_mask, &self.device)?
            .to_dtype(DType::F32)?
            .unsqueeze(0)?
            .unsqueeze(2)?;

        let sum = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let count = mask.sum(1)?.clamp(1f32, f32::INFINITY)?;
        let mean = sum.broadcast_div(&count)?.squeeze(0)?;
        Ok(mean)
    }
}

impl EmbeddingModel for CandleEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| EmbedError::Tokenize(e.to_string()))?;
        debug!(tokens = tokens.len(), "Encoding text");

        let token_ids = Tensor::new(tokens.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(tokens.get_type_ids(), &self.device)?.unsqueeze(0)?;

        let output = self.model.forward(&token_ids, &token_type_ids, None)?;
        let pooled = self.mean_pooling(&output, tokens.get_attention_mask())?;
        Ok(pooled.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEmbeddingModel;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(vec![3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_rejects_zero_vector() {
        assert!(matches!(
            normalize(vec![0.0; 8]),
            Err(EmbedError::ZeroVector)
        ));
    }

    #[test]
    fn test_embed_has_unit_norm() {
        let embedder = Embedder::new(Arc::new(StubEmbeddingModel::new(16)));
        for text in ["Price: $10", "Ships in 2 days", "How much?", "ü ñ 中文 🎧"] {
            let v = embedder.embed(text).unwrap();
            assert_eq!(v.len(), 16);
            assert!((norm(&v) - 1.0).abs() < 1e-5, "norm of {text:?}");
        }
    }

    #[test]
    fn test_embed_is_deterministic() {
        let embedder = Embedder::new(Arc::new(StubEmbeddingModel::new(8)));
        assert_eq!(embedder.embed("same").unwrap(), embedder.embed("same").unwrap());
        assert_eq!(embedder.model_id(), "stub-embedding");
    }

    #[tokio::test]
    async fn test_embed_async_matches_sync() {
        let embedder = Embedder::new(Arc::new(StubEmbeddingModel::new(8)));
        let sync = embedder.embed("Ships in 2 days").unwrap();
        let asynchronous = embedder.embed_async("Ships in 2 days".into()).await.unwrap();
        assert_eq!(sync, asynchronous);
    }
}
