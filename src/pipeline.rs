//! # Query pipeline
//!
//! Answers one question: embed it, retrieve the top-k chunks, assemble the
//! grounded prompt and ask the generation backend.
//!
//! Generation failures do not fail the request. They come back as a
//! *degraded* [`ChatOutcome`] whose answer reads `LLM error: <detail>`,
//! paired with the prompt that was sent. Embedding and retrieval failures are
//! real errors and propagate as [`RagError`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::embedder::Embedder;
use crate::error::RagError;
use crate::generation::Generator;
use crate::template::PromptTemplate;
use crate::vector_store::{SearchHit, VectorIndex};

/// Retrieval settings and prompt template for a [`QueryPipeline`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub nprobe: usize,
    pub template: PromptTemplate,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            nprobe: 10,
            template: PromptTemplate::default(),
        }
    }
}

/// The result of answering one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatOutcome {
    pub prompt: String,
    pub answer: String,
    /// True when the answer is an `LLM error` annotation.
    #[serde(skip)]
    pub degraded: bool,
}

pub struct QueryPipeline {
    embedder: Embedder,
    index: VectorIndex,
    generator: Arc<dyn Generator>,
    options: QueryOptions,
}

impl QueryPipeline {
    /// `index` must already be loaded.
    pub fn new(
        embedder: Embedder,
        index: VectorIndex,
        generator: Arc<dyn Generator>,
        options: QueryOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            options,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Embed `question` and fetch the closest chunks, best first.
    pub async fn retrieve(&self, question: &str) -> Result<Vec<SearchHit>, RagError> {
        let vector = self.embedder.embed_async(question.to_string()).await?;
        let hits = self
            .index
            .search(&vector, self.options.top_k, self.options.nprobe)
            .await?;
        info!(
            chunks = hits.len(),
            k = self.options.top_k,
            nprobe = self.options.nprobe,
            "Retrieved context"
        );
        Ok(hits)
    }

    pub async fn answer(&self, question: &str) -> Result<ChatOutcome, RagError> {
        info!(question, "Answering");
        let hits = self.retrieve(question).await?;
        let chunks: Vec<&str> = hits.iter().map(|h| h.chunk.as_str()).collect();
        let prompt = self.options.template.build(&chunks, question);

        match self.generator.generate(&prompt).await {
            Ok(answer) => Ok(ChatOutcome {
                prompt,
                answer,
                degraded: false,
            }),
            Err(e) => {
                error!(error = %e, "LLM error");
                Ok(ChatOutcome {
                    prompt,
                    answer: format!("LLM error: {e}"),
                    degraded: true,
                })
            }
        }
    }
}
