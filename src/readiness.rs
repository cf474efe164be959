//! # Readiness gate
//!
//! Startup protocol run once before the HTTP server accepts traffic:
//!
//! 1. connect to the vector store,
//! 2. poll for the collection under a [`BackoffPolicy`] and load it once it
//!    shows up (or fail with [`RagError::IndexMissing`]),
//! 3. pre-warm the generation backend with `"ping"`.
//!
//! The result is a [`ServingContext`] holding the ready [`QueryPipeline`].
//! Every failure after the connect attempt tears down what was acquired
//! (release, then disconnect) before the error is returned, and
//! [`ServingContext::shutdown`] does the same on normal exit.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::embedder::Embedder;
use crate::error::RagError;
use crate::generation::Generator;
use crate::pipeline::{QueryOptions, QueryPipeline};
use crate::vector_store::{VectorIndex, VectorStore};

/// Prompt sent to the generation backend at startup.
pub const PREWARM_PROMPT: &str = "ping";

/// Bounded, fixed-interval retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Each wait is lengthened by a uniform random amount in `[0, jitter]`.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(5),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Time to wait before the next attempt.
    pub fn delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let fraction: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.interval + self.jitter.mul_f64(fraction)
    }
}

/// Everything a running server needs, plus what teardown must release.
pub struct ServingContext {
    pipeline: Arc<QueryPipeline>,
    index: VectorIndex,
}

impl ServingContext {
    pub fn pipeline(&self) -> Arc<QueryPipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Release the collection and disconnect from the store.
    pub async fn shutdown(self) {
        info!(collection = %self.index.name(), "Shutting down");
        teardown(self.index.store(), Some(&self.index)).await;
    }
}

/// Release (when loaded) and disconnect, logging rather than returning failures.
async fn teardown(store: &Arc<dyn VectorStore>, loaded: Option<&VectorIndex>) {
    if let Some(index) = loaded {
        if let Err(e) = index.release().await {
            warn!(collection = %index.name(), error = %e, "Failed to release collection");
        }
    }
    if let Err(e) = store.disconnect().await {
        warn!(endpoint = %store.endpoint(), error = %e, "Failed to disconnect");
    }
}

pub struct ReadinessGate {
    store: Arc<dyn VectorStore>,
    collection: String,
    policy: BackoffPolicy,
}

impl ReadinessGate {
    pub fn new(
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            policy,
        }
    }

    /// Run the startup protocol and build the serving pipeline.
    ///
    /// # Errors
    /// - a store error from connect, polling or load,
    /// - [`RagError::IndexMissing`] when the collection never appears.
    ///
    /// Pre-warm failures never block startup; they are only logged.
    pub async fn open(
        &self,
        embedder: Embedder,
        generator: Arc<dyn Generator>,
        options: QueryOptions,
    ) -> Result<ServingContext, RagError> {
        info!(endpoint = %self.store.endpoint(), "Connecting to vector store");
        if let Err(e) = self.store.connect().await {
            teardown(&self.store, None).await;
            return Err(e.into());
        }

        let index = VectorIndex::open(Arc::clone(&self.store), self.collection.clone());
        if let Err(e) = self.wait_for(&index).await {
            teardown(&self.store, None).await;
            return Err(e);
        }

        if let Err(e) = index.load().await {
            teardown(&self.store, Some(&index)).await;
            return Err(e.into());
        }
        info!(collection = %self.collection, "Loaded collection");

        info!("Pre-warming LLM runner");
        match generator.generate(PREWARM_PROMPT).await {
            Ok(_) => info!("LLM ready"),
            Err(e) if e.is_transient() => warn!(error = %e, "LLM pre-warm failed (continuing)"),
            Err(e) => error!(error = %e, "LLM pre-warm returned an unusable reply (continuing)"),
        }

        let pipeline = QueryPipeline::new(embedder, index.clone(), generator, options);
        Ok(ServingContext {
            pipeline: Arc::new(pipeline),
            index,
        })
    }

    /// Poll until the collection exists, sleeping between attempts.
    async fn wait_for(&self, index: &VectorIndex) -> Result<(), RagError> {
        let attempts = self.policy.attempts.max(1);
        for attempt in 1..=attempts {
            if index.exists().await? {
                return Ok(());
            }
            if attempt == attempts {
                break;
            }
            warn!(
                collection = %self.collection,
                "Collection not ready (try {attempt}/{attempts})"
            );
            tokio::time::sleep(self.policy.delay()).await;
        }
        Err(RagError::IndexMissing {
            name: self.collection.clone(),
            attempts,
        })
    }
}
