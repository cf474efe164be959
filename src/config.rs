//! This module loads and validates the service configuration.
//!
//! Configuration is layered with `figment`, later layers winning:
//!
//! 1. built-in defaults ([`RagConfig::default`]),
//! 2. a YAML file (`<config_dir>/config.yaml` unless a path is given),
//! 3. environment variables such as `MILVUS_HOST`, `TOP_K` or `LLM_MODEL`.
//!
//! # Examples
//!
//! ```no_run
//! use ravecraft::config::load_config;
//!
//! let config = load_config(None).unwrap();
//! println!("collection: {}", config.store.collection);
//! ```
//!
//! A minimal YAML file only names what differs from the defaults:
//!
//! ```yaml
//! store:
//!   host: milvus.internal
//! llm:
//!   model: llama3.1:70b
//!   timeout_secs: 120
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::chunker::Chunker;
use crate::error::ConfigError;
use crate::readiness::BackoffPolicy;

/// Environment variables and the config keys they override.
const ENV_KEYS: &[(&str, &str)] = &[
    ("MILVUS_HOST", "store.host"),
    ("MILVUS_PORT", "store.port"),
    ("COLLECTION", "store.collection"),
    ("STORE_BACKEND", "store.backend"),
    ("STORE_DATA_DIR", "store.data_dir"),
    ("EMBED_MODEL", "embedding.model"),
    ("CHUNK_SIZE", "embedding.chunk_size"),
    ("OVERLAP", "embedding.overlap"),
    ("TOP_K", "retrieval.top_k"),
    ("NPROBE", "retrieval.nprobe"),
    ("LLM_HOST", "llm.host"),
    ("LLM_PORT", "llm.port"),
    ("LLM_MODEL", "llm.model"),
    ("LLM_TIMEOUT", "llm.timeout_secs"),
    ("LLM_TEMPERATURE", "llm.temperature"),
    ("LLM_MAX_TOKENS", "llm.max_tokens"),
    ("BIND_ADDR", "server.bind_addr"),
];

/// Which [`VectorStore`](crate::vector_store::VectorStore) implementation to use.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Milvus,
    Local,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub host: String,
    pub port: u16,
    /// Collection (index) name.
    pub collection: String,
    /// Root directory for the local backend.
    pub data_dir: PathBuf,
    /// Bearer token for Milvus, if authentication is enabled.
    pub token: Option<String>,
    pub timeout_secs: f64,
    pub insert_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Milvus,
            host: "localhost".into(),
            port: 19530,
            collection: "ravecraft".into(),
            data_dir: PathBuf::from("index"),
            token: None,
            timeout_secs: 30.0,
            insert_batch_size: 512,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Hugging Face model id.
    pub model: String,
    pub revision: String,
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "sentence-transformers/all-MiniLM-L6-v2".into(),
            revision: "main".into(),
            chunk_size: 128,
            overlap: 64,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub nprobe: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            nprobe: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub host: String,
    pub port: u16,
    pub model: String,
    pub timeout_secs: f64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 11434,
            model: "llama3.1:8b".into(),
            timeout_secs: 60.0,
            temperature: 0.7,
            max_tokens: 256,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
        }
    }
}

/// Startup polling for the collection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReadinessConfig {
    pub attempts: u32,
    pub interval_secs: f64,
    /// Upper bound of the random delay added to each wait.
    pub jitter_secs: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_secs: 5.0,
            jitter_secs: 0.0,
        }
    }
}

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct RagConfig {
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub readiness: ReadinessConfig,
    /// YAML file overriding the prompt instructions.
    pub prompt_template: Option<PathBuf>,
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.into(),
    }
}

fn positive_secs(key: &'static str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(())
    } else {
        Err(invalid(key, format!("must be a positive number of seconds, got {secs}")))
    }
}

impl RagConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunker()?;
        if self.retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k", "must be at least 1"));
        }
        if self.retrieval.nprobe == 0 {
            return Err(invalid("retrieval.nprobe", "must be at least 1"));
        }
        if self.readiness.attempts == 0 {
            return Err(invalid("readiness.attempts", "must be at least 1"));
        }
        if self.store.insert_batch_size == 0 {
            return Err(invalid("store.insert_batch_size", "must be at least 1"));
        }
        crate::vector_store::validate_collection_name(&self.store.collection)
            .map_err(|e| invalid("store.collection", e.to_string()))?;
        positive_secs("llm.timeout_secs", self.llm.timeout_secs)?;
        positive_secs("store.timeout_secs", self.store.timeout_secs)?;
        if !self.readiness.interval_secs.is_finite() || self.readiness.interval_secs < 0.0 {
            return Err(invalid("readiness.interval_secs", "must not be negative"));
        }
        if !self.readiness.jitter_secs.is_finite() || self.readiness.jitter_secs < 0.0 {
            return Err(invalid("readiness.jitter_secs", "must not be negative"));
        }
        self.bind_addr()?;
        Ok(())
    }

    pub fn chunker(&self) -> Result<Chunker, ConfigError> {
        Chunker::new(self.embedding.chunk_size, self.embedding.overlap)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            attempts: self.readiness.attempts,
            interval: Duration::from_secs_f64(self.readiness.interval_secs),
            jitter: Duration::from_secs_f64(self.readiness.jitter_secs),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("server.bind_addr", e.to_string()))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.store.timeout_secs)
    }
}

fn env_provider() -> Env {
    Env::raw().filter_map(|key| {
        ENV_KEYS
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| (*path).into())
    })
}

/// The layered configuration before extraction, for callers that add layers.
pub fn figment(file: &Path) -> Figment {
    Figment::from(Serialized::defaults(RagConfig::default()))
        .merge(Yaml::file(file))
        .merge(env_provider())
}

/// Loads and validates the configuration.
///
/// With `file = None` the default `<config_dir>/config.yaml` is used when it
/// exists; an explicitly given file must exist.
///
/// # Errors
/// [`ConfigError::NotFound`] for a missing explicit file, [`ConfigError::Load`]
/// for malformed YAML or values of the wrong type, and any
/// [`RagConfig::validate`] failure.
pub fn load_config(file: Option<&Path>) -> Result<RagConfig, ConfigError> {
    let path = match file {
        Some(path) if !path.exists() => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Some(path) => path.to_path_buf(),
        None => crate::config_dir()?.join("config.yaml"),
    };
    debug!("Loading config from: {}", path.display());

    let config: RagConfig = figment(&path).extract()?;
    config.validate()?;
    Ok(config)
}

/// Write the default configuration as YAML to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let io_err = |e: std::io::Error| invalid("config file", format!("{}: {e}", path.display()));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let yaml = serde_yaml::to_string(&RagConfig::default())
        .map_err(|e| invalid("config file", e.to_string()))?;
    info!("Creating config file: {}", path.display());
    fs::write(path, yaml).map_err(io_err)
}
