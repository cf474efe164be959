//! # Generation client
//!
//! Single-shot calls to an Ollama-compatible text-generation server:
//!
//! ```text
//! POST http://<host>:<port>/api/generate
//! {"model": "...", "prompt": "...", "stream": false,
//!  "options": {"temperature": 0.7, "num_predict": 256}}
//! ```
//!
//! The answer is the reply's `response` field with surrounding whitespace
//! trimmed. Every failure is a [`GenerationError`]; there is no retry here.
//! The query pipeline turns failures into degraded answers and the readiness
//! gate swallows transient ones while pre-warming.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::GenerationError;

/// Text-generation capability used by the query pipeline and for pre-warming.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: Option<String>,
}

/// HTTP client for `/api/generate`. Cheap to share; holds one connection pool.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl GenerationClient {
    pub fn new(config: &LlmConfig) -> Result<Self, GenerationError> {
        let timeout = Duration::from_secs_f64(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerationError::Connection {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: format!("http://{}:{}/api/generate", config.host, config.port),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn transport_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout {
                timeout_secs: self.timeout.as_secs_f64(),
            }
        } else if err.is_decode() {
            GenerationError::InvalidResponse {
                message: err.to_string(),
            }
        } else {
            GenerationError::Connection {
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };
        debug!(url = %self.url, model = %self.model, prompt_len = prompt.len(), "Generation request");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .map_err(|e| self.transport_error(e))?;
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e))?;
        let parsed: GenerateResponse =
            serde_json::from_slice(&bytes).map_err(|e| GenerationError::InvalidResponse {
                message: e.to_string(),
            })?;
        Ok(parsed.response.unwrap_or_default().trim().to_string())
    }
}
