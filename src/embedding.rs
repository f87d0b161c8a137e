//! HTTP embedding providers.
//!
//! Implements the core [`Embedder`] trait for remote backends:
//! - **OpenAI**: `POST {url}/v1/embeddings` with a bearer token from
//!   `OPENAI_API_KEY` (default URL `https://api.openai.com`).
//! - **Ollama**: `POST {url}/api/embed` (default URL `http://localhost:11434`).
//!
//! Use [`create_embedder`] to build the configured provider. It returns
//! `None` when `embedding.provider = "disabled"`, in which case rank fusion
//! runs lexical-only.
//!
//! ```rust,no_run
//! # use context_relay::config::EmbeddingConfig;
//! # use context_relay::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! assert!(create_embedder(&config).unwrap().is_none());
//! ```
//!
//! # Retry Strategy
//!
//! Both providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use context_relay_core::embedding::Embedder;

use crate::config::EmbeddingConfig;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Ollama,
}

impl Provider {
    fn label(self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Ollama => "Ollama",
        }
    }
}

/// An [`Embedder`] backed by a remote HTTP API.
pub struct HttpEmbedder {
    provider: Provider,
    model: String,
    dims: usize,
    url: String,
    api_key: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbedder {
    /// Create an OpenAI embedder.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn openai(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Self::build(Provider::OpenAi, config, OPENAI_DEFAULT_URL, Some(api_key))
    }

    /// Create an Ollama embedder. Requires Ollama to be running with the
    /// model pulled (e.g. `ollama pull nomic-embed-text`).
    pub fn ollama(config: &EmbeddingConfig) -> Result<Self> {
        Self::build(Provider::Ollama, config, OLLAMA_DEFAULT_URL, None)
    }

    fn build(
        provider: Provider,
        config: &EmbeddingConfig,
        default_url: &str,
        api_key: Option<String>,
    ) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            anyhow::anyhow!("embedding.model required for {} provider", provider.label())
        })?;
        let dims = config.dims.ok_or_else(|| {
            anyhow::anyhow!("embedding.dims required for {} provider", provider.label())
        })?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| default_url.to_string())
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            provider,
            model,
            dims,
            url,
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }

    fn endpoint(&self) -> String {
        match self.provider {
            Provider::OpenAi => format!("{}/v1/embeddings", self.url),
            Provider::Ollama => format!("{}/api/embed", self.url),
        }
    }

    /// Embed a batch of texts with retry/backoff. Vectors come back in
    /// input order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let label = self.provider.label();

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(provider = label, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut request = self
                .client
                .post(self.endpoint())
                .header("Content-Type", "application/json")
                .json(&body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("Bearer {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        let vectors = match self.provider {
                            Provider::OpenAi => parse_openai_response(&json)?,
                            Provider::Ollama => parse_ollama_response(&json)?,
                        };
                        if vectors.len() != texts.len() {
                            bail!(
                                "{} returned {} embeddings for {} inputs",
                                label,
                                vectors.len(),
                                texts.len()
                            );
                        }
                        return Ok(vectors);
                    }

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "{} API error {}: {}",
                            label,
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429): don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("{} API error {}: {}", label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "{} connection error ({}): {}",
                        label,
                        self.url,
                        e
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        if vector.len() != self.dims {
            bail!(
                "{} returned {} dimensions, expected {}",
                self.model,
                vector.len(),
                self.dims
            );
        }
        Ok(vector)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Build the configured embedder, or `None` when embeddings are disabled.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(HttpEmbedder::openai(config)?))),
        "ollama" => Ok(Some(Arc::new(HttpEmbedder::ollama(config)?))),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());

    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid Ollama response: embedding is not an array")
                })
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_openai_rejects_malformed() {
        assert!(parse_openai_response(&json!({"object": "list"})).is_err());
        assert!(parse_openai_response(&json!({"data": [{"index": 0}]})).is_err());
    }

    #[test]
    fn test_parse_ollama() {
        let json = json!({"embeddings": [[0.1, 0.2], [0.3, 0.4]]});
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!((vectors[1][0] - 0.3).abs() < 1e-6);
        assert!(parse_ollama_response(&json!({"embeddings": [1.0]})).is_err());
    }

    #[test]
    fn test_create_embedder_disabled() {
        assert!(create_embedder(&EmbeddingConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_ollama_requires_model_and_dims() {
        let mut config = EmbeddingConfig {
            provider: "ollama".to_string(),
            ..Default::default()
        };
        assert!(HttpEmbedder::ollama(&config).is_err());
        config.model = Some("nomic-embed-text".to_string());
        config.dims = Some(768);
        config.url = Some("http://ollama.internal:11434/".to_string());
        let embedder = HttpEmbedder::ollama(&config).unwrap();
        assert_eq!(embedder.endpoint(), "http://ollama.internal:11434/api/embed");
        assert_eq!(embedder.dims(), 768);
        assert_eq!(embedder.model_name(), "nomic-embed-text");
    }
}
