//! Configuration parsing and validation.
//!
//! Context Relay is configured via a TOML file (default: `config/relay.toml`).
//! Only `[server]` is required; every other section falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:7450"
//!
//! [retrieval]
//! top_k = 5
//! lexical_weight = 0.3
//! vector_weight = 0.7
//!
//! [context]
//! max_tokens = 2000
//! max_messages = 10
//! summary_length = 500
//!
//! [rate_limit]
//! max_requests = 60
//! window_ms = 60000
//!
//! [cache]
//! ttl_secs = 60
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [corpus]
//! path = "./data/corpus.json"
//!
//! [prompts.chat]
//! version = "1.0.0"
//! system = "You are a helpful eye-care assistant. Answer in {language}."
//! user = "{input}"
//! ```
//!
//! A prompt may also be given as an array of tables (`[[prompts.chat]]`) to
//! register several versions in order; the last one becomes "latest".

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use context_relay_core::budget::CompressionConfig;
use context_relay_core::fusion::FusionWeights;
use context_relay_core::prompt::PromptParameters;
use context_relay_core::rate_limit::RateLimitConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub prompts: BTreeMap<String, PromptEntries>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            lexical_weight: default_lexical_weight(),
            vector_weight: default_vector_weight(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_vector_weight() -> f64 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_summary_length")]
    pub summary_length: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            max_messages: default_max_messages(),
            summary_length: default_summary_length(),
        }
    }
}

impl ContextConfig {
    pub fn compression(&self) -> CompressionConfig {
        CompressionConfig {
            max_tokens: self.max_tokens,
            max_messages: self.max_messages,
            summary_length: self.summary_length,
        }
    }
}

fn default_max_tokens() -> usize {
    2000
}
fn default_max_messages() -> usize {
    10
}
fn default_summary_length() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Request header holding the client identity.
    #[serde(default = "default_key_header")]
    pub key_header: String,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_ms: default_window_ms(),
            key_header: default_key_header(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RateLimitSettings {
    pub fn limiter_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_requests() -> u32 {
    60
}
fn default_window_ms() -> u64 {
    60_000
}
fn default_key_header() -> String {
    "cf-connecting-ip".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    /// Characters per chunk when replaying a complete answer.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

fn default_chunk_size() -> usize {
    32
}
fn default_chunk_delay_ms() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override. Defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CorpusConfig {
    /// JSON array of documents indexed at startup.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    pub version: String,
    pub system: String,
    pub user: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl PromptConfig {
    pub fn parameters(&self) -> PromptParameters {
        PromptParameters {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// One prompt version (`[prompts.x]`) or several in registration order
/// (`[[prompts.x]]`).
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum PromptEntries {
    One(PromptConfig),
    Many(Vec<PromptConfig>),
}

impl PromptEntries {
    pub fn versions(&self) -> &[PromptConfig] {
        match self {
            PromptEntries::One(one) => std::slice::from_ref(one),
            PromptEntries::Many(many) => many,
        }
    }
}

impl Config {
    /// Parse and validate configuration text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Effective fusion weights, normalized to sum to one.
    pub fn fusion_weights(&self) -> Result<FusionWeights> {
        FusionWeights::normalized(self.retrieval.lexical_weight, self.retrieval.vector_weight)
            .map_err(|e| anyhow::anyhow!("retrieval weights invalid: {e}"))
    }

    fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }

        if self.retrieval.top_k < 1 {
            bail!("retrieval.top_k must be >= 1");
        }
        self.fusion_weights()?;

        if self.context.max_tokens < 1 {
            bail!("context.max_tokens must be >= 1");
        }
        if self.context.max_messages < 1 {
            bail!("context.max_messages must be >= 1");
        }

        if self.rate_limit.max_requests < 1 {
            bail!("rate_limit.max_requests must be >= 1");
        }
        if self.rate_limit.window_ms < 1 {
            bail!("rate_limit.window_ms must be >= 1");
        }

        if self.streaming.chunk_size < 1 {
            bail!("streaming.chunk_size must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        for (name, entries) in &self.prompts {
            if entries.versions().is_empty() {
                bail!("prompts.{name} must define at least one version");
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml_str("[server]\nbind = \"127.0.0.1:7450\"\n").unwrap();
        assert_eq!(config.server.max_body_bytes, 1024 * 1024);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.context.max_tokens, 2000);
        assert_eq!(config.context.max_messages, 10);
        assert_eq!(config.context.summary_length, 500);
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.rate_limit.window_ms, 60_000);
        assert_eq!(config.rate_limit.key_header, "cf-connecting-ip");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.streaming.chunk_size, 32);
        assert!(!config.embedding.is_enabled());
        assert!(config.prompts.is_empty());
        let w = config.fusion_weights().unwrap();
        assert!((w.lexical - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_weights_are_normalized() {
        let config = Config::from_toml_str(
            "[server]\nbind = \"x\"\n[retrieval]\nlexical_weight = 2.0\nvector_weight = 8.0\n",
        )
        .unwrap();
        let w = config.fusion_weights().unwrap();
        assert!((w.lexical - 0.2).abs() < 1e-12);
        assert!((w.vector - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_prompt_single_and_many_versions() {
        let config = Config::from_toml_str(
            r#"
[server]
bind = "x"

[prompts.chat]
version = "1.0.0"
system = "s"
user = "{input}"
temperature = 0.2

[[prompts.triage]]
version = "1"
system = "a"
user = "b"

[[prompts.triage]]
version = "2"
system = "c"
user = "d"
max_tokens = 256
"#,
        )
        .unwrap();
        assert_eq!(config.prompts["chat"].versions().len(), 1);
        assert_eq!(
            config.prompts["chat"].versions()[0].parameters().temperature,
            Some(0.2)
        );
        let triage = config.prompts["triage"].versions();
        assert_eq!(triage.len(), 2);
        assert_eq!(triage[1].version, "2");
        assert_eq!(triage[1].max_tokens, Some(256));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let cases = [
            "[server]\nbind = \"x\"\n[retrieval]\ntop_k = 0\n",
            "[server]\nbind = \"x\"\n[retrieval]\nlexical_weight = 0.0\nvector_weight = 0.0\n",
            "[server]\nbind = \"x\"\n[retrieval]\nlexical_weight = -1.0\n",
            "[server]\nbind = \"x\"\n[context]\nmax_tokens = 0\n",
            "[server]\nbind = \"x\"\n[context]\nmax_messages = 0\n",
            "[server]\nbind = \"x\"\n[rate_limit]\nmax_requests = 0\n",
            "[server]\nbind = \"x\"\n[rate_limit]\nwindow_ms = 0\n",
            "[server]\nbind = \"x\"\n[streaming]\nchunk_size = 0\n",
            "[server]\nbind = \"x\"\n[embedding]\nprovider = \"magic\"\n",
            "[server]\nbind = \"x\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n",
            "[server]\nbind = \"x\"\n[embedding]\nprovider = \"ollama\"\ndims = 8\n",
            "[retrieval]\ntop_k = 3\n",
        ];
        for case in cases {
            assert!(Config::from_toml_str(case).is_err(), "accepted: {case}");
        }
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_toml_str(include_str!("../config/relay.example.toml")).unwrap();
        assert_eq!(config.prompts["chat"].versions().len(), 2);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[server]\nbind = \"0.0.0.0:8080\"\n[cache]\nenabled = false\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert!(!config.cache.enabled);

        let err = load_config(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
