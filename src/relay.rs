//! The orchestration service.
//!
//! [`Relay`] wires retrieval, context budgeting, prompt rendering and
//! generation into the request flow:
//!
//! ```text
//! ChatRequest ─▶ RankFusion ─▶ ContextBudgeter ─▶ PromptRegistry ─▶ Generator ─▶ TextStream
//! ```
//!
//! One `Relay` is built per process and shared by reference with every
//! request handler; it holds no global state.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use context_relay_core::audit::{self, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use context_relay_core::budget::{
    format_history, BudgetedContext, ContextBudgeter, ContextInput, ContextSection,
};
use context_relay_core::embedding::Embedder;
use context_relay_core::fusion::{FusionIndexReport, FusionWeights, RankFusion};
use context_relay_core::models::{ChatMessage, SearchDocument, SearchResult};
use context_relay_core::prompt::{
    PromptContext, PromptParameters, PromptRegistry, PromptVersion, RenderedPrompt,
};
use context_relay_core::stream::TextStream;
use context_relay_core::RelayError;

use crate::config::{Config, StreamingConfig};
use crate::embedding::create_embedder;
use crate::generator::{Generation, GenerationConfig, Generator};
use crate::streaming::paced_chunks;

/// Prompt used when a chat request does not name one.
pub const DEFAULT_PROMPT: &str = "chat";

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub input: String,
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default)]
    pub prompt_version: Option<String>,
    /// Free-form user profile; only allow-listed fields reach the prompt.
    #[serde(default)]
    pub profile: Option<Value>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// `false` selects a plain chunked body instead of server-sent events.
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            prompt: default_prompt(),
            prompt_version: None,
            profile: None,
            history: Vec::new(),
            top_k: None,
            stream: None,
        }
    }

    pub fn wants_events(&self) -> bool {
        self.stream != Some(false)
    }
}

/// Everything needed to call the generator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedChat {
    pub prompt: RenderedPrompt,
    pub parameters: PromptParameters,
    pub context: BudgetedContext,
    pub results: Vec<SearchResult>,
}

/// Body of `POST /context`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    #[serde(default)]
    pub profile: Option<Value>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Result records supplied by the caller.
    #[serde(default)]
    pub retrieved: Option<Vec<Value>>,
    /// Retrieve records for this query when `retrieved` is absent.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

pub struct Relay {
    fusion: Arc<RankFusion>,
    prompts: Arc<PromptRegistry>,
    budgeter: ContextBudgeter,
    generator: Arc<dyn Generator>,
    embedder: Option<Arc<dyn Embedder>>,
    audit: Arc<dyn AuditSink>,
    streaming: StreamingConfig,
    top_k: usize,
}

impl Relay {
    /// Build a relay from configuration with explicit collaborators.
    /// Registers every configured prompt version in file order.
    pub fn new(
        config: &Config,
        generator: Arc<dyn Generator>,
        embedder: Option<Arc<dyn Embedder>>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let fusion = Arc::new(RankFusion::default());
        let weights = config.fusion_weights()?;
        fusion.set_weights(weights.lexical, weights.vector)?;

        let prompts = Arc::new(PromptRegistry::new());
        for (name, entries) in &config.prompts {
            for entry in entries.versions() {
                prompts
                    .register(name, &entry.version, &entry.system, &entry.user, entry.parameters())
                    .with_context(|| format!("Failed to register prompt '{}'", name))?;
            }
        }

        Ok(Self {
            fusion,
            prompts,
            budgeter: ContextBudgeter::new(config.context.compression()),
            generator,
            embedder,
            audit,
            streaming: config.streaming.clone(),
            top_k: config.retrieval.top_k,
        })
    }

    /// Build a relay with the configured embedder and a tracing audit sink,
    /// then index the configured corpus, if any.
    pub async fn from_config(config: &Config, generator: Arc<dyn Generator>) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let relay = Self::new(config, generator, embedder, Arc::new(TracingAuditSink))?;

        if let Some(path) = &config.corpus.path {
            let documents = load_corpus(path)?;
            let report = relay.index(documents).await;
            tracing::info!(
                documents = report.documents,
                vectors = report.vectors.map(|v| v.indexed).unwrap_or(0),
                skipped = report.vectors.map(|v| v.skipped).unwrap_or(0),
                "corpus indexed"
            );
        }

        Ok(relay)
    }

    pub fn prompts(&self) -> &PromptRegistry {
        &self.prompts
    }

    pub fn weights(&self) -> FusionWeights {
        self.fusion.weights()
    }

    pub fn audit_sink(&self) -> &dyn AuditSink {
        self.audit.as_ref()
    }

    /// Replace the corpus of both rankers.
    pub async fn index(&self, documents: Vec<SearchDocument>) -> FusionIndexReport {
        self.fusion.index(documents, self.embedder.as_deref()).await
    }

    pub async fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<SearchResult>, RelayError> {
        if query.trim().is_empty() {
            return Err(RelayError::invalid_field("q", "must not be empty"));
        }
        let top_k = self.resolve_top_k(top_k)?;
        Ok(self.fusion.search(query, top_k, self.embedder.as_deref()).await)
    }

    pub fn get_prompt(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<PromptVersion, RelayError> {
        self.prompts.get(name, version)
    }

    pub fn render(
        &self,
        name: &str,
        input: &str,
        ctx: &PromptContext,
        version: Option<&str>,
    ) -> Result<RenderedPrompt, RelayError> {
        self.prompts.build(name, input, ctx, version)
    }

    /// Assemble a budgeted context, retrieving records for `query` when the
    /// caller did not supply any.
    pub async fn build_context(
        &self,
        request: &ContextRequest,
    ) -> Result<BudgetedContext, RelayError> {
        let max_tokens = request
            .max_tokens
            .unwrap_or(self.budgeter.config().max_tokens);

        let retrieved = match (&request.retrieved, &request.query) {
            (Some(records), _) => records.clone(),
            (None, Some(query)) if !query.trim().is_empty() => {
                let results = self.search(query, None).await?;
                self.budgeter.results_to_records(&results)
            }
            _ => Vec::new(),
        };

        Ok(self.budgeter.build(
            ContextInput {
                profile: request.profile.as_ref(),
                history: Some(&request.history),
                retrieved: Some(&retrieved),
            },
            max_tokens,
        ))
    }

    /// Retrieve, budget and render the prompt for one chat turn.
    pub async fn prepare(&self, request: &ChatRequest) -> Result<PreparedChat, RelayError> {
        if request.input.trim().is_empty() {
            return Err(RelayError::invalid_field("input", "must not be empty"));
        }
        if request.prompt.trim().is_empty() {
            return Err(RelayError::invalid_field("prompt", "must not be empty"));
        }
        let version = self
            .prompts
            .get(&request.prompt, request.prompt_version.as_deref())?;

        let results = self.search(&request.input, request.top_k).await?;
        let records = self.budgeter.results_to_records(&results);
        let context = self.budgeter.build(
            ContextInput {
                profile: request.profile.as_ref(),
                history: Some(&request.history),
                retrieved: Some(&records),
            },
            self.budgeter.config().max_tokens,
        );

        // A history section the budgeter dropped must not reach the model
        // through the template placeholder either.
        let compressed = if context.included.contains(&ContextSection::History) {
            self.budgeter.compress_history(&request.history)
        } else {
            Vec::new()
        };
        let prompt_ctx = prompt_context(request.profile.as_ref(), &compressed);
        let mut prompt = version.render(&request.input, &prompt_ctx, self.prompts.policy())?;
        if !context.text.is_empty() {
            prompt.system_prompt = format!("{}\n\n{}", prompt.system_prompt, context.text);
        }

        Ok(PreparedChat {
            prompt,
            parameters: version.parameters,
            context,
            results,
        })
    }

    /// Prepare and invoke the generator. A complete answer is replayed as
    /// paced fixed-size chunks; a streamed answer passes through.
    pub async fn answer(
        &self,
        request: &ChatRequest,
        client_key: &str,
    ) -> Result<TextStream, RelayError> {
        let prepared = match self.prepare(request).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let detail = Some(e.to_string());
                self.record_chat(client_key, &request.prompt, AuditOutcome::Failure, detail)
                    .await;
                return Err(e);
            }
        };
        let resource = format!("{}@{}", request.prompt, prepared.prompt.prompt_version);
        let config = GenerationConfig::from(prepared.parameters);

        match self.generator.generate(&prepared.prompt, &config).await {
            Ok(generation) => {
                self.record_chat(client_key, &resource, AuditOutcome::Success, None)
                    .await;
                Ok(match generation {
                    Generation::Text(text) => paced_chunks(
                        &text,
                        self.streaming.chunk_size,
                        Duration::from_millis(self.streaming.chunk_delay_ms),
                    ),
                    Generation::Stream(stream) => stream,
                })
            }
            Err(e) => {
                tracing::warn!(prompt = %resource, error = %e, "generation failed");
                let detail = Some(format!("{e:#}"));
                self.record_chat(client_key, &resource, AuditOutcome::Failure, detail)
                    .await;
                Err(RelayError::from(e))
            }
        }
    }

    async fn record_chat(
        &self,
        actor: &str,
        resource: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) {
        let mut event = AuditEvent::new("chat", actor, format!("prompt:{resource}"), outcome);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        audit::record(self.audit.as_ref(), event).await;
    }

    fn resolve_top_k(&self, top_k: Option<usize>) -> Result<usize, RelayError> {
        match top_k {
            Some(0) => Err(RelayError::invalid_field("topK", "must be >= 1")),
            Some(k) => Ok(k),
            None => Ok(self.top_k),
        }
    }
}

/// Placeholder values from the profile's `name`, `age` and `language`.
fn prompt_context(profile: Option<&Value>, history: &[ChatMessage]) -> PromptContext {
    fn field<'a>(profile: Option<&'a Value>, key: &str) -> Option<&'a Value> {
        profile.and_then(|p| p.get(key))
    }
    PromptContext {
        language: field(profile, "language").and_then(Value::as_str).map(str::to_string),
        age: field(profile, "age")
            .and_then(Value::as_u64)
            .and_then(|age| u32::try_from(age).ok()),
        name: field(profile, "name").and_then(Value::as_str).map(str::to_string),
        conversation_history: (!history.is_empty()).then(|| format_history(history)),
    }
}

/// Read a JSON array of documents.
pub fn load_corpus(path: &Path) -> Result<Vec<SearchDocument>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse corpus file: {}", path.display()))
}
