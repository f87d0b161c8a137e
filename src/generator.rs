//! The generation capability seam.
//!
//! The raw call to a generative-AI provider lives outside this crate. A
//! [`Generator`] receives the rendered prompt and per-version parameters and
//! returns either a complete text or a stream of text increments.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use context_relay_core::prompt::{PromptParameters, RenderedPrompt};
use context_relay_core::stream::TextStream;

/// Model parameters for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl From<PromptParameters> for GenerationConfig {
    fn from(params: PromptParameters) -> Self {
        Self {
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        }
    }
}

/// What a provider produced.
pub enum Generation {
    /// A complete answer, replayed to the client in fixed-size chunks.
    Text(String),
    /// Increments relayed as they arrive.
    Stream(TextStream),
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &RenderedPrompt,
        config: &GenerationConfig,
    ) -> Result<Generation>;
}

/// Used when no provider is wired in. Every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn generate(
        &self,
        _prompt: &RenderedPrompt,
        _config: &GenerationConfig,
    ) -> Result<Generation> {
        anyhow::bail!("generation provider not configured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_generator_errors() {
        let prompt = RenderedPrompt {
            system_prompt: "s".into(),
            user_prompt: "u".into(),
            prompt_version: "1".into(),
            hash: "h".into(),
        };
        let err = DisabledGenerator
            .generate(&prompt, &GenerationConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not configured"));
    }

    #[test]
    fn test_config_from_prompt_parameters() {
        let config = GenerationConfig::from(PromptParameters {
            temperature: Some(0.4),
            max_tokens: Some(512),
        });
        assert_eq!(config.temperature, Some(0.4));
        assert_eq!(config.max_tokens, Some(512));
    }
}
