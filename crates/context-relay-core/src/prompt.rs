//! Versioned, content-hashed prompt templates.
//!
//! A [`PromptRegistry`] maps a prompt name to an append-only list of
//! [`PromptVersion`]s. "Latest" is the last version registered, not the
//! highest semantic version.
//!
//! # Placeholders
//!
//! Templates reference variables as `{input}`, `{language}`, `{age}`,
//! `{name}` and `{conversation_history}`. Rendering makes a single pass over
//! the template, so substituted values are never re-scanned. Braces that do
//! not enclose an identifier (JSON examples, `{}`) are copied verbatim. An
//! identifier that is not a known variable is left in place and logged, or
//! rejected when the registry uses [`PlaceholderPolicy::Reject`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Generation parameters attached to a prompt version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptVersion {
    pub name: String,
    pub version: String,
    pub system_prompt: String,
    pub user_prompt_template: String,
    pub parameters: PromptParameters,
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex digest of `system_prompt + user_prompt_template`.
    pub hash: String,
}

/// A prompt ready for the generation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
    pub prompt_version: String,
    pub hash: String,
}

/// Per-request values for the non-input placeholders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptContext {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub conversation_history: Option<String>,
}

/// Language used when the request does not name one.
pub const DEFAULT_LANGUAGE: &str = "en";

/// The placeholders a template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplateVar {
    Input,
    Language,
    Age,
    Name,
    ConversationHistory,
}

impl TemplateVar {
    pub const ALL: [TemplateVar; 5] = [
        TemplateVar::Input,
        TemplateVar::Language,
        TemplateVar::Age,
        TemplateVar::Name,
        TemplateVar::ConversationHistory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateVar::Input => "input",
            TemplateVar::Language => "language",
            TemplateVar::Age => "age",
            TemplateVar::Name => "name",
            TemplateVar::ConversationHistory => "conversation_history",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|var| var.as_str() == name)
    }
}

impl fmt::Display for TemplateVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with `{identifier}` placeholders that are not [`TemplateVar`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaceholderPolicy {
    /// Leave the placeholder in the output and log a warning.
    #[default]
    Warn,
    /// Fail rendering with a validation error.
    Reject,
}

/// Typed variable map for one render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<TemplateVar, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, var: TemplateVar, value: impl Into<String>) -> &mut Self {
        self.values.insert(var, value.into());
        self
    }

    pub fn get(&self, var: TemplateVar) -> Option<&str> {
        self.values.get(&var).map(String::as_str)
    }

    /// Variables for `input` plus the request context. Absent context values
    /// render as empty strings, except `language`, which falls back to
    /// [`DEFAULT_LANGUAGE`].
    pub fn from_context(input: &str, ctx: &PromptContext) -> Self {
        let mut vars = Self::new();
        vars.set(TemplateVar::Input, input)
            .set(
                TemplateVar::Language,
                ctx.language.as_deref().unwrap_or(DEFAULT_LANGUAGE),
            )
            .set(
                TemplateVar::Age,
                ctx.age.map(|age| age.to_string()).unwrap_or_default(),
            )
            .set(TemplateVar::Name, ctx.name.clone().unwrap_or_default())
            .set(
                TemplateVar::ConversationHistory,
                ctx.conversation_history.clone().unwrap_or_default(),
            );
        vars
    }

    /// Substitute every known placeholder in one left-to-right pass.
    pub fn render(&self, template: &str, policy: PlaceholderPolicy) -> Result<String, RelayError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let ident = match after.find('}') {
                Some(close) if is_identifier(&after[..close]) => &after[..close],
                _ => {
                    out.push('{');
                    rest = after;
                    continue;
                }
            };

            match TemplateVar::parse(ident) {
                Some(var) => out.push_str(self.get(var).unwrap_or_default()),
                None => match policy {
                    PlaceholderPolicy::Warn => {
                        tracing::warn!(
                            placeholder = ident,
                            "unknown template placeholder left unresolved"
                        );
                        out.push('{');
                        out.push_str(ident);
                        out.push('}');
                    }
                    PlaceholderPolicy::Reject => {
                        return Err(RelayError::invalid_field(
                            "template",
                            format!("unknown placeholder {{{ident}}}"),
                        ));
                    }
                },
            }
            rest = &after[ident.len() + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// SHA-256 hex digest of `system_prompt + user_template`.
pub fn content_hash(system_prompt: &str, user_template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system_prompt.as_bytes());
    hasher.update(user_template.as_bytes());
    hex::encode(hasher.finalize())
}

impl PromptVersion {
    /// Render this version's system and user templates.
    pub fn render(
        &self,
        input: &str,
        ctx: &PromptContext,
        policy: PlaceholderPolicy,
    ) -> Result<RenderedPrompt, RelayError> {
        let vars = TemplateVars::from_context(input, ctx);
        Ok(RenderedPrompt {
            system_prompt: vars.render(&self.system_prompt, policy)?,
            user_prompt: vars.render(&self.user_prompt_template, policy)?,
            prompt_version: self.version.clone(),
            hash: self.hash.clone(),
        })
    }
}

/// Name → append-only version list.
#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<HashMap<String, Vec<PromptVersion>>>,
    policy: PlaceholderPolicy,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: PlaceholderPolicy) -> Self {
        Self {
            prompts: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> PlaceholderPolicy {
        self.policy
    }

    /// Append a version. The pair `(name, version)` must be new.
    pub fn register(
        &self,
        name: &str,
        version: &str,
        system_prompt: &str,
        user_prompt_template: &str,
        parameters: PromptParameters,
    ) -> Result<PromptVersion, RelayError> {
        if name.trim().is_empty() {
            return Err(RelayError::invalid_field("name", "must not be empty"));
        }
        if version.trim().is_empty() {
            return Err(RelayError::invalid_field("version", "must not be empty"));
        }

        let entry = PromptVersion {
            name: name.to_string(),
            version: version.to_string(),
            system_prompt: system_prompt.to_string(),
            user_prompt_template: user_prompt_template.to_string(),
            parameters,
            created_at: Utc::now(),
            hash: content_hash(system_prompt, user_prompt_template),
        };

        let mut prompts = self.prompts.write().unwrap_or_else(PoisonError::into_inner);
        let versions = prompts.entry(name.to_string()).or_default();
        if versions.iter().any(|v| v.version == version) {
            return Err(RelayError::invalid_field(
                "version",
                format!("prompt '{name}' already has version '{version}'"),
            ));
        }
        versions.push(entry.clone());
        tracing::debug!(prompt = name, version, hash = %entry.hash, "prompt registered");
        Ok(entry)
    }

    /// The requested version, or the last registered one when `version` is `None`.
    pub fn get(&self, name: &str, version: Option<&str>) -> Result<PromptVersion, RelayError> {
        let prompts = self.prompts.read().unwrap_or_else(PoisonError::into_inner);
        let versions = prompts
            .get(name)
            .ok_or_else(|| RelayError::not_found(format!("prompt '{name}' not found")))?;
        let found = match version {
            Some(version) => versions.iter().find(|v| v.version == version),
            None => versions.last(),
        };
        found.cloned().ok_or_else(|| {
            RelayError::not_found(format!(
                "prompt '{name}' version '{}' not found",
                version.unwrap_or("latest")
            ))
        })
    }

    /// Resolve a version and render it.
    pub fn build(
        &self,
        name: &str,
        input: &str,
        ctx: &PromptContext,
        version: Option<&str>,
    ) -> Result<RenderedPrompt, RelayError> {
        self.get(name, version)?.render(input, ctx, self.policy)
    }

    /// Every version, grouped by name (sorted) in registration order.
    pub fn list(&self) -> Vec<PromptVersion> {
        let prompts = self.prompts.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = prompts.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| prompts[name].iter().cloned())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prompts.read().unwrap_or_else(PoisonError::into_inner).contains_key(name)
    }
}
