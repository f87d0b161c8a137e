//! Token-budgeted context assembly.
//!
//! Builds the context block handed to the prompt template from three
//! optional inputs, in fixed priority order:
//!
//! 1. the user profile,
//! 2. the conversation history,
//! 3. retrieved documents / result records.
//!
//! # Algorithm
//!
//! 1. Estimate tokens as `ceil(chars / 4)`. This is a heuristic, not a
//!    tokenizer; real counts vary by model.
//! 2. Filter profile and result objects down to an explicit field
//!    allow-list before serializing them.
//! 3. Reduce the history to the first message plus the most recent
//!    `max_messages - 1` messages.
//! 4. Append each non-empty section (with its separator) only if the running
//!    estimate stays `<= max_tokens`. A section that does not fit is skipped
//!    whole; later, smaller sections may still fit.
//!
//! Summing per-section estimates never undercounts the joined text, so the
//! final context never exceeds the budget.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{ChatMessage, SearchResult};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Profile fields allowed into the context by default.
pub const DEFAULT_PROFILE_FIELDS: &[&str] = &["name", "age", "language", "gender"];

/// Result fields allowed into the context by default.
pub const DEFAULT_RESULT_FIELDS: &[&str] = &[
    "id",
    "source",
    "title",
    "content",
    "score",
    "test_type",
    "result",
    "created_at",
];

const SECTION_SEPARATOR: &str = "\n\n";

/// Estimated token count of `text`: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Compression policy. Immutable per budgeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionConfig {
    pub max_tokens: usize,
    pub max_messages: usize,
    /// Target length, in characters, for summarized document content.
    pub summary_length: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2000,
            max_messages: 10,
            summary_length: 500,
        }
    }
}

/// Which section of the context a piece came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSection {
    Profile,
    History,
    Retrieved,
}

/// Inputs to [`ContextBudgeter::build`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextInput<'a> {
    pub profile: Option<&'a Value>,
    pub history: Option<&'a [ChatMessage]>,
    pub retrieved: Option<&'a [Value]>,
}

/// The assembled context and its accounting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetedContext {
    pub text: String,
    pub estimated_tokens: usize,
    pub included: Vec<ContextSection>,
    pub skipped: Vec<ContextSection>,
}

pub struct ContextBudgeter {
    config: CompressionConfig,
    profile_fields: Vec<String>,
    result_fields: Vec<String>,
}

impl ContextBudgeter {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            profile_fields: DEFAULT_PROFILE_FIELDS.iter().map(|f| f.to_string()).collect(),
            result_fields: DEFAULT_RESULT_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn with_profile_fields(mut self, fields: &[&str]) -> Self {
        self.profile_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_result_fields(mut self, fields: &[&str]) -> Self {
        self.result_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Keep the first message and the most recent `max_messages - 1`.
    pub fn compress_history(&self, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let max = self.config.max_messages.max(1);
        if history.len() <= max {
            return history.to_vec();
        }
        let tail_start = history.len() - (max - 1);
        std::iter::once(&history[0])
            .chain(history[tail_start..].iter())
            .cloned()
            .collect()
    }

    /// Convert search results into result records, summarizing long content
    /// down to `summary_length` characters.
    pub fn results_to_records(&self, results: &[SearchResult]) -> Vec<Value> {
        results
            .iter()
            .map(|r| {
                let mut record = Map::new();
                record.insert("id".into(), Value::String(r.id.clone()));
                record.insert("source".into(), Value::String(r.source.clone()));
                record.insert(
                    "content".into(),
                    Value::String(summarize(&r.content, self.config.summary_length)),
                );
                if let Some(title) = r.metadata.get("title") {
                    record.insert("title".into(), title.clone());
                }
                Value::Object(record)
            })
            .collect()
    }

    /// Assemble the context within `max_tokens` estimated tokens.
    pub fn build(&self, input: ContextInput<'_>, max_tokens: usize) -> BudgetedContext {
        let mut candidates: Vec<(ContextSection, String)> = Vec::with_capacity(3);

        if let Some(profile) = input.profile {
            let filtered = filter_fields(profile, &self.profile_fields);
            if !is_empty_value(&filtered) {
                candidates.push((
                    ContextSection::Profile,
                    format!("User profile:\n{}", to_compact_json(&filtered)),
                ));
            }
        }

        if let Some(history) = input.history {
            let compressed = self.compress_history(history);
            if !compressed.is_empty() {
                candidates.push((
                    ContextSection::History,
                    format!("Conversation history:\n{}", format_history(&compressed)),
                ));
            }
        }

        if let Some(retrieved) = input.retrieved {
            let lines: Vec<String> = retrieved
                .iter()
                .map(|record| filter_fields(record, &self.result_fields))
                .filter(|record| !is_empty_value(record))
                .map(|record| format!("- {}", to_compact_json(&record)))
                .collect();
            if !lines.is_empty() {
                candidates.push((
                    ContextSection::Retrieved,
                    format!("Relevant information:\n{}", lines.join("\n")),
                ));
            }
        }

        let mut text = String::new();
        let mut running = 0usize;
        let mut included = Vec::new();
        let mut skipped = Vec::new();

        for (section, body) in candidates {
            let piece = if text.is_empty() {
                body
            } else {
                format!("{SECTION_SEPARATOR}{body}")
            };
            let tokens = estimate_tokens(&piece);
            if running + tokens <= max_tokens {
                running += tokens;
                text.push_str(&piece);
                included.push(section);
            } else {
                skipped.push(section);
            }
        }

        BudgetedContext {
            estimated_tokens: estimate_tokens(&text),
            text,
            included,
            skipped,
        }
    }
}

impl Default for ContextBudgeter {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Render messages as `role: content` lines.
pub fn format_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep only `allowed` keys of a JSON object. Non-object values pass through.
pub fn filter_fields(value: &Value, allowed: &[String]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| allowed.iter().any(|a| a == *key))
                .map(|(key, v)| (key.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn to_compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

/// Shorten `text` to at most `target_len` characters.
///
/// Keeps as many whole sentences (ending in `.`, `!`, or `?`) as fit. If
/// not even the first sentence fits, falls back to a hard character cut.
pub fn summarize(text: &str, target_len: usize) -> String {
    if text.chars().count() <= target_len {
        return text.to_string();
    }

    let mut summary = String::new();
    let mut summary_len = 0usize;
    for sentence in split_sentences(text) {
        let sentence_len = sentence.chars().count();
        let added = if summary.is_empty() {
            sentence_len
        } else {
            sentence_len + 1
        };
        if summary_len + added > target_len {
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(sentence);
        summary_len += added;
    }

    if summary.is_empty() {
        text.chars().take(target_len).collect()
    } else {
        summary
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence);
                }
                start = end;
            }
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messages(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                ChatMessage::new(role, format!("m{i}"))
            })
            .collect()
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // Counts characters, not bytes.
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_compress_history_first_plus_recent() {
        let budgeter = ContextBudgeter::new(CompressionConfig {
            max_messages: 5,
            ..Default::default()
        });
        let history = messages(10);
        let compressed = budgeter.compress_history(&history);
        let contents: Vec<&str> = compressed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m6", "m7", "m8", "m9"]);
    }

    #[test]
    fn test_compress_history_short_untouched() {
        let budgeter = ContextBudgeter::default();
        let history = messages(3);
        assert_eq!(budgeter.compress_history(&history), history);
    }

    #[test]
    fn test_compress_history_single_slot_keeps_first() {
        let budgeter = ContextBudgeter::new(CompressionConfig {
            max_messages: 1,
            ..Default::default()
        });
        let compressed = budgeter.compress_history(&messages(4));
        assert_eq!(compressed.len(), 1);
        assert_eq!(compressed[0].content, "m0");
    }

    #[test]
    fn test_profile_filtered_to_allow_list() {
        let budgeter = ContextBudgeter::default();
        let profile = json!({
            "name": "Ada",
            "age": 41,
            "email": "ada@example.com",
            "password_hash": "secret"
        });
        let ctx = budgeter.build(
            ContextInput {
                profile: Some(&profile),
                ..Default::default()
            },
            1000,
        );
        assert!(ctx.text.contains("\"name\":\"Ada\""));
        assert!(ctx.text.contains("\"age\":41"));
        assert!(!ctx.text.contains("email"));
        assert!(!ctx.text.contains("secret"));
        assert_eq!(ctx.included, vec![ContextSection::Profile]);
    }

    #[test]
    fn test_sections_in_priority_order() {
        let budgeter = ContextBudgeter::default();
        let profile = json!({"name": "Ada"});
        let history = messages(2);
        let retrieved = vec![json!({"id": "doc-1", "content": "Myopia basics."})];
        let ctx = budgeter.build(
            ContextInput {
                profile: Some(&profile),
                history: Some(&history),
                retrieved: Some(&retrieved),
            },
            1000,
        );
        let p = ctx.text.find("User profile").unwrap();
        let h = ctx.text.find("Conversation history").unwrap();
        let r = ctx.text.find("Relevant information").unwrap();
        assert!(p < h && h < r);
        assert_eq!(
            ctx.included,
            vec![
                ContextSection::Profile,
                ContextSection::History,
                ContextSection::Retrieved
            ]
        );
    }

    #[test]
    fn test_overflowing_section_skipped_whole() {
        let budgeter = ContextBudgeter::default();
        let profile = json!({"name": "Ada"});
        let big = "x".repeat(4000);
        let retrieved = vec![json!({"content": big})];
        let history = messages(2);
        let ctx = budgeter.build(
            ContextInput {
                profile: Some(&profile),
                history: Some(&history),
                retrieved: Some(&retrieved),
            },
            50,
        );
        assert_eq!(
            ctx.included,
            vec![ContextSection::Profile, ContextSection::History]
        );
        assert_eq!(ctx.skipped, vec![ContextSection::Retrieved]);
        assert!(!ctx.text.contains("xxxx"));
    }

    #[test]
    fn test_never_exceeds_budget() {
        let budgeter = ContextBudgeter::new(CompressionConfig {
            max_messages: 4,
            ..Default::default()
        });
        let profile = json!({"name": "Grace", "age": 85, "language": "en"});
        let history: Vec<ChatMessage> = (0..12)
            .map(|i| ChatMessage::new("user", "word ".repeat(i * 3)))
            .collect();
        let retrieved: Vec<Value> = (0..6)
            .map(|i| json!({"id": format!("d{i}"), "content": "lorem ipsum ".repeat(i * 5)}))
            .collect();

        for max_tokens in [0, 1, 5, 10, 17, 33, 64, 100, 250, 1000] {
            let ctx = budgeter.build(
                ContextInput {
                    profile: Some(&profile),
                    history: Some(&history),
                    retrieved: Some(&retrieved),
                },
                max_tokens,
            );
            assert!(
                estimate_tokens(&ctx.text) <= max_tokens,
                "budget {max_tokens} exceeded: {}",
                estimate_tokens(&ctx.text)
            );
            assert_eq!(ctx.estimated_tokens, estimate_tokens(&ctx.text));
        }
    }

    #[test]
    fn test_empty_inputs_give_empty_context() {
        let budgeter = ContextBudgeter::default();
        let ctx = budgeter.build(ContextInput::default(), 100);
        assert!(ctx.text.is_empty());
        assert_eq!(ctx.estimated_tokens, 0);
    }

    #[test]
    fn test_summarize_keeps_whole_sentences() {
        let text = "First sentence. Second sentence is longer! Third one?";
        assert_eq!(summarize(text, 20), "First sentence.");
        assert_eq!(
            summarize(text, 43),
            "First sentence. Second sentence is longer!"
        );
        assert_eq!(summarize(text, 1000), text);
    }

    #[test]
    fn test_summarize_hard_truncates_without_boundary() {
        let text = "A single very long sentence without any early terminator.";
        assert_eq!(summarize(text, 10), "A single v");
    }

    #[test]
    fn test_summarize_ignores_inner_dots() {
        let text = "Version 1.5 shipped today. More later.";
        assert_eq!(summarize(text, 30), "Version 1.5 shipped today.");
    }

    #[test]
    fn test_results_to_records_summarizes_content() {
        let budgeter = ContextBudgeter::new(CompressionConfig {
            summary_length: 16,
            ..Default::default()
        });
        let result = SearchResult {
            id: "d1".into(),
            content: "Short bit. Then a much longer tail follows here.".into(),
            score: 1.0,
            source: "kb".into(),
            metadata: Default::default(),
        };
        let records = budgeter.results_to_records(&[result]);
        assert_eq!(records[0]["content"], "Short bit.");
        assert_eq!(records[0]["id"], "d1");
    }
}
