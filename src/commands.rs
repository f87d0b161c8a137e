//! CLI commands that run against the configured corpus and prompts without
//! starting the server.

use anyhow::Result;
use std::sync::Arc;

use context_relay_core::audit::TracingAuditSink;
use context_relay_core::prompt::PromptContext;

use crate::config::Config;
use crate::generator::DisabledGenerator;
use crate::relay::Relay;

/// Index the configured corpus and print the fused ranking for `query`.
pub async fn run_search(config: &Config, query: &str, top_k: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let relay = Relay::from_config(config, Arc::new(DisabledGenerator)).await?;
    let results = relay.search(query, top_k).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    let weights = relay.weights();
    println!(
        "weights: lexical {:.2} / vector {:.2}\n",
        weights.lexical, weights.vector
    );
    for (i, result) in results.iter().enumerate() {
        let title = result
            .metadata
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or("(untitled)");
        println!("{}. [{:.4}] {} / {}", i + 1, result.score, result.source, title);
        println!(
            "    excerpt: \"{}\"",
            excerpt(&result.content, 160).replace('\n', " ").trim()
        );
        println!("    id: {}", result.id);
        println!();
    }

    Ok(())
}

/// Print every registered prompt version.
pub fn run_prompts(config: &Config) -> Result<()> {
    let relay = offline_relay(config)?;
    let prompts = relay.prompts().list();

    if prompts.is_empty() {
        println!("No prompts configured.");
        return Ok(());
    }

    for prompt in prompts {
        println!("{}@{}", prompt.name, prompt.version);
        println!("    hash: {}", prompt.hash);
        println!("    created: {}", prompt.created_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(t) = prompt.parameters.temperature {
            println!("    temperature: {}", t);
        }
        if let Some(m) = prompt.parameters.max_tokens {
            println!("    max_tokens: {}", m);
        }
    }

    Ok(())
}

/// Render one prompt version for `input` and print both halves.
pub fn run_render(
    config: &Config,
    name: &str,
    input: &str,
    version: Option<&str>,
    context: &PromptContext,
) -> Result<()> {
    let relay = offline_relay(config)?;
    let rendered = relay.render(name, input, context, version)?;

    println!("--- {}@{} ({}) ---", name, rendered.prompt_version, rendered.hash);
    println!("[system]");
    println!("{}", rendered.system_prompt);
    println!();
    println!("[user]");
    println!("{}", rendered.user_prompt);

    Ok(())
}

fn offline_relay(config: &Config) -> Result<Relay> {
    Relay::new(
        config,
        Arc::new(DisabledGenerator),
        None,
        Arc::new(TracingAuditSink),
    )
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
