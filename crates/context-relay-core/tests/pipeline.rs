use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use context_relay_core::budget::{estimate_tokens, CompressionConfig, ContextBudgeter, ContextInput};
use context_relay_core::cache::{cache_key, is_cacheable, CachedResponse, ResponseCache};
use context_relay_core::clock::ManualClock;
use context_relay_core::embedding::Embedder;
use context_relay_core::fusion::RankFusion;
use context_relay_core::models::{ChatMessage, SearchDocument};
use context_relay_core::prompt::{PromptContext, PromptParameters, PromptRegistry};
use context_relay_core::rate_limit::{FixedWindowLimiter, RateLimitConfig};
use context_relay_core::store::memory::InMemoryKvStore;
use context_relay_core::stream::{slice_text, text_stream, EventStream, StreamEvent};
use futures::StreamExt;
use serde_json::json;

/// Hashes each lower-cased word into one of 16 buckets.
struct BagOfWordsEmbedder;

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; 16];
        for word in text.to_lowercase().split_whitespace() {
            let bucket = word.bytes().fold(0usize, |acc, b| (acc * 31 + b as usize) % 16);
            v[bucket] += 1.0;
        }
        Ok(v)
    }

    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    fn dims(&self) -> usize {
        16
    }
}

fn eye_corpus() -> Vec<SearchDocument> {
    vec![
        SearchDocument::new(
            "myopia",
            "Myopia makes distant objects blurry. Myopia treatment options include glasses, contact lenses, atropine drops and refractive surgery.",
            "eye-kb",
        )
        .with_metadata("title", json!("Myopia")),
        SearchDocument::new(
            "astigmatism",
            "Astigmatism comes from an irregular cornea and blurs vision at all distances. Toric lenses correct it.",
            "eye-kb",
        )
        .with_metadata("title", json!("Astigmatism")),
        SearchDocument::new(
            "cataract",
            "A cataract clouds the natural lens. Surgery replaces the clouded lens with an artificial one.",
            "eye-kb",
        )
        .with_metadata("title", json!("Cataract")),
    ]
}

#[tokio::test]
async fn test_myopia_treatment_lexical_only() {
    let fusion = RankFusion::default();
    fusion.index(eye_corpus(), None).await;

    let results = fusion.search("myopia treatment", 2, None).await;
    assert!(!results.is_empty());
    assert!(results.len() <= 2);
    assert_eq!(results[0].id, "myopia");
}

#[tokio::test]
async fn test_myopia_treatment_hybrid() {
    let fusion = RankFusion::default();
    let embed = BagOfWordsEmbedder;
    let report = fusion.index(eye_corpus(), Some(&embed)).await;
    assert_eq!(report.documents, 3);
    assert_eq!(report.vectors.map(|v| v.indexed), Some(3));

    let results = fusion.search("myopia treatment", 2, Some(&embed)).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "myopia");
    assert!(results[0].score >= results[1].score);
}

#[tokio::test]
async fn test_retrieval_context_and_prompt() {
    let fusion = RankFusion::default();
    fusion.index(eye_corpus(), None).await;
    let results = fusion.search("myopia treatment", 2, None).await;

    let budgeter = ContextBudgeter::new(CompressionConfig {
        max_tokens: 400,
        max_messages: 3,
        summary_length: 60,
    });
    let records = budgeter.results_to_records(&results);
    let history: Vec<ChatMessage> = (0..6)
        .map(|i| ChatMessage::new("user", format!("question {i}")))
        .collect();
    let profile = json!({"name": "Ana", "age": 12, "email": "ana@example.com"});
    let context = budgeter.build(
        ContextInput {
            profile: Some(&profile),
            history: Some(&history),
            retrieved: Some(&records),
        },
        400,
    );
    assert!(estimate_tokens(&context.text) <= 400);
    assert!(context.text.contains("question 0"));
    assert!(!context.text.contains("question 2"));
    assert!(context.text.contains("question 5"));
    assert!(context.text.contains("myopia"));
    assert!(!context.text.contains("ana@example.com"));

    let registry = PromptRegistry::new();
    registry
        .register(
            "eye_chat",
            "1.0.0",
            "Answer in {language}.",
            "{name} asks: {input}",
            PromptParameters::default(),
        )
        .unwrap();
    let rendered = registry
        .build(
            "eye_chat",
            "How is myopia treated?",
            &PromptContext {
                name: Some("Ana".into()),
                ..Default::default()
            },
            None,
        )
        .unwrap();
    assert_eq!(rendered.system_prompt, "Answer in en.");
    assert_eq!(rendered.user_prompt, "Ana asks: How is myopia treated?");
}

#[tokio::test]
async fn test_chunked_answer_round_trips_through_event_stream() {
    let answer = "Glasses or contact lenses correct most myopia.";
    let frames: Vec<String> = EventStream::new(text_stream(slice_text(answer, 8)))
        .map(|event| event.sse_frame())
        .collect()
        .await;
    assert_eq!(frames.last().map(String::as_str), Some("data: {\"done\":true}\n\n"));
    assert_eq!(frames.len(), answer.chars().count().div_ceil(8) + 1);

    let events: Vec<StreamEvent> = EventStream::new(text_stream(slice_text(answer, 8)))
        .collect()
        .await;
    let rebuilt: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk(c) => Some(c.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(rebuilt, answer);
}

#[tokio::test]
async fn test_limiter_and_cache_share_one_store() {
    let clock = Arc::new(ManualClock::new(0));
    let store = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
    let limiter = FixedWindowLimiter::new(
        store.clone(),
        clock.clone(),
        RateLimitConfig {
            max_requests: 3,
            window_ms: 60_000,
        },
    );
    let cache = ResponseCache::new(store.clone(), Duration::from_secs(60));

    let mut handler_calls = 0;
    for _ in 0..3 {
        assert!(limiter.admit("1.2.3.4").await.allowed);
        let key = cache_key("GET", "/search", Some("top_k=2&q=myopia"));
        if cache.get(&key).await.is_none() {
            handler_calls += 1;
            let response = CachedResponse {
                status: 200,
                headers: Vec::new(),
                body: b"[]".to_vec(),
            };
            if is_cacheable("GET", response.status) {
                cache.set(&key, &response).await;
            }
        }
    }
    assert_eq!(handler_calls, 1);

    let rejected = limiter.admit("1.2.3.4").await;
    assert!(!rejected.allowed);
    assert!(rejected.retry_after_secs.unwrap() > 0);

    clock.advance(60_001);
    assert!(cache.get(&cache_key("GET", "/search", Some("q=myopia&top_k=2"))).await.is_none());
    let fresh = limiter.admit("1.2.3.4").await;
    assert!(fresh.allowed);
    assert_eq!(fresh.count, 1);

    // Both the rate-limit entry written before the reset and the cache entry are gone.
    assert!(limiter.sweep().await >= 1);
}
