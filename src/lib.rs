//! # Context Relay
//!
//! A retrieval and prompt orchestration layer that sits in front of a
//! generative-AI provider.
//!
//! Each chat turn retrieves supporting records with a fused lexical (BM25)
//! and vector ranking, assembles a token-budgeted context from the user
//! profile, conversation history and those records, renders a versioned
//! prompt, and relays the provider's answer back as an incremental stream.
//! A fixed-window rate limiter and a GET response cache share one
//! key-value store; security-relevant actions go to an audit sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │  Corpus  │──▶│ RankFusion │──▶│   Context    │──▶│  Prompt   │
//! │  (JSON)  │   │ BM25+Vector│   │   Budgeter   │   │ Registry  │
//! └──────────┘   └────────────┘   └──────────────┘   └─────┬─────┘
//!                                                          ▼
//!                ┌────────────┐   ┌──────────────┐   ┌───────────┐
//!  client ◀──────│ SSE / text │◀──│ TextStream   │◀──│ Generator │
//!                └────────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! The algorithms live in the `context-relay-core` crate and are re-exported
//! here; this crate adds configuration, HTTP embedders, the generation seam
//! and the axum server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | OpenAI / Ollama HTTP embedders |
//! | [`generator`] | Generation provider seam |
//! | [`relay`] | Request orchestration |
//! | [`streaming`] | SSE and chunked text framing |
//! | [`server`] | HTTP server |
//! | [`commands`] | Offline CLI commands |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod generator;
pub mod relay;
pub mod server;
pub mod streaming;

pub use context_relay_core::{
    audit, budget, cache, clock, fusion, lexical, models, prompt, rate_limit, store, stream,
    vector, RelayError,
};
