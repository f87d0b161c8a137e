//! # Context Relay Core
//!
//! Runtime-agnostic logic for Context Relay: document models, lexical and
//! vector ranking, rank fusion, token-budgeted context assembly, the prompt
//! registry, the streaming state machine, fixed-window rate limiting and the
//! edge-local response cache.
//!
//! This crate contains no tokio, axum, filesystem I/O, or other
//! server-only dependencies. Every suspension point (embedding calls,
//! key-value store access) goes through an async trait so the calling
//! application decides the runtime.
//!
//! ## Request flow
//!
//! ```text
//! request ─▶ FixedWindowLimiter ─▶ ResponseCache ─┬─▶ hit: replay
//!                                                 ▼
//!                     LexicalRanker ─┐      ContextBudgeter ◀── RankFusion
//!                     VectorRanker ──┴──────────▶   │
//!                                                   ▼
//!                                           PromptRegistry ─▶ generator
//!                                                   │
//!                                                   ▼
//!                                             EventStream ─▶ client
//! ```

pub mod audit;
pub mod budget;
pub mod cache;
pub mod clock;
pub mod embedding;
pub mod error;
pub mod fusion;
pub mod lexical;
pub mod models;
pub mod prompt;
pub mod rate_limit;
pub mod store;
pub mod stream;
pub mod vector;

pub use error::RelayError;
