//! # Context Relay CLI (`relay`)
//!
//! The `relay` binary starts the HTTP server and offers offline commands for
//! checking retrieval and prompt configuration.
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay serve` | Start the HTTP server |
//! | `relay search "<query>"` | Index the configured corpus and print ranked results |
//! | `relay prompts` | List registered prompt versions with their hashes |
//! | `relay render <name> --input "<text>"` | Render a prompt version |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context_relay::prompt::PromptContext;
use context_relay::{commands, config, server};

/// Context Relay: retrieval, context budgeting and prompt orchestration
/// in front of a generative-AI provider.
#[derive(Parser)]
#[command(
    name = "relay",
    about = "Context Relay: retrieval and prompt orchestration for generative-AI answers",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/relay.toml`. See `config/relay.example.toml`.
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    ///
    /// Binds to `[server].bind`, indexes `[corpus].path` if set, and serves
    /// search, prompt, context and chat endpoints.
    Serve,

    /// Search the configured corpus.
    ///
    /// Runs the same lexical + vector fusion as `GET /search`.
    Search {
        /// The search query string.
        query: String,

        /// Number of results to return (defaults to `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List registered prompt versions.
    Prompts,

    /// Render a prompt version with placeholder values.
    Render {
        /// Prompt name.
        name: String,

        /// Value for `{input}`.
        #[arg(long)]
        input: String,

        /// Prompt version (defaults to the latest registered).
        #[arg(long)]
        version: Option<String>,

        /// Value for `{language}`.
        #[arg(long)]
        language: Option<String>,

        /// Value for `{name}`.
        #[arg(long = "user-name")]
        user_name: Option<String>,

        /// Value for `{age}`.
        #[arg(long)]
        age: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Search { query, top_k } => {
            commands::run_search(&cfg, &query, top_k).await?;
        }
        Commands::Prompts => {
            commands::run_prompts(&cfg)?;
        }
        Commands::Render {
            name,
            input,
            version,
            language,
            user_name,
            age,
        } => {
            let context = PromptContext {
                language,
                age,
                name: user_name,
                conversation_history: None,
            };
            commands::run_render(&cfg, &name, &input, version.as_deref(), &context)?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
