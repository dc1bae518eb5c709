//! # Agent Kiln CLI (`kiln`)
//!
//! Compiles a directory of documents into embedded GraphRAG databases and
//! serves them as a self-contained agent.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kiln init <name>` | Scaffold a new agent project |
//! | `kiln build` | Chunk, embed, and extract triples into `data/` |
//! | `kiln serve` | Serve REST + MCP + A2A on one port |
//! | `kiln version` | Print the version |
//!
//! Provider configuration resolves environment variables first, then
//! `~/.kiln/config.yaml` (see `--config`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use agent_kiln::{builder, config, scaffold, server};

/// Agent Kiln — compile documents into an embedded GraphRAG agent.
#[derive(Parser)]
#[command(
    name = "kiln",
    about = "Compile documents into embedded GraphRAG databases and serve them as an agent",
    version,
    long_about = "Agent Kiln reads documents from an agent project's data/ directory, builds a \
    vector index and a knowledge-graph triple store, and serves hybrid retrieval-augmented chat \
    behind OpenAI-compatible REST, MCP, and A2A facades on a single port."
)]
struct Cli {
    /// Path to the provider config file (default: ~/.kiln/config.yaml).
    /// Environment variables (LLM_*, EMBED_*, RERANK_*, PORT, AGENT_API_KEY)
    /// take priority over file values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new agent project directory.
    Init {
        /// Name for the new agent project.
        name: String,
    },

    /// Compile documents into the vector and graph databases.
    ///
    /// Reads documents from data/, chunks them, embeds chunks into the
    /// vector index, extracts knowledge-graph triples via the LLM, and
    /// updates agent.yaml with a generated tool description.
    Build {
        /// Path to the agent project directory.
        #[arg(long, short = 'd', default_value = ".")]
        dir: PathBuf,
    },

    /// Start the runtime server.
    ///
    /// Requires compiled databases in data/vectors/ and data/graph/.
    /// Exposes POST /v1/chat/completions, GET+POST /mcp, POST /rpc/agent,
    /// and GET /health.
    Serve {
        /// Path to the agent project directory.
        #[arg(long, short = 'd', default_value = ".")]
        dir: PathBuf,

        /// Path to the agent manifest (default: <dir>/agent.yaml).
        #[arg(long)]
        agent: Option<PathBuf>,
    },

    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { name } => {
            scaffold::scaffold_project(&name)?;
        }
        Commands::Build { dir } => {
            let cfg = config::load(cli.config.as_deref())?;
            builder::run_build(&dir, &cfg).await?;
        }
        Commands::Serve { dir, agent } => {
            let cfg = config::load(cli.config.as_deref())?;
            let agent_yaml = agent.unwrap_or_else(|| dir.join("agent.yaml"));
            server::run_server(&dir, &agent_yaml, cfg).await?;
        }
        Commands::Version => {
            println!("kiln {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
