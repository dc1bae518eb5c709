//! # Agent Kiln
//!
//! **Compile documents into an embedded GraphRAG agent.**
//!
//! Agent Kiln is a two-phase knowledge compiler. The build phase ingests a
//! directory of documents and produces two on-disk databases — a dense
//! vector index and a knowledge-graph triple store — plus an updated agent
//! manifest. The serve phase loads those databases and answers questions
//! through hybrid retrieval-augmented generation behind three protocol
//! facades sharing one port.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────────────┐   ┌───────────────────┐
//! │  data/    │──▶│  build pipeline     │──▶│ data/vectors/      │
//! │ .md .txt  │   │ chunk→embed→extract │   │ data/graph/        │
//! └───────────┘   └────────────────────┘   └─────────┬─────────┘
//!                                                    │
//!                       ┌────────────────────────────┤
//!                       ▼                            ▼
//!                ┌─────────────┐             ┌──────────────┐
//!                │ hybrid       │◀───────────│ HTTP runtime  │
//!                │ retrieval    │            │ REST/MCP/A2A  │
//!                └─────────────┘             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`chunker`] | Sentence-aware overlapping text chunker |
//! | [`reader`] | Document loading from the project data directory |
//! | [`embedder`] | OpenAI-compatible embeddings client |
//! | [`llm`] | Chat completions client: extraction, descriptions, streaming chat |
//! | [`reranker`] | Optional Cohere-compatible rerank client |
//! | [`vector`] | In-memory vector index with SQLite persistence |
//! | [`graph`] | Triple store with lexical token-overlap retrieval |
//! | [`builder`] | Build pipeline orchestration |
//! | [`retrieval`] | Hybrid search engine and context formatting |
//! | [`server`] | HTTP runtime: routing, middleware, REST chat |
//! | [`mcp`] | MCP JSON-RPC + SSE facade |
//! | [`a2a`] | A2A JSON-RPC facade |
//! | [`manifest`] | Agent manifest (`agent.yaml`) load/mutate/save |
//! | [`config`] | Provider configuration with env overrides |
//! | [`scaffold`] | `kiln init` project templating |
//! | [`error`] | Error taxonomy |

pub mod a2a;
pub mod builder;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod graph;
pub mod llm;
pub mod manifest;
pub mod mcp;
pub mod reader;
pub mod reranker;
pub mod retrieval;
pub mod scaffold;
pub mod server;
pub mod vector;
