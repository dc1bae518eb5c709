//! Build pipeline: documents → chunks → {vector index, triple graph} →
//! manifest update.
//!
//! Stage failures follow a deliberate policy: embedding failures (after
//! retry) abort the build, because the vector index must cover every chunk;
//! triple-extraction failures skip their batch with a warning; manifest
//! mutation failures are warnings, because the databases on disk are already
//! valid. Given identical inputs and identical upstream responses the
//! pipeline is deterministic — documents load in sorted order and every
//! batch boundary is a pure function of the chunk list.

use std::path::Path;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::warn;

use crate::chunker::{Chunk, ChunkOptions, Chunker};
use crate::config::{self, AppConfig};
use crate::embedder::Embedder;
use crate::error::{KilnError, Result};
use crate::graph::GraphStore;
use crate::llm::LlmClient;
use crate::manifest::AgentManifest;
use crate::reader;
use crate::vector::{VectorIndex, VectorRecord};

/// Chunks per sequential embedding batch.
const EMBED_BATCH_SIZE: usize = 20;

/// Attempts per sequential embedding batch; backoff doubles from one second.
const EMBED_MAX_ATTEMPTS: u32 = 5;

/// Chunks combined per triple-extraction call.
const EXTRACT_BATCH_SIZE: usize = 10;

/// Attempts per extraction batch before the batch is skipped.
const EXTRACT_MAX_ATTEMPTS: u32 = 3;

/// Summary of a completed build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub triples: usize,
}

/// Run the full build pipeline for the project at `dir`.
pub async fn run_build(dir: &Path, config: &AppConfig) -> Result<BuildReport> {
    config::validate_build(config)?;

    let manifest_path = dir.join("agent.yaml");
    if !manifest_path.exists() {
        return Err(KilnError::InvalidInput(
            "agent.yaml not found — run 'kiln init <name>' first".into(),
        ));
    }
    let data_dir = dir.join("data");
    if !data_dir.is_dir() {
        return Err(KilnError::InvalidInput(
            "data/ directory not found — run 'kiln init <name>' first".into(),
        ));
    }

    let mut manifest = AgentManifest::load(&manifest_path)?;

    // The manifest's declared dimension is the source of truth; the config
    // value only applies when the manifest is silent.
    let dimensions = if manifest.dimensions() > 0 {
        manifest.dimensions()
    } else {
        config.embedder.dimensions
    };
    if dimensions == 0 {
        return Err(KilnError::InvalidConfig(
            "embedding dimensions must be > 0 (set runtime.embedder.dimensions in agent.yaml)"
                .into(),
        ));
    }

    println!("Kiln Build Pipeline");
    println!("===================");
    println!("Embedding dimensions: {dimensions}");

    // Step 1: load documents
    println!("\n[1/5] Loading documents from data/...");
    let docs = reader::load_directory(&data_dir)?;
    if docs.is_empty() {
        return Err(KilnError::InvalidInput(
            "no supported documents found in data/ (add .md or .txt files)".into(),
        ));
    }
    println!("      Loaded {} document(s)", docs.len());
    for doc in &docs {
        println!("      - {}", doc.name);
    }

    // Step 2: chunk
    println!("\n[2/5] Chunking documents...");
    let opts = match manifest.runtime.model_token_limit {
        Some(limit) => ChunkOptions::from_max_tokens(limit),
        None => ChunkOptions::default(),
    };
    let chunker = Chunker::new(opts)?;
    let mut all_chunks: Vec<Chunk> = Vec::new();
    for doc in &docs {
        let chunks = chunker.split_by_sentence(&doc.content, &doc.name)?;
        all_chunks.extend(chunks);
    }
    println!("      Created {} chunk(s)", all_chunks.len());

    // Step 3: embed and index
    println!("\n[3/5] Building vector index (this may take a while)...");
    let embedder = Embedder::new(&config.embedder, dimensions)?;
    let mut vectors = VectorIndex::new(dimensions)?;
    let records = if manifest.runtime.embedder.parallel {
        embed_parallel(&embedder, &all_chunks).await?
    } else {
        embed_sequential(&embedder, &all_chunks).await?
    };
    vectors.add_many(records)?;
    vectors.persist(&data_dir.join("vectors")).await?;
    println!("      Indexed {} vectors", vectors.count());

    // Step 4: extract triples
    println!("\n[4/5] Extracting knowledge graph triples...");
    let llm = LlmClient::new(&config.llm)?;
    let mut graph = GraphStore::new();
    for (batch_no, batch) in all_chunks.chunks(EXTRACT_BATCH_SIZE).enumerate() {
        let combined: String = batch
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        match extract_with_retry(&llm, &combined).await {
            Ok(triples) => {
                let added = triples.len();
                graph.add_many(triples);
                println!(
                    "      Processed batch {}: +{} triples (total: {})",
                    batch_no + 1,
                    added,
                    graph.count()
                );
            }
            Err(e) => {
                warn!("triple extraction failed for batch {}: {e}", batch_no + 1);
                continue;
            }
        }
    }
    graph.persist(&data_dir.join("graph")).await?;
    println!("      Knowledge graph: {} triples", graph.count());

    // Step 5: generate the tool description and update the manifest
    println!("\n[5/5] Generating MCP tool description...");
    let sample: String = all_chunks
        .iter()
        .take(3)
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let description = match llm.generate_tool_description(&manifest.slug(), &sample).await {
        Ok(desc) => desc,
        Err(e) => {
            warn!("tool description generation failed: {e}");
            manifest.default_tool_description()
        }
    };

    manifest.set_knowledge_tool(description);
    if let Err(e) = manifest.save(&manifest_path) {
        warn!("failed to update agent.yaml: {e}");
    } else {
        println!("      Updated agent.yaml with MCP tool description");
    }

    let report = BuildReport {
        documents: docs.len(),
        chunks: all_chunks.len(),
        vectors: vectors.count(),
        triples: graph.count(),
    };

    println!("\n===================");
    println!("Build complete!");
    println!("  Vector index: {} ({} vectors)", data_dir.join("vectors").display(), report.vectors);
    println!("  Graph store:  {} ({} triples)", data_dir.join("graph").display(), report.triples);

    Ok(report)
}

/// Embed every chunk concurrently with one worker per CPU, preserving chunk
/// order. Meant for local embedders where rate limits don't apply; any
/// failure aborts the build.
async fn embed_parallel(embedder: &Embedder, chunks: &[Chunk]) -> Result<Vec<VectorRecord>> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    let embeddings: Vec<Result<Vec<f32>>> = stream::iter(chunks)
        .map(|chunk| {
            let embedder = embedder.clone();
            async move { embedder.embed(&chunk.content).await }
        })
        .buffered(workers)
        .collect()
        .await;

    let mut records = Vec::with_capacity(chunks.len());
    for (chunk, embedding) in chunks.iter().zip(embeddings) {
        let embedding =
            embedding.map_err(|e| KilnError::UpstreamFailure(format!("embed {}: {e}", chunk.id)))?;
        records.push(to_record(chunk, embedding));
    }
    Ok(records)
}

/// Embed chunks in strictly serial batches with exponential backoff on rate
/// limits (1, 2, 4, 8, 16 seconds). Non-rate-limit failures abort the batch
/// and the build.
async fn embed_sequential(embedder: &Embedder, chunks: &[Chunk]) -> Result<Vec<VectorRecord>> {
    let mut records = Vec::with_capacity(chunks.len());

    for (batch_no, batch) in chunks.chunks(EMBED_BATCH_SIZE).enumerate() {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

        let mut outcome = Err(KilnError::UpstreamFailure("embedding not attempted".into()));
        for attempt in 0..EMBED_MAX_ATTEMPTS {
            outcome = embedder.embed_batch(&texts).await;
            match &outcome {
                Ok(_) => break,
                Err(KilnError::RateLimited(_)) => {
                    let backoff = Duration::from_secs(1 << attempt);
                    warn!(
                        "embed batch {} rate limited (attempt {}), backing off {:?}",
                        batch_no + 1,
                        attempt + 1,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(_) => break,
            }
        }

        let vectors =
            outcome.map_err(|e| KilnError::UpstreamFailure(format!("embed batch {}: {e}", batch_no + 1)))?;
        for (chunk, embedding) in batch.iter().zip(vectors) {
            records.push(to_record(chunk, embedding));
        }
    }

    Ok(records)
}

fn to_record(chunk: &Chunk, embedding: Vec<f32>) -> VectorRecord {
    VectorRecord {
        id: chunk.id.clone(),
        content: chunk.content.clone(),
        source: chunk.source.clone(),
        index: chunk.index,
        embedding,
    }
}

async fn extract_with_retry(llm: &LlmClient, text: &str) -> Result<Vec<crate::llm::Triple>> {
    let mut last = Err(KilnError::UpstreamFailure("extraction not attempted".into()));
    for _ in 0..EXTRACT_MAX_ATTEMPTS {
        last = llm.extract_triples(text).await;
        match &last {
            Ok(_) => return last,
            Err(e) if e.is_transient() => continue,
            Err(_) => return last,
        }
    }
    last
}
