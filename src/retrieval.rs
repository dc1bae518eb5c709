//! Hybrid search engine: vector similarity + graph facts, merged into one
//! structured context block.
//!
//! The two retrieval legs run concurrently. The vector leg (query embedding
//! + cosine scan) is load-bearing: its failure surfaces to the caller as
//! `RetrievalFailure`. The graph leg is best-effort — a failure or a miss of
//! the soft deadline just drops the facts section. When a reranker is
//! configured and at least two vector hits exist, hits are reordered by the
//! provider's relevance score; that score replaces the cosine similarity in
//! the context block without renormalization.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::embedder::Embedder;
use crate::error::{KilnError, Result};
use crate::graph::{format_facts, GraphFact, GraphStore};
use crate::reranker::Reranker;
use crate::vector::{VectorHit, VectorIndex};

/// Per-query knobs with the documented defaults.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalOptions {
    /// Maximum vector hits (V).
    pub vector_k: usize,
    /// Maximum graph facts (G).
    pub graph_k: usize,
    /// Soft deadline for the graph leg; on expiry facts are dropped while
    /// vector hits are still returned.
    pub graph_timeout: Duration,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            vector_k: 5,
            graph_k: 10,
            graph_timeout: Duration::from_secs(10),
        }
    }
}

/// Raw hybrid retrieval output, before formatting.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub vector_hits: Vec<VectorHit>,
    pub graph_facts: Vec<GraphFact>,
}

/// Shared retrieval engine; opened once at startup and shared read-only
/// across request handlers.
pub struct RetrievalEngine {
    vectors: Arc<VectorIndex>,
    graph: Arc<GraphStore>,
    embedder: Embedder,
    reranker: Option<Reranker>,
}

impl RetrievalEngine {
    pub fn new(
        vectors: Arc<VectorIndex>,
        graph: Arc<GraphStore>,
        embedder: Embedder,
        reranker: Option<Reranker>,
    ) -> Self {
        Self {
            vectors,
            graph,
            embedder,
            reranker,
        }
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.count()
    }

    pub fn triple_count(&self) -> usize {
        self.graph.count()
    }

    pub fn reranker_enabled(&self) -> bool {
        self.reranker.is_some()
    }

    /// Run both retrieval legs and return raw hits.
    pub async fn retrieve(&self, query: &str, opts: RetrievalOptions) -> Result<Retrieval> {
        let query = query.trim();
        if query.is_empty() {
            return Err(KilnError::InvalidInput("query cannot be empty".into()));
        }

        let vector_leg = async {
            let embedding = self
                .embedder
                .embed(query)
                .await
                .map_err(|e| KilnError::RetrievalFailure(format!("embed query: {e}")))?;
            self.vectors
                .query(&embedding, opts.vector_k)
                .map_err(|e| KilnError::RetrievalFailure(format!("vector query: {e}")))
        };

        let graph_leg = {
            let graph = Arc::clone(&self.graph);
            let query = query.to_string();
            let k = opts.graph_k;
            async move {
                tokio::time::timeout(
                    opts.graph_timeout,
                    tokio::task::spawn_blocking(move || graph.search(&query, k)),
                )
                .await
            }
        };

        let (vector_result, graph_result) = tokio::join!(vector_leg, graph_leg);

        let mut vector_hits = vector_result?;
        let graph_facts = match graph_result {
            Ok(Ok(facts)) => facts,
            Ok(Err(e)) => {
                warn!("graph search failed (non-fatal): {e}");
                Vec::new()
            }
            Err(_) => {
                warn!("graph search missed its deadline; dropping facts");
                Vec::new()
            }
        };

        if let Some(reranker) = &self.reranker {
            if vector_hits.len() >= 2 {
                vector_hits = self.rerank_hits(reranker, query, vector_hits).await;
            }
        }

        Ok(Retrieval {
            vector_hits,
            graph_facts,
        })
    }

    /// Reorder hits by the reranker's relevance score, substituting that
    /// score for the cosine similarity. Failures keep the cosine order.
    async fn rerank_hits(
        &self,
        reranker: &Reranker,
        query: &str,
        hits: Vec<VectorHit>,
    ) -> Vec<VectorHit> {
        let docs: Vec<String> = hits.iter().map(|h| h.content.clone()).collect();
        match reranker.rerank(query, &docs).await {
            Ok(ranked) => ranked
                .into_iter()
                .map(|r| {
                    let hit = &hits[r.index];
                    VectorHit {
                        id: hit.id.clone(),
                        content: hit.content.clone(),
                        source: hit.source.clone(),
                        similarity: r.relevance_score as f32,
                    }
                })
                .collect(),
            Err(e) => {
                warn!("rerank failed (non-fatal), keeping cosine order: {e}");
                hits
            }
        }
    }

    /// Run hybrid retrieval and return the formatted context block.
    pub async fn search_context(&self, query: &str, opts: RetrievalOptions) -> Result<String> {
        let retrieval = self.retrieve(query, opts).await?;
        Ok(format_context(&retrieval))
    }
}

/// Render the structured context block handed to the LLM. Sections with no
/// results are omitted; both empty yields an empty string.
pub fn format_context(retrieval: &Retrieval) -> String {
    let mut out = String::new();

    if !retrieval.vector_hits.is_empty() {
        out.push_str("## Relevant Knowledge\n\n");
        for (i, hit) in retrieval.vector_hits.iter().enumerate() {
            out.push_str(&format!(
                "**[{}] Source: {}** (similarity: {:.2})\n",
                i + 1,
                hit.source,
                hit.similarity
            ));
            out.push_str(&hit.content);
            out.push_str("\n\n");
        }
    }

    let graph_block = format_facts(&retrieval.graph_facts);
    if !graph_block.is_empty() {
        out.push_str("\n## Knowledge Graph Context\n\n");
        out.push_str(&graph_block);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::llm::Triple;
    use crate::vector::VectorRecord;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedder_for(server_uri: &str, dims: usize) -> Embedder {
        Embedder::new(
            &ProviderConfig {
                base_url: server_uri.to_string(),
                api_key: "k".to_string(),
                model: "embed".to_string(),
                dimensions: 0,
            },
            dims,
        )
        .unwrap()
    }

    async fn mock_embedding(server: &MockServer, embedding: Vec<f32>) {
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": embedding}]
            })))
            .mount(server)
            .await;
    }

    fn engine_with(
        embedder: Embedder,
        reranker: Option<Reranker>,
        records: Vec<VectorRecord>,
        triples: Vec<Triple>,
    ) -> RetrievalEngine {
        let mut vectors = VectorIndex::new(embedder.dimensions()).unwrap();
        vectors.add_many(records).unwrap();
        let mut graph = GraphStore::new();
        graph.add_many(triples);
        RetrievalEngine::new(Arc::new(vectors), Arc::new(graph), embedder, reranker)
    }

    fn record(id: &str, source: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            content: format!("text for {id}"),
            source: source.to_string(),
            index: 0,
            embedding,
        }
    }

    #[tokio::test]
    async fn hybrid_context_contains_both_sections() {
        let server = MockServer::start().await;
        mock_embedding(&server, vec![1.0, 0.0]).await;

        let engine = engine_with(
            embedder_for(&server.uri(), 2),
            None,
            vec![
                record("a", "doc.md", vec![1.0, 0.0]),
                record("b", "doc.md", vec![0.0, 1.0]),
            ],
            vec![Triple {
                subject: "intelligence".into(),
                predicate: "drives".into(),
                object: "agents".into(),
            }],
        );

        let ctx = engine
            .search_context("artificial intelligence", RetrievalOptions::default())
            .await
            .unwrap();
        assert!(ctx.contains("## Relevant Knowledge"));
        assert!(ctx.contains("**[1] Source: doc.md**"));
        assert!(ctx.contains("## Knowledge Graph Context"));
        assert!(ctx.contains("- intelligence drives agents"));
    }

    #[tokio::test]
    async fn similarities_are_non_increasing() {
        let server = MockServer::start().await;
        mock_embedding(&server, vec![1.0, 0.0]).await;

        let engine = engine_with(
            embedder_for(&server.uri(), 2),
            None,
            vec![
                record("far", "d", vec![0.0, 1.0]),
                record("near", "d", vec![1.0, 0.0]),
                record("mid", "d", vec![1.0, 1.0]),
            ],
            Vec::new(),
        );

        let retrieval = engine
            .retrieve("anything relevant", RetrievalOptions::default())
            .await
            .unwrap();
        for pair in retrieval.vector_hits.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
    }

    #[tokio::test]
    async fn empty_graph_yields_vector_only_context() {
        let server = MockServer::start().await;
        mock_embedding(&server, vec![1.0, 0.0]).await;

        let engine = engine_with(
            embedder_for(&server.uri(), 2),
            None,
            vec![record("a", "doc.md", vec![1.0, 0.0])],
            Vec::new(),
        );

        let ctx = engine
            .search_context("whatever question", RetrievalOptions::default())
            .await
            .unwrap();
        assert!(ctx.contains("## Relevant Knowledge"));
        assert!(!ctx.contains("## Knowledge Graph Context"));
    }

    #[tokio::test]
    async fn embed_failure_is_retrieval_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = engine_with(
            embedder_for(&server.uri(), 2),
            None,
            vec![record("a", "doc.md", vec![1.0, 0.0])],
            Vec::new(),
        );

        let err = engine
            .retrieve("query", RetrievalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::RetrievalFailure(_)));
    }

    #[tokio::test]
    async fn empty_query_is_invalid_input() {
        let server = MockServer::start().await;
        let engine = engine_with(embedder_for(&server.uri(), 2), None, Vec::new(), Vec::new());
        let err = engine
            .retrieve("   ", RetrievalOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn reranker_reorders_and_rescores() {
        let server = MockServer::start().await;
        mock_embedding(&server, vec![1.0, 0.0]).await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 0, "relevance_score": 1.5},
                    {"index": 1, "relevance_score": 8.25}
                ]
            })))
            .mount(&server)
            .await;

        let reranker = Reranker::from_config(&ProviderConfig {
            base_url: server.uri(),
            api_key: "k".into(),
            model: "rerank-v3".into(),
            dimensions: 0,
        })
        .unwrap();

        let engine = engine_with(
            embedder_for(&server.uri(), 2),
            reranker,
            vec![
                record("closest", "d", vec![1.0, 0.0]),
                record("further", "d", vec![1.0, 1.0]),
            ],
            Vec::new(),
        );

        let retrieval = engine
            .retrieve("some question", RetrievalOptions::default())
            .await
            .unwrap();
        // The reranker promoted the cosine-second hit, and its raw score is
        // presented as-is.
        assert_eq!(retrieval.vector_hits[0].id, "further");
        assert!((retrieval.vector_hits[0].similarity - 8.25).abs() < 1e-6);
    }

    #[test]
    fn empty_retrieval_formats_to_empty_string() {
        assert_eq!(format_context(&Retrieval::default()), "");
    }
}
