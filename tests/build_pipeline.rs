//! End-to-end build pipeline tests against mocked upstream providers.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use agent_kiln::builder::run_build;
use agent_kiln::config::{AppConfig, ProviderConfig};
use agent_kiln::error::KilnError;
use agent_kiln::graph::GraphStore;
use agent_kiln::manifest::AgentManifest;
use agent_kiln::vector::VectorIndex;

const DIMS: usize = 4;

fn setup_project(doc: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("data").join("x.md"), doc).unwrap();
    fs::write(
        root.join("agent.yaml"),
        format!(
            "agent:\n  name: Test Agent\n  description: test\n  version: 0.1.0\n  system_prompt: You are a test agent.\nruntime:\n  embedder:\n    dimensions: {DIMS}\nmcp:\n  tools: []\nserver:\n  port: 8000\n  cors_origins: [\"*\"]\n"
        ),
    )
    .unwrap();

    (tmp, root)
}

fn config_for(server_uri: &str) -> AppConfig {
    AppConfig {
        llm: ProviderConfig {
            base_url: server_uri.to_string(),
            api_key: "test-key".into(),
            model: "test-model".into(),
            dimensions: 0,
        },
        embedder: ProviderConfig {
            base_url: server_uri.to_string(),
            api_key: "test-key".into(),
            model: "test-embed".into(),
            dimensions: DIMS,
        },
        reranker: ProviderConfig::default(),
        port: None,
        agent_api_key: None,
    }
}

/// Embeddings mock: one fixed vector per requested input.
async fn mock_embeddings(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(|req: &wiremock::Request| {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            let n = body["input"].as_array().map(|a| a.len()).unwrap_or(1);
            let data: Vec<serde_json::Value> = (0..n)
                .map(|i| {
                    serde_json::json!({
                        "index": i,
                        "embedding": [1.0, 0.5, 0.25, 0.125, 0.9]
                    })
                })
                .collect();
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
        })
        .mount(server)
        .await;
}

async fn mock_extraction(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("Extract knowledge graph triples"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant",
                "content": "[{\"subject\":\"AI\",\"predicate\":\"is\",\"object\":\"simulation of intelligence\"}]"}}]
        })))
        .mount(server)
        .await;
}

async fn mock_description(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("MCP tool description"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant",
                "content": "Search the test knowledge base covering AI fundamentals."}}]
        })))
        .mount(server)
        .await;
}

async fn open_artifacts(root: &Path) -> (VectorIndex, GraphStore) {
    let vectors = VectorIndex::open(&root.join("data").join("vectors"), DIMS)
        .await
        .unwrap();
    let graph = GraphStore::open(&root.join("data").join("graph")).await.unwrap();
    (vectors, graph)
}

#[tokio::test]
async fn build_single_document_end_to_end() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    mock_extraction(&server).await;
    mock_description(&server).await;

    let (_tmp, root) = setup_project("# AI\n\nAI is the simulation of intelligence.");
    let report = run_build(&root, &config_for(&server.uri())).await.unwrap();

    assert_eq!(report.documents, 1);
    assert_eq!(report.chunks, 1);
    assert_eq!(report.vectors, 1);
    assert!(report.triples >= 1);

    let (vectors, graph) = open_artifacts(&root).await;
    assert_eq!(vectors.count(), 1);
    assert!(graph.count() >= 1);
    let facts = graph.search("simulation", 10);
    assert_eq!(facts[0].subject, "AI");

    // Manifest now carries the generated knowledge-search tool
    let manifest = AgentManifest::load(&root.join("agent.yaml")).unwrap();
    assert_eq!(manifest.mcp.tools.len(), 1);
    assert_eq!(manifest.mcp.tools[0].name, "search_test_agent_knowledge");
    assert_eq!(
        manifest.mcp.tools[0].description,
        "Search the test knowledge base covering AI fundamentals."
    );
    // Non-MCP sections survived the mutation
    assert_eq!(manifest.agent.system_prompt.trim(), "You are a test agent.");
    assert_eq!(manifest.dimensions(), DIMS);
}

#[tokio::test]
async fn build_is_deterministic_across_runs() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    mock_extraction(&server).await;
    mock_description(&server).await;

    let (_tmp, root) = setup_project(
        "# Topic One\n\nRust is a systems language.\n\n# Topic Two\n\nKiln compiles knowledge.",
    );

    let first = run_build(&root, &config_for(&server.uri())).await.unwrap();
    let (v1, g1) = open_artifacts(&root).await;

    let second = run_build(&root, &config_for(&server.uri())).await.unwrap();
    let (v2, g2) = open_artifacts(&root).await;

    assert_eq!(first.chunks, second.chunks);
    assert_eq!(v1.count(), v2.count());
    assert_eq!(g1.count(), g2.count());
}

#[tokio::test]
async fn empty_data_directory_fails_with_invalid_input() {
    let server = MockServer::start().await;
    let (_tmp, root) = setup_project("placeholder");
    fs::remove_file(root.join("data").join("x.md")).unwrap();

    let err = run_build(&root, &config_for(&server.uri())).await.unwrap_err();
    assert!(matches!(err, KilnError::InvalidInput(_)));
}

#[tokio::test]
async fn missing_manifest_fails_before_any_network_call() {
    let server = MockServer::start().await;
    let (_tmp, root) = setup_project("doc");
    fs::remove_file(root.join("agent.yaml")).unwrap();

    let err = run_build(&root, &config_for(&server.uri())).await.unwrap_err();
    assert!(matches!(err, KilnError::InvalidInput(_)));
}

#[tokio::test]
async fn sequential_embedding_retries_through_a_rate_limit() {
    let server = MockServer::start().await;

    // First embeddings call is rate limited; later calls succeed.
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mock_embeddings(&server).await;
    mock_extraction(&server).await;
    mock_description(&server).await;

    let (_tmp, root) = setup_project("AI is the simulation of intelligence.");
    let report = run_build(&root, &config_for(&server.uri())).await.unwrap();
    assert_eq!(report.vectors, 1);
}

#[tokio::test]
async fn extraction_failure_skips_batch_but_build_succeeds() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    mock_description(&server).await;
    // Extraction calls always fail; the build must still finish.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("Extract knowledge graph triples"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (_tmp, root) = setup_project("AI is the simulation of intelligence.");
    let report = run_build(&root, &config_for(&server.uri())).await.unwrap();
    assert_eq!(report.vectors, 1);
    assert_eq!(report.triples, 0);
}

#[tokio::test]
async fn description_failure_falls_back_to_template() {
    let server = MockServer::start().await;
    mock_embeddings(&server).await;
    mock_extraction(&server).await;
    // No description mock: the call 404s and the template kicks in.

    let (_tmp, root) = setup_project("AI is the simulation of intelligence.");
    run_build(&root, &config_for(&server.uri())).await.unwrap();

    let manifest = AgentManifest::load(&root.join("agent.yaml")).unwrap();
    assert_eq!(
        manifest.mcp.tools[0].description,
        "Search the test_agent expert knowledge base for relevant information."
    );
}
