//! Runtime HTTP server: one listener, three protocol facades.
//!
//! | Method | Path | Facade |
//! |--------|------|--------|
//! | `POST` | `/v1/chat/completions` | OpenAI-compatible REST chat (streaming + non-streaming) |
//! | `GET`  | `/mcp` | MCP discovery over Server-Sent Events |
//! | `POST` | `/mcp` | MCP JSON-RPC |
//! | `POST` | `/rpc/agent` | A2A JSON-RPC |
//! | `GET`  | `/health` | Unauthenticated health check |
//!
//! The middleware stack runs request-log → CORS → auth → route. When
//! `AGENT_API_KEY` is set, every request except `/health` and CORS preflight
//! must carry `Authorization: Bearer <key>`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::{self, AppConfig, DEFAULT_PORT};
use crate::embedder::Embedder;
use crate::error::{KilnError, Result};
use crate::graph::GraphStore;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};
use crate::manifest::AgentManifest;
use crate::reranker::Reranker;
use crate::retrieval::{RetrievalEngine, RetrievalOptions};
use crate::vector::VectorIndex;
use crate::{a2a, mcp};

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub manifest: Arc<AgentManifest>,
    pub engine: Arc<RetrievalEngine>,
    pub llm: Arc<LlmClient>,
    pub config: Arc<AppConfig>,
    /// Bearer key enabling auth; `None` means open access.
    pub api_key: Option<String>,
}

/// Open the databases and assemble the shared state for the project at `dir`.
pub async fn build_state(dir: &Path, agent_yaml: &Path, config: AppConfig) -> Result<AppState> {
    config::validate_serve(&config)?;

    let manifest = AgentManifest::load(agent_yaml)?;
    let dimensions = if manifest.dimensions() > 0 {
        manifest.dimensions()
    } else {
        config.embedder.dimensions
    };

    let data_dir = dir.join("data");
    let vectors = VectorIndex::open(&data_dir.join("vectors"), dimensions).await?;
    let graph = GraphStore::open(&data_dir.join("graph")).await?;

    let embedder = Embedder::new(&config.embedder, dimensions)?;
    let llm = LlmClient::new(&config.llm)?;
    let reranker = Reranker::from_config(&config.reranker)?;

    let engine = RetrievalEngine::new(Arc::new(vectors), Arc::new(graph), embedder, reranker);
    let api_key = config.agent_api_key.clone();

    info!(
        agent = %manifest.agent.name,
        vectors = engine.vector_count(),
        triples = engine.triple_count(),
        llm_model = %config.llm.model,
        embed_model = %config.embedder.model,
        embed_dimensions = dimensions,
        auth_enabled = api_key.is_some(),
        "server initialized"
    );

    Ok(AppState {
        manifest: Arc::new(manifest),
        engine: Arc::new(engine),
        llm: Arc::new(llm),
        config: Arc::new(config),
        api_key,
    })
}

/// Build the full router with the middleware stack.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.manifest.server.cors_origins);

    Router::new()
        .route("/health", get(handle_health))
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/mcp", get(mcp::handle_sse).post(mcp::handle_rpc))
        .route("/rpc/agent", post(a2a::handle_rpc))
        .layer(middleware::from_fn_with_state(state.clone(), auth))
        .layer(cors)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Start serving. The listen port resolves config → manifest → 8000.
pub async fn run_server(dir: &Path, agent_yaml: &Path, config: AppConfig) -> Result<()> {
    let port = config
        .port
        .or_else(|| {
            AgentManifest::load(agent_yaml)
                .ok()
                .and_then(|m| m.server.port)
        })
        .unwrap_or(DEFAULT_PORT);

    let state = build_state(dir, agent_yaml, config).await?;
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| KilnError::Internal(format!("bind {addr}: {e}")))?;
    info!("listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| KilnError::Internal(format!("serve: {e}")))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let any_origin = origins.is_empty() || origins.iter().any(|o| o == "*");
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if any_origin {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(parsed)
    }
}

/// One log line per completed request.
async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|| "-".to_string());

    let start = Instant::now();
    let response = next.run(req).await;

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        remote = %remote,
        "request"
    );
    response
}

/// Bearer-key auth. `/health` and CORS preflight are always public.
async fn auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(expected) = &state.api_key else {
        return next.run(req).await;
    };

    if req.uri().path() == "/health" || req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented != Some(expected.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "invalid or missing API key — pass via Authorization: Bearer <AGENT_API_KEY>"
            })),
        )
            .into_response();
    }

    next.run(req).await
}

// ============ GET /health ============

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "agent": state.manifest.agent.name,
        "version": state.manifest.agent.version,
        "vectors": state.engine.vector_count(),
        "triples": state.engine.triple_count(),
        "mcp_tools": state.manifest.mcp.tools.len(),
        "embed_dimensions": state.manifest.dimensions(),
        "llm_model": state.config.llm.model,
        "embed_model": state.config.embedder.model,
        "reranker_enabled": state.engine.reranker_enabled(),
        "auth_enabled": state.api_key.is_some(),
        "time": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    }))
}

// ============ POST /v1/chat/completions ============

/// The subset of the OpenAI chat completion request the facade honors.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

async fn handle_chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Response {
    let query = last_user_message(&req.messages);
    info!(query = %query, stream = req.stream, "chat completion request");

    // Retrieval failure is non-fatal: answer without context.
    let retrieved = match state
        .engine
        .search_context(&query, RetrievalOptions::default())
        .await
    {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!("retrieval failed, proceeding without context: {e}");
            String::new()
        }
    };

    let augmented = augment_messages(
        &state.manifest.agent.system_prompt,
        &retrieved,
        &req.messages,
    );
    let opts = ChatOptions {
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
    };

    if req.stream {
        return stream_completion(state, augmented, opts).await;
    }

    match state.llm.chat(&augmented, &opts).await {
        Ok(content) => Json(json!({
            "id": completion_id(),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": state.llm.model(),
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
        }))
        .into_response(),
        Err(e) => {
            error!("llm call failed: {e}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": "upstream LLM request failed"})),
            )
                .into_response()
        }
    }
}

/// Stream completion deltas as OpenAI-style SSE chunks, terminated by
/// `data: [DONE]`. Errors after headers are sent become a terminal error
/// event. A dropped client connection drops the event receiver, which stops
/// the upstream read within one chunk.
async fn stream_completion(
    state: AppState,
    messages: Vec<ChatMessage>,
    opts: ChatOptions,
) -> Response {
    let id = completion_id();
    let model = state.llm.model().to_string();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let llm = Arc::clone(&state.llm);
        let upstream =
            tokio::spawn(async move { llm.chat_stream(&messages, &opts, delta_tx).await });

        while let Some(delta) = delta_rx.recv().await {
            let chunk = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": chrono::Utc::now().timestamp(),
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": {"role": "assistant", "content": delta},
                }],
            });
            if event_tx.send(chunk.to_string()).is_err() {
                // Client went away; dropping delta_rx cancels the upstream.
                return;
            }
        }

        match upstream.await {
            Ok(Ok(())) => {
                let _ = event_tx.send("[DONE]".to_string());
            }
            Ok(Err(e)) => {
                error!("streaming llm error: {e}");
                let _ = event_tx.send(json!({"error": "upstream LLM request failed"}).to_string());
            }
            Err(e) => {
                error!("streaming task failed: {e}");
                let _ = event_tx.send(json!({"error": "internal error"}).to_string());
            }
        }
    });

    let stream = UnboundedReceiverStream::new(event_rx)
        .map(|data| Ok::<Event, std::convert::Infallible>(Event::default().data(data)));

    Sse::new(stream).into_response()
}

fn completion_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("chatcmpl-{nanos}")
}

fn last_user_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Prepend the agent system prompt and the retrieved context, then append
/// the original messages with their system messages removed so the agent
/// prompt is not duplicated or overridden.
fn augment_messages(
    system_prompt: &str,
    retrieved: &str,
    original: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut augmented = Vec::with_capacity(original.len() + 2);
    if !system_prompt.is_empty() {
        augmented.push(ChatMessage::system(system_prompt));
    }
    if !retrieved.is_empty() {
        augmented.push(ChatMessage::system(format!(
            "Here is relevant context from the knowledge base:\n\n{retrieved}"
        )));
    }
    for msg in original {
        if msg.role != "system" {
            augmented.push(msg.clone());
        }
    }
    augmented
}

/// Shared keep-alive cadence for SSE endpoints: a comment ping every 30 s.
pub(crate) fn sse_keep_alive() -> KeepAlive {
    KeepAlive::new()
        .interval(std::time::Duration::from_secs(30))
        .text("ping")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_picks_the_latest() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("first"),
            ChatMessage {
                role: "assistant".into(),
                content: "reply".into(),
            },
            ChatMessage::user("second"),
        ];
        assert_eq!(last_user_message(&messages), "second");
        assert_eq!(last_user_message(&[]), "");
    }

    #[test]
    fn augment_strips_original_system_messages() {
        let original = vec![
            ChatMessage::system("client system prompt"),
            ChatMessage::user("question"),
        ];
        let augmented = augment_messages("agent prompt", "some context", &original);
        assert_eq!(augmented.len(), 3);
        assert_eq!(augmented[0].role, "system");
        assert_eq!(augmented[0].content, "agent prompt");
        assert!(augmented[1].content.starts_with("Here is relevant context"));
        assert_eq!(augmented[2].content, "question");
    }

    #[test]
    fn augment_with_nothing_to_add_keeps_user_messages() {
        let original = vec![ChatMessage::user("question")];
        let augmented = augment_messages("", "", &original);
        assert_eq!(augmented, original);
    }

    #[test]
    fn completion_ids_carry_prefix() {
        assert!(completion_id().starts_with("chatcmpl-"));
    }
}
