//! A2A (Agent-to-Agent) JSON-RPC facade on `POST /rpc/agent`.
//!
//! Three methods: `agent.info` (capability discovery), `agent.query`
//! (retrieval-augmented answer), and `agent.search` (raw retrieval, no LLM).

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::llm::ChatMessage;
use crate::retrieval::RetrievalOptions;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

fn ok(id: Value, result: Value) -> Response {
    Json(RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    })
    .into_response()
}

fn err(id: Value, code: i64, message: impl Into<String>) -> Response {
    Json(RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcError {
            code,
            message: message.into(),
        }),
    })
    .into_response()
}

/// `POST /rpc/agent` — JSON-RPC dispatch.
pub async fn handle_rpc(State(state): State<AppState>, body: String) -> Response {
    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => return err(Value::Null, -32700, format!("parse error: {e}")),
    };

    match req.method.as_str() {
        "agent.info" => ok(req.id, agent_info(&state)),
        "agent.query" => query(&state, req.id, req.params).await,
        "agent.search" => search(&state, req.id, req.params).await,
        other => err(req.id, -32601, format!("method not found: {other}")),
    }
}

fn agent_info(state: &AppState) -> Value {
    let tool_names: Vec<String> = crate::mcp::build_tools(&state.manifest)
        .into_iter()
        .map(|t| t.name)
        .collect();

    json!({
        "name": state.manifest.agent.name,
        "description": state.manifest.agent.description,
        "version": "1.0.0",
        "capabilities": {
            "query": true,
            "search": true,
            "stream": false,
        },
        "tools": tool_names,
        "vectors": state.engine.vector_count(),
        "triples": state.engine.triple_count(),
        "endpoints": {
            "rest": "/v1/chat/completions",
            "mcp": "/mcp",
            "a2a": "/rpc/agent",
        },
    })
}

async fn query(state: &AppState, id: Value, params: Value) -> Response {
    #[derive(Deserialize)]
    struct QueryParams {
        #[serde(default)]
        query: String,
        #[serde(default)]
        system_prompt: Option<String>,
        /// Accepted for protocol compatibility but not yet threaded into
        /// the prompt.
        // TODO: feed history into the message list once multi-turn A2A
        // clients exist to exercise it.
        #[serde(default)]
        #[allow(dead_code)]
        history: Vec<Value>,
    }

    let params: QueryParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return err(id, -32602, format!("invalid params: {e}")),
    };
    if params.query.is_empty() {
        return err(id, -32602, "query is required");
    }

    // Retrieval failure degrades to an empty context.
    let context = state
        .engine
        .search_context(&params.query, RetrievalOptions::default())
        .await
        .unwrap_or_default();

    let system_prompt = params
        .system_prompt
        .unwrap_or_else(|| state.manifest.agent.system_prompt.clone());

    let mut messages = Vec::with_capacity(3);
    if !system_prompt.is_empty() {
        messages.push(ChatMessage::system(system_prompt));
    }
    if !context.is_empty() {
        messages.push(ChatMessage::system(format!("Retrieved context:\n\n{context}")));
    }
    messages.push(ChatMessage::user(params.query));

    match state.llm.chat(&messages, &Default::default()).await {
        Ok(answer) => ok(
            id,
            json!({
                "answer": answer,
                "context": context,
                "agent": state.manifest.agent.name,
            }),
        ),
        Err(e) => {
            error!("a2a llm call failed: {e}");
            err(id, -32603, "upstream LLM request failed")
        }
    }
}

async fn search(state: &AppState, id: Value, params: Value) -> Response {
    #[derive(Deserialize)]
    struct SearchParams {
        #[serde(default)]
        query: String,
        #[serde(default)]
        top_k: Option<usize>,
    }

    let params: SearchParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return err(id, -32602, format!("invalid params: {e}")),
    };
    if params.query.is_empty() {
        return err(id, -32602, "query is required");
    }

    let top_k = params.top_k.filter(|k| *k > 0).unwrap_or(5);
    let opts = RetrievalOptions {
        vector_k: top_k,
        graph_k: top_k * 2,
        ..Default::default()
    };

    match state.engine.retrieve(&params.query, opts).await {
        Ok(retrieval) => {
            let vector_results: Vec<Value> = retrieval
                .vector_hits
                .iter()
                .map(|h| {
                    json!({
                        "content": h.content,
                        "source": h.source,
                        "similarity": h.similarity,
                    })
                })
                .collect();

            ok(
                id,
                json!({
                    "vector_results": vector_results,
                    "graph_results": retrieval.graph_facts,
                    "query": params.query,
                }),
            )
        }
        Err(e) => err(id, -32603, format!("vector search error: {e}")),
    }
}
