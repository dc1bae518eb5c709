//! MCP (Model Context Protocol) facade: JSON-RPC over POST plus an SSE
//! discovery endpoint on GET.
//!
//! Speaks protocol version `2024-11-05`. Tools come from the agent manifest;
//! when the manifest defines none, a default knowledge-search tool is
//! synthesized from the agent name so the endpoint is always usable.

use std::convert::Infallible;

use futures::StreamExt;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::manifest::AgentManifest;
use crate::retrieval::RetrievalOptions;
use crate::server::{sse_keep_alive, AppState};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Serialize)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

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

/// `GET /mcp` — SSE discovery stream: one endpoint event, then comment pings
/// every 30 seconds until the client disconnects.
pub async fn handle_sse(State(_state): State<AppState>) -> Response {
    let endpoint = json!({"type": "endpoint", "url": "/mcp"});
    let initial = futures::stream::once(async move {
        Ok::<Event, Infallible>(Event::default().data(endpoint.to_string()))
    });
    let stream = initial.chain(futures::stream::pending());

    Sse::new(stream).keep_alive(sse_keep_alive()).into_response()
}

/// `POST /mcp` — JSON-RPC dispatch.
pub async fn handle_rpc(State(state): State<AppState>, body: String) -> Response {
    let req: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => return err(Value::Null, -32700, format!("parse error: {e}")),
    };

    match req.method.as_str() {
        "initialize" => ok(req.id, initialize(&state.manifest)),
        "tools/list" => ok(req.id, json!({"tools": build_tools(&state.manifest)})),
        "tools/call" => call_tool(&state, req.id, req.params).await,
        other => err(req.id, -32601, format!("method not found: {other}")),
    }
}

fn initialize(manifest: &AgentManifest) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {"tools": {}},
        "serverInfo": {
            "name": manifest.agent.name,
            "version": "1.0.0",
        },
    })
}

/// Tools from the manifest, each wrapped in the query/top_k input schema.
/// Falls back to a synthesized default tool when the manifest has none.
pub fn build_tools(manifest: &AgentManifest) -> Vec<McpTool> {
    let schema = json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": "The search query to find relevant information",
            },
            "top_k": {
                "type": "integer",
                "description": "Number of results to return (default: 5)",
            },
        },
        "required": ["query"],
    });

    let mut tools: Vec<McpTool> = manifest
        .mcp
        .tools
        .iter()
        .map(|t| McpTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: schema.clone(),
        })
        .collect();

    if tools.is_empty() {
        tools.push(McpTool {
            name: format!("search_{}_knowledge", manifest.slug()),
            description: manifest.agent.description.clone(),
            input_schema: schema,
        });
    }

    tools
}

async fn call_tool(state: &AppState, id: Value, params: Value) -> Response {
    #[derive(Deserialize)]
    struct CallParams {
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: Value,
    }

    let params: CallParams = match serde_json::from_value(params) {
        Ok(p) => p,
        Err(e) => return err(id, -32602, format!("invalid params: {e}")),
    };

    if !build_tools(&state.manifest)
        .iter()
        .any(|t| t.name == params.name)
    {
        return err(id, -32602, format!("unknown tool: {}", params.name));
    }

    let query = params
        .arguments
        .get("query")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if query.is_empty() {
        return err(id, -32602, "query argument is required");
    }

    let mut opts = RetrievalOptions::default();
    if let Some(top_k) = params.arguments.get("top_k").and_then(|v| v.as_u64()) {
        if top_k > 0 {
            opts.vector_k = top_k as usize;
        }
    }

    match state.engine.search_context(query, opts).await {
        Ok(context) => ok(
            id,
            json!({
                "content": [{"type": "text", "text": context}],
            }),
        ),
        Err(e) => err(id, -32603, format!("search error: {e}")),
    }
}
