//! OpenAI-compatible chat completions client.
//!
//! One client serves three callers: the builder (triple extraction and tool
//! description generation), the REST facade (proxied chat, streaming and
//! non-streaming), and the A2A facade (single-shot queries). Streaming
//! deltas are delivered in order over an unbounded channel; a dropped
//! receiver (client disconnect) stops the upstream read within one chunk.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ProviderConfig;
use crate::error::{KilnError, Result};

const LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// A chat message in the OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A subject–predicate–object fact extracted from text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Triple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

/// Sampling parameters forwarded from the REST facade.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct LlmClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(cfg: &ProviderConfig) -> Result<Self> {
        if cfg.base_url.is_empty() {
            return Err(KilnError::InvalidConfig("llm base_url is required".into()));
        }
        if cfg.api_key.is_empty() {
            return Err(KilnError::InvalidConfig("llm api_key is required".into()));
        }
        if cfg.model.is_empty() {
            return Err(KilnError::InvalidConfig("llm model is required".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .build()
            .map_err(|e| KilnError::internal("build llm client", e))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            client,
        })
    }

    /// The configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body(&self, messages: &[ChatMessage], opts: &ChatOptions, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| KilnError::upstream("chat completion request", e))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let raw = resp.text().await.unwrap_or_default();
            return Err(KilnError::RateLimited(format!("chat API: {raw}")));
        }
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(KilnError::UpstreamFailure(format!(
                "chat API returned status {status}: {raw}"
            )));
        }
        Ok(resp)
    }

    /// Run a non-streaming chat completion over an arbitrary message list
    /// and return the assistant's text.
    pub async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<String> {
        let body = self.build_body(messages, opts, false);
        let resp = self.post(&body).await?;
        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| KilnError::upstream("parse chat response", e))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(KilnError::UpstreamFailure("llm returned empty response".into()));
        }
        Ok(content)
    }

    /// Send a single system + user exchange and return the response text.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(user));
        self.chat(&messages, &ChatOptions::default()).await
    }

    /// Run a streaming chat completion, sending each content delta over
    /// `tx` in arrival order. Returns once the upstream signals `[DONE]`,
    /// the stream ends, or the receiver is dropped (client disconnect) —
    /// the last case abandons the upstream response mid-stream.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<()> {
        let body = self.build_body(messages, opts, true);
        let resp = self.post(&body).await?;

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| KilnError::upstream("stream recv", e))?;
            buf.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are newline-delimited; hold back any partial line.
            while let Some(pos) = buf.find('\n') {
                let line: String = buf.drain(..=pos).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    return Ok(());
                }
                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                let delta = value
                    .pointer("/choices/0/delta/content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if !delta.is_empty() && tx.send(delta.to_string()).is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Extract knowledge-graph triples from a block of text.
    pub async fn extract_triples(&self, text: &str) -> Result<Vec<Triple>> {
        let system = "You are a knowledge extraction expert. Extract factual relationships from the provided text as Subject-Predicate-Object triples.\n\n\
Rules:\n\
- Extract only factual, verifiable relationships\n\
- Subjects and Objects should be named entities (people, places, organizations, concepts)\n\
- Predicates should be concise verb phrases\n\
- Return ONLY valid JSON array, no explanation\n\
- Format: [{\"subject\": \"X\", \"predicate\": \"Y\", \"object\": \"Z\"}]\n\
- Extract 5-20 triples per chunk\n\
- If no clear triples exist, return []";

        let prompt = format!("Extract knowledge graph triples from this text:\n\n{text}");
        let raw = self.complete(system, &prompt).await?;
        parse_triples(&raw)
    }

    /// Generate a short MCP tool description for the knowledge base, given a
    /// content sample.
    pub async fn generate_tool_description(&self, slug: &str, sample: &str) -> Result<String> {
        let system = "You are an expert at writing Model Context Protocol (MCP) tool descriptions.\n\
Write a concise, highly effective tool description that:\n\
1. Clearly explains what domain knowledge the tool provides\n\
2. Lists 3-5 specific topic areas covered\n\
3. Guides the AI on when to call this tool\n\
4. Is 2-4 sentences maximum\n\
Return ONLY the description text, nothing else.";

        let prompt = format!(
            "Write an MCP tool description for an AI agent named \"{slug}\"\n\
that has been trained on the following knowledge (sample):\n\n{sample}\n\n\
The tool name will be: search_{slug}_knowledge"
        );
        self.complete(system, &prompt).await
    }
}

/// Parse a JSON array of triples from an LLM response. Lenient: strips
/// Markdown code fences, locates the outermost `[...]`, and drops entries
/// with any empty field. A response with no array at all yields an empty
/// list rather than an error.
pub fn parse_triples(raw: &str) -> Result<Vec<Triple>> {
    let mut raw = raw.trim();

    let stripped;
    if raw.starts_with("```") {
        let body = match raw.split_once('\n') {
            Some((_, rest)) => rest,
            None => raw,
        };
        stripped = body.trim_end_matches("```").trim().to_string();
        raw = &stripped;
    }

    let (start, end) = match (raw.find('['), raw.rfind(']')) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => return Ok(Vec::new()),
    };

    let triples: Vec<Triple> = serde_json::from_str(&raw[start..=end])
        .map_err(|e| KilnError::upstream("parse triples response", e))?;

    Ok(triples
        .into_iter()
        .map(|t| Triple {
            subject: t.subject.trim().to_string(),
            predicate: t.predicate.trim().to_string(),
            object: t.object.trim().to_string(),
        })
        .filter(|t| !t.subject.is_empty() && !t.predicate.is_empty() && !t.object.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> LlmClient {
        LlmClient::new(&ProviderConfig {
            base_url: base_url.to_string(),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            dimensions: 0,
        })
        .unwrap()
    }

    #[test]
    fn parse_triples_plain_array() {
        let raw = r#"[{"subject":"AI","predicate":"is","object":"simulation of intelligence"}]"#;
        let triples = parse_triples(raw).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].subject, "AI");
    }

    #[test]
    fn parse_triples_fenced_matches_unfenced() {
        let plain = r#"[{"subject":"A","predicate":"b","object":"C"},{"subject":"D","predicate":"e","object":"F"}]"#;
        let fenced = format!("```json\n{plain}\n```");
        assert_eq!(parse_triples(plain).unwrap(), parse_triples(&fenced).unwrap());
    }

    #[test]
    fn parse_triples_with_surrounding_prose() {
        let raw = "Here are the triples:\n[{\"subject\":\"X\",\"predicate\":\"y\",\"object\":\"Z\"}]\nDone.";
        let triples = parse_triples(raw).unwrap();
        assert_eq!(triples.len(), 1);
    }

    #[test]
    fn parse_triples_drops_empty_fields() {
        let raw = r#"[{"subject":"","predicate":"y","object":"Z"},{"subject":"A","predicate":"  ","object":"C"},{"subject":"Keep","predicate":"this","object":"one"}]"#;
        let triples = parse_triples(raw).unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].subject, "Keep");
    }

    #[test]
    fn parse_triples_no_array_is_empty() {
        assert!(parse_triples("no triples here").unwrap().is_empty());
        assert!(parse_triples("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn complete_returns_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({"model": "test-model"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "AI means…"}}]
            })))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let out = c.complete("system", "what is AI").await.unwrap();
        assert_eq!(out, "AI means…");
    }

    #[tokio::test]
    async fn empty_response_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": ""}}]
            })))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        assert!(c.complete("", "hi").await.is_err());
    }

    #[tokio::test]
    async fn upstream_error_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let err = c.complete("", "hi").await.unwrap_err();
        assert!(matches!(err, KilnError::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn streaming_delivers_deltas_in_order() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let (tx, mut rx) = mpsc::unbounded_channel();
        c.chat_stream(&[ChatMessage::user("hi")], &ChatOptions::default(), tx)
            .await
            .unwrap();

        let mut collected = String::new();
        while let Some(delta) = rx.recv().await {
            collected.push_str(&delta);
        }
        assert_eq!(collected, "Hello");
    }

    #[tokio::test]
    async fn extract_triples_through_mock() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant",
                    "content": "[{\"subject\":\"AI\",\"predicate\":\"is\",\"object\":\"simulation of intelligence\"}]"}}]
            })))
            .mount(&server)
            .await;

        let c = client(&server.uri());
        let triples = c.extract_triples("AI is the simulation of intelligence.").await.unwrap();
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].object, "simulation of intelligence");
    }
}
