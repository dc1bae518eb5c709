//! OpenAI-compatible embeddings client.
//!
//! Issues a single `POST {base}/embeddings` per batch. The model field is
//! omitted when empty so embedding routers can pick their own. The declared
//! dimension is enforced locally: longer vectors are truncated, shorter ones
//! are a hard error. The dimension is never sent in the request body.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::ProviderConfig;
use crate::error::{KilnError, Result};

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Generates vector embeddings via an OpenAI-compatible API.
#[derive(Clone)]
pub struct Embedder {
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    data: Vec<EmbedDatum>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

impl Embedder {
    /// Create an embedder. The base URL and API key are required; the model
    /// is optional (router mode); `dimensions` must already be resolved.
    pub fn new(cfg: &ProviderConfig, dimensions: usize) -> Result<Self> {
        if cfg.base_url.is_empty() {
            return Err(KilnError::InvalidConfig("embedder base_url is required".into()));
        }
        if cfg.api_key.is_empty() {
            return Err(KilnError::InvalidConfig("embedder api_key is required".into()));
        }
        if dimensions == 0 {
            return Err(KilnError::InvalidConfig(
                "embedder dimensions must be > 0".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| KilnError::internal("build embed client", e))?;

        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            dimensions,
            client,
        })
    }

    /// The declared dimension every returned vector matches.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// The configured model name (may be empty in router mode).
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embed a batch of texts in one request. Returns one vector per input,
    /// in input order, each exactly `dimensions` long.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut body = json!({ "input": texts });
        if !self.model.is_empty() {
            body["model"] = json!(self.model);
        }

        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| KilnError::upstream("embed request", e))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| KilnError::upstream("read embed response", e))?;

        if status.as_u16() == 429 {
            return Err(KilnError::RateLimited(format!("embed API: {raw}")));
        }
        if !status.is_success() {
            return Err(KilnError::UpstreamFailure(format!(
                "embed API returned status {status}: {raw}"
            )));
        }

        let parsed: EmbedResponse = serde_json::from_str(&raw)
            .map_err(|e| KilnError::upstream("parse embed response", e))?;
        if let Some(err) = parsed.error {
            return Err(KilnError::UpstreamFailure(format!(
                "embed API error: {}",
                err.message
            )));
        }

        // Responses may arrive out of order; reassemble by index.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        for datum in parsed.data {
            if datum.index < vectors.len() {
                vectors[datum.index] = Some(datum.embedding);
            }
        }

        let mut result = Vec::with_capacity(texts.len());
        for (i, slot) in vectors.into_iter().enumerate() {
            let mut v = slot.ok_or_else(|| {
                KilnError::UpstreamFailure(format!("embed API returned no embedding for input {i}"))
            })?;
            if v.len() < self.dimensions {
                return Err(KilnError::DimensionMismatch {
                    expected: self.dimensions,
                    got: v.len(),
                });
            }
            v.truncate(self.dimensions);
            result.push(v);
        }
        Ok(result)
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| KilnError::UpstreamFailure("embedder returned no embedding".into()))
    }
}
