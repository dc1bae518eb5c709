//! Cohere-compatible rerank client (optional).
//!
//! Endpoint resolution order: the `RERANK_ENDPOINT` env override, the
//! configured base URL if it already points at a `/rerank` path, otherwise
//! base URL + `/rerank`.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::ProviderConfig;
use crate::error::{KilnError, Result};

const RERANK_TIMEOUT: Duration = Duration::from_secs(30);

/// A reranked document reference.
#[derive(Debug, Clone)]
pub struct RerankResult {
    /// Index into the submitted document list.
    pub index: usize,
    /// Provider relevance score; arbitrary scale, higher is better.
    pub relevance_score: f64,
}

#[derive(Deserialize)]
struct RerankResponse {
    #[serde(default)]
    results: Vec<RerankResponseItem>,
}

#[derive(Deserialize)]
struct RerankResponseItem {
    index: usize,
    relevance_score: f64,
}

/// Reranks documents against a query via a Cohere-compatible API.
#[derive(Clone)]
pub struct Reranker {
    endpoint: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl Reranker {
    /// Create a reranker from config. Returns `None` when the provider is
    /// not configured (no base URL or model) — reranking is optional.
    pub fn from_config(cfg: &ProviderConfig) -> Result<Option<Self>> {
        if cfg.base_url.is_empty() || cfg.model.is_empty() {
            return Ok(None);
        }

        let endpoint = match std::env::var("RERANK_ENDPOINT") {
            Ok(url) if !url.is_empty() => url,
            _ => {
                let base = cfg.base_url.trim_end_matches('/');
                if base.contains("/rerank") {
                    base.to_string()
                } else {
                    format!("{base}/rerank")
                }
            }
        };

        let client = reqwest::Client::builder()
            .timeout(RERANK_TIMEOUT)
            .build()
            .map_err(|e| KilnError::internal("build rerank client", e))?;

        Ok(Some(Self {
            endpoint,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            client,
        }))
    }

    /// The configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Rerank `docs` by relevance to `query`. Results are sorted by
    /// relevance score descending and reference documents by index.
    pub async fn rerank(&self, query: &str, docs: &[String]) -> Result<Vec<RerankResult>> {
        let body = json!({
            "model": self.model,
            "query": query,
            "documents": docs,
            "top_n": docs.len(),
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| KilnError::upstream("rerank request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let raw = resp.text().await.unwrap_or_default();
            return Err(KilnError::UpstreamFailure(format!(
                "rerank API returned status {status}: {raw}"
            )));
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| KilnError::upstream("parse rerank response", e))?;
        if parsed.results.is_empty() {
            return Err(KilnError::UpstreamFailure("rerank API returned no results".into()));
        }

        let mut results: Vec<RerankResult> = parsed
            .results
            .into_iter()
            .filter(|r| r.index < docs.len())
            .map(|r| RerankResult {
                index: r.index,
                relevance_score: r.relevance_score,
            })
            .collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn unconfigured_provider_is_none() {
        assert!(Reranker::from_config(&ProviderConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn endpoint_appends_rerank_path() {
        let r = Reranker::from_config(&ProviderConfig {
            base_url: "http://rerank.local/v1".into(),
            api_key: "k".into(),
            model: "rerank-v3".into(),
            dimensions: 0,
        })
        .unwrap()
        .unwrap();
        assert_eq!(r.endpoint, "http://rerank.local/v1/rerank");
    }

    #[test]
    fn endpoint_kept_when_already_rerank() {
        let r = Reranker::from_config(&ProviderConfig {
            base_url: "http://rerank.local/v2/rerank".into(),
            api_key: "k".into(),
            model: "rerank-v3".into(),
            dimensions: 0,
        })
        .unwrap()
        .unwrap();
        assert_eq!(r.endpoint, "http://rerank.local/v2/rerank");
    }

    #[tokio::test]
    async fn reranks_descending_by_score() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"index": 0, "relevance_score": 0.2},
                    {"index": 2, "relevance_score": 9.7},
                    {"index": 1, "relevance_score": 4.1}
                ]
            })))
            .mount(&server)
            .await;

        let r = Reranker::from_config(&ProviderConfig {
            base_url: server.uri(),
            api_key: "k".into(),
            model: "rerank-v3".into(),
            dimensions: 0,
        })
        .unwrap()
        .unwrap();

        let docs: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let results = r.rerank("query", &docs).await.unwrap();
        let order: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn empty_results_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})),
            )
            .mount(&server)
            .await;

        let r = Reranker::from_config(&ProviderConfig {
            base_url: server.uri(),
            api_key: "k".into(),
            model: "rerank-v3".into(),
            dimensions: 0,
        })
        .unwrap()
        .unwrap();

        assert!(r.rerank("q", &["a".to_string()]).await.is_err());
    }
}
