use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Connection details for a single AI provider.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    /// Embedding dimensionality. Only meaningful for the embedder; the
    /// manifest's declared dimension overrides it when set.
    #[serde(default)]
    pub dimensions: usize,
}

/// Unified application configuration used by both `build` and `serve`.
///
/// Resolution order: environment variables override `~/.kiln/config.yaml`,
/// which overrides built-in defaults. The same binary thus works from a
/// shell (config file) and from a container (env vars only).
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: ProviderConfig,
    #[serde(default)]
    pub embedder: ProviderConfig,
    #[serde(default)]
    pub reranker: ProviderConfig,
    /// Listen port. `None` falls back to the manifest's port, then 8000.
    #[serde(default)]
    pub port: Option<u16>,
    /// When set, every route except `/health` requires
    /// `Authorization: Bearer <key>`.
    #[serde(default)]
    pub agent_api_key: Option<String>,
}

/// Default listen port when neither config nor manifest specifies one.
pub const DEFAULT_PORT: u16 = 8000;

/// Default embedding dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 1024;

/// Returns the path to `~/.kiln/config.yaml`.
pub fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| KilnError::InvalidConfig("cannot determine home directory".into()))?;
    Ok(home.join(".kiln").join("config.yaml"))
}

/// Load the unified config from `path` (missing file is fine — env vars may
/// carry everything), then apply environment overrides and defaults.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let resolved;
    let path = match path {
        Some(p) => p,
        None => {
            resolved = default_config_path()?;
            &resolved
        }
    };

    let mut cfg: AppConfig = match std::fs::read_to_string(path) {
        Ok(content) => serde_yaml::from_str(&content)
            .map_err(|e| KilnError::InvalidConfig(format!("parse {}: {e}", path.display())))?,
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => {
            return Err(KilnError::InvalidConfig(format!(
                "read {}: {e}",
                path.display()
            )))
        }
    };

    apply_env(&mut cfg.llm.base_url, "LLM_BASE_URL");
    apply_env(&mut cfg.llm.api_key, "LLM_API_KEY");
    apply_env(&mut cfg.llm.model, "LLM_MODEL");

    apply_env(&mut cfg.embedder.base_url, "EMBED_BASE_URL");
    apply_env(&mut cfg.embedder.api_key, "EMBED_API_KEY");
    apply_env(&mut cfg.embedder.model, "EMBED_MODEL");
    if let Some(dims) = env_usize("EMBED_DIMENSIONS") {
        cfg.embedder.dimensions = dims;
    }
    if cfg.embedder.dimensions == 0 {
        cfg.embedder.dimensions = DEFAULT_DIMENSIONS;
    }

    apply_env(&mut cfg.reranker.base_url, "RERANK_BASE_URL");
    apply_env(&mut cfg.reranker.api_key, "RERANK_API_KEY");
    apply_env(&mut cfg.reranker.model, "RERANK_MODEL");

    if let Ok(port) = std::env::var("PORT") {
        if let Ok(p) = port.parse::<u16>() {
            if p > 0 {
                cfg.port = Some(p);
            }
        }
    }

    if let Ok(key) = std::env::var("AGENT_API_KEY") {
        if !key.is_empty() {
            cfg.agent_api_key = Some(key);
        }
    }

    Ok(cfg)
}

fn apply_env(dst: &mut String, key: &str) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *dst = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok().filter(|n| *n > 0)
}

/// Checks that the LLM provider is fully configured.
pub fn validate_llm(cfg: &AppConfig) -> Result<()> {
    let mut missing = Vec::new();
    if cfg.llm.base_url.is_empty() {
        missing.push("llm.base_url / LLM_BASE_URL");
    }
    if cfg.llm.api_key.is_empty() {
        missing.push("llm.api_key / LLM_API_KEY");
    }
    if cfg.llm.model.is_empty() {
        missing.push("llm.model / LLM_MODEL");
    }
    if !missing.is_empty() {
        return Err(KilnError::InvalidConfig(format!(
            "missing required config: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Checks that the embedding provider is configured. The model is optional
/// (embedding routers pick their own), the dimension must be positive.
pub fn validate_embedder(cfg: &AppConfig) -> Result<()> {
    let mut missing = Vec::new();
    if cfg.embedder.base_url.is_empty() {
        missing.push("embedder.base_url / EMBED_BASE_URL");
    }
    if cfg.embedder.api_key.is_empty() {
        missing.push("embedder.api_key / EMBED_API_KEY");
    }
    if !missing.is_empty() {
        return Err(KilnError::InvalidConfig(format!(
            "missing required config: {}",
            missing.join(", ")
        )));
    }
    if cfg.embedder.dimensions == 0 {
        return Err(KilnError::InvalidConfig(
            "embedder dimensions must be > 0 (set embedder.dimensions or EMBED_DIMENSIONS)".into(),
        ));
    }
    Ok(())
}

/// Validates everything `kiln build` needs.
pub fn validate_build(cfg: &AppConfig) -> Result<()> {
    validate_llm(cfg)?;
    validate_embedder(cfg)
}

/// Validates everything `kiln serve` needs.
pub fn validate_serve(cfg: &AppConfig) -> Result<()> {
    validate_llm(cfg)?;
    validate_embedder(cfg)
}

impl AppConfig {
    /// True when a reranking provider is configured.
    pub fn reranker_enabled(&self) -> bool {
        !self.reranker.base_url.is_empty() && !self.reranker.model.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load(Some(Path::new("/nonexistent/kiln/config.yaml"))).unwrap();
        assert_eq!(cfg.embedder.dimensions, DEFAULT_DIMENSIONS);
        assert!(cfg.port.is_none());
    }

    #[test]
    fn file_values_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "llm:\n  base_url: http://llm.local/v1\n  api_key: k\n  model: m\nembedder:\n  base_url: http://embed.local/v1\n  api_key: k\n  dimensions: 8\nport: 9001\n",
        )
        .unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.llm.base_url, "http://llm.local/v1");
        assert_eq!(cfg.embedder.dimensions, 8);
        assert_eq!(cfg.port, Some(9001));
        validate_build(&cfg).unwrap();
    }

    #[test]
    fn validate_reports_missing_keys() {
        let cfg = AppConfig::default();
        let err = validate_llm(&cfg).unwrap_err();
        assert!(err.to_string().contains("llm.base_url"));
        assert!(err.to_string().contains("LLM_MODEL"));
    }

    #[test]
    fn reranker_disabled_without_model() {
        let mut cfg = AppConfig::default();
        cfg.reranker.base_url = "http://rerank.local".into();
        assert!(!cfg.reranker_enabled());
        cfg.reranker.model = "rerank-v3".into();
        assert!(cfg.reranker_enabled());
    }
}
