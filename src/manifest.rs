//! Agent manifest (`agent.yaml`) loading and mutation.
//!
//! The manifest is the single editable descriptor of an agent: identity,
//! system prompt, declared embedding dimension, MCP tool list, and server
//! settings. The builder mutates exactly one section (`mcp.tools`); every
//! other key — including keys this version does not know about — must
//! survive a load → mutate → save round trip. Unknown keys are captured by
//! `#[serde(flatten)]` maps at every level.
//!
//! The declared dimension in `runtime.embedder.dimensions` is the single
//! source of truth for vector length everywhere in the system.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentManifest {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub mcp: McpSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeSection {
    #[serde(default)]
    pub embedder: EmbedderSection,
    /// Model context budget used to auto-tune chunking; absent means the
    /// chunker defaults apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_token_limit: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbedderSection {
    #[serde(default)]
    pub dimensions: usize,
    /// Embed all chunks concurrently (one worker per CPU). Meant for local
    /// embedders; hosted APIs should leave this off and get the sequential
    /// batched path with rate-limit backoff.
    #[serde(default)]
    pub parallel: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpSection {
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl AgentManifest {
    /// Read and parse a manifest from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            KilnError::InvalidConfig(format!("read agent manifest {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&data)
            .map_err(|e| KilnError::InvalidConfig(format!("parse agent manifest: {e}")))
    }

    /// Serialize the manifest back to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)
            .map_err(|e| KilnError::Internal(format!("serialize agent manifest: {e}")))?;
        std::fs::write(path, data).map_err(|e| {
            KilnError::Internal(format!("write agent manifest {}: {e}", path.display()))
        })
    }

    /// Lowercased agent name with spaces replaced by underscores, suitable
    /// for tool names and identifiers.
    pub fn slug(&self) -> String {
        let name = if self.agent.name.is_empty() {
            "agent"
        } else {
            &self.agent.name
        };
        name.to_lowercase().replace(' ', "_")
    }

    /// The declared embedding dimension `D`.
    pub fn dimensions(&self) -> usize {
        self.runtime.embedder.dimensions
    }

    /// Replace the MCP tool list with the single knowledge-search tool.
    pub fn set_knowledge_tool(&mut self, description: String) {
        self.mcp.tools = vec![ToolSpec {
            name: format!("search_{}_knowledge", self.slug()),
            description,
        }];
    }

    /// Fallback tool description used when generation fails.
    pub fn default_tool_description(&self) -> String {
        format!(
            "Search the {} expert knowledge base for relevant information.",
            self.slug()
        )
    }
}
