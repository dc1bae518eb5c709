//! Project scaffolding for `kiln init <name>`.

use std::path::Path;

use crate::error::{KilnError, Result};

/// Create a new agent project directory under the current directory.
pub fn scaffold_project(name: &str) -> Result<()> {
    scaffold_at(Path::new("."), name)
}

/// Create `<parent>/<name>` with a starter manifest and a sample document.
/// Refuses to touch an existing directory.
pub fn scaffold_at(parent: &Path, name: &str) -> Result<()> {
    let dir = parent.join(name);
    if dir.exists() {
        return Err(KilnError::InvalidInput(format!(
            "directory {name} already exists"
        )));
    }

    std::fs::create_dir_all(dir.join("data"))?;

    let display_name = name.replace(['-', '_'], " ");
    let manifest = format!(
        r#"# Agent manifest — edit before running 'kiln build'.
agent:
  name: {display_name}
  description: An expert agent built from your documents
  version: 0.1.0
  system_prompt: |
    You are {display_name}, an expert assistant. Answer questions using the
    retrieved knowledge base context. When the context does not cover a
    question, say so instead of guessing.

runtime:
  embedder:
    # Must match the native output size of your embedding model.
    dimensions: 1024
    # Set true for local embedders to fan out across all CPU cores.
    parallel: false

mcp:
  tools: []

server:
  port: 8000
  cors_origins: ["*"]
"#
    );
    std::fs::write(dir.join("agent.yaml"), manifest)?;

    let sample = format!(
        "# Welcome to {display_name}\n\n\
         Drop your knowledge documents (.md or .txt) into this data/ directory,\n\
         then run 'kiln build' to compile them into the agent's databases.\n"
    );
    std::fs::write(dir.join("data").join("welcome.md"), sample)?;

    println!("Created agent project: {name}/");
    println!("  {name}/agent.yaml    — agent manifest");
    println!("  {name}/data/         — put your documents here");
    println!("\nNext steps:");
    println!("  1. Add documents to {name}/data/");
    println!("  2. kiln build --dir {name}");
    println!("  3. kiln serve --dir {name}");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::AgentManifest;

    #[test]
    fn scaffold_creates_loadable_manifest() {
        let tmp = tempfile::tempdir().unwrap();

        scaffold_at(tmp.path(), "star-guide").unwrap();
        let manifest =
            AgentManifest::load(&tmp.path().join("star-guide").join("agent.yaml")).unwrap();
        assert_eq!(manifest.agent.name, "star guide");
        assert_eq!(manifest.dimensions(), 1024);
        assert!(tmp.path().join("star-guide/data/welcome.md").exists());
    }

    #[test]
    fn scaffold_refuses_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        scaffold_at(tmp.path(), "agent").unwrap();
        let err = scaffold_at(tmp.path(), "agent").unwrap_err();
        assert!(matches!(err, KilnError::InvalidInput(_)));
    }
}
