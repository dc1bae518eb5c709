//! Document loading from the project `data/` directory.
//!
//! Only plain text and Markdown are handled here; anything else (PDF, HTML)
//! is expected to be converted upstream. Unreadable files are logged and
//! skipped — the builder decides whether an empty corpus is fatal.

use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{KilnError, Result};

/// A loaded source document.
#[derive(Debug, Clone)]
pub struct Document {
    /// Path relative to the data directory, used as the chunk source name.
    pub name: String,
    /// Full UTF-8 text content.
    pub content: String,
}

const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "txt"];

/// Subdirectories of `data/` that hold build artifacts, never documents.
const ARTIFACT_DIRS: &[&str] = &["vectors", "graph"];

/// Load all supported documents under `dir`, sorted by path for
/// deterministic build output. Files that cannot be read (missing
/// permissions, invalid UTF-8) are skipped with a warning.
pub fn load_directory(dir: &Path) -> Result<Vec<Document>> {
    if !dir.is_dir() {
        return Err(KilnError::InvalidInput(format!(
            "data directory {} not found",
            dir.display()
        )));
    }

    let mut docs = Vec::new();

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 1 && e.file_type().is_dir() {
                let name = e.file_name().to_string_lossy();
                return !ARTIFACT_DIRS.contains(&name.as_ref());
            }
            true
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                continue;
            }
        };

        let name = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        docs.push(Document { name, content });
    }

    Ok(docs)
}
