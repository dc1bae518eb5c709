//! Triple graph store with lexical retrieval.
//!
//! Deliberately not a semantic engine: facts are scored by counting how many
//! distinct query tokens (lowercased, length ≥ 3) appear, case-insensitively,
//! anywhere in the concatenated subject/predicate/object text. That keeps
//! retrieval explainable and dependency-free — the vector index carries the
//! semantic load. Do not swap in a smarter scheme; the ordering is contract.
//!
//! Persistence mirrors the vector index: one SQLite file per store directory,
//! rewritten in a single transaction.

use std::collections::HashSet;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::error::{KilnError, Result};
use crate::llm::Triple;

const DB_FILE: &str = "facts.sqlite";

/// A scored fact returned from [`GraphStore::search`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct GraphFact {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub score: f64,
}

/// In-memory triple set with SQLite persistence.
#[derive(Default, Debug)]
pub struct GraphStore {
    triples: Vec<Triple>,
    seen: HashSet<Triple>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored triples.
    pub fn count(&self) -> usize {
        self.triples.len()
    }

    /// Insert triples, trimming fields, dropping any with an empty field,
    /// and deduplicating exact repeats.
    pub fn add_many(&mut self, triples: Vec<Triple>) {
        for t in triples {
            let t = Triple {
                subject: t.subject.trim().to_string(),
                predicate: t.predicate.trim().to_string(),
                object: t.object.trim().to_string(),
            };
            if t.subject.is_empty() || t.predicate.is_empty() || t.object.is_empty() {
                continue;
            }
            if self.seen.insert(t.clone()) {
                self.triples.push(t);
            }
        }
    }

    /// Token-overlap search: facts with at least one matching query token,
    /// ordered by score descending with insertion order as the tie-break,
    /// truncated to `k`.
    pub fn search(&self, query: &str, k: usize) -> Vec<GraphFact> {
        let tokens: Vec<String> = query
            .split_ascii_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() >= 3)
            .collect();
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut results: Vec<GraphFact> = self
            .triples
            .iter()
            .filter_map(|t| {
                let combined =
                    format!("{} {} {}", t.subject, t.predicate, t.object).to_lowercase();
                let score = tokens.iter().filter(|tok| combined.contains(tok.as_str())).count();
                if score > 0 {
                    Some(GraphFact {
                        subject: t.subject.clone(),
                        predicate: t.predicate.clone(),
                        object: t.object.clone(),
                        score: score as f64,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Stable sort keeps insertion order among equal scores.
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        results
    }

    /// Load a persisted graph from `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        let db_path = dir.join(DB_FILE);
        if !db_path.exists() {
            return Err(KilnError::NotFound(format!(
                "graph store {} (run 'kiln build' first)",
                db_path.display()
            )));
        }

        let pool = connect(&db_path, false).await?;
        let rows =
            sqlx::query("SELECT subject, predicate, object FROM triples ORDER BY position")
                .fetch_all(&pool)
                .await?;
        pool.close().await;

        let mut store = Self::new();
        store.add_many(
            rows.into_iter()
                .map(|row| Triple {
                    subject: row.get("subject"),
                    predicate: row.get("predicate"),
                    object: row.get("object"),
                })
                .collect(),
        );
        Ok(store)
    }

    /// Persist all triples to `dir` inside one transaction.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let pool = connect(&db_path, true).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS triples (
                position INTEGER PRIMARY KEY,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                UNIQUE(subject, predicate, object)
            )",
        )
        .execute(&pool)
        .await?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM triples").execute(&mut *tx).await?;
        for (position, t) in self.triples.iter().enumerate() {
            sqlx::query(
                "INSERT INTO triples (position, subject, predicate, object) VALUES (?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&t.subject)
            .bind(&t.predicate)
            .bind(&t.object)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        pool.close().await;
        Ok(())
    }
}

/// Render facts as a readable context block; empty input yields an empty
/// string so the section can be omitted entirely.
pub fn format_facts(facts: &[GraphFact]) -> String {
    if facts.is_empty() {
        return String::new();
    }
    let mut out = String::from("Knowledge Graph Facts:\n");
    for f in facts {
        out.push_str(&format!("- {} {} {}\n", f.subject, f.predicate, f.object));
    }
    out
}

async fn connect(db_path: &Path, create: bool) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(|e| KilnError::internal("sqlite options", e))?
        .create_if_missing(create)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?)
}
