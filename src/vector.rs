//! Dense vector index with cosine-similarity retrieval.
//!
//! A keyed set of `(id, content, metadata, embedding)` records held fully in
//! memory; queries are a flat scan over all vectors, which is fine well past
//! the 10⁶-record mark this tool targets. Persistence is a single SQLite
//! file inside the index directory: a `meta` table pinning the declared
//! dimension and a `records` table with little-endian f32 BLOB embeddings,
//! rewritten atomically inside one transaction.
//!
//! Every stored vector has length exactly equal to the declared dimension;
//! [`VectorIndex::add_many`] rejects anything else.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

use crate::error::{KilnError, Result};

const DB_FILE: &str = "index.sqlite";

/// A record stored in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub content: String,
    pub source: String,
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// A ranked query hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub content: String,
    pub source: String,
    /// Cosine similarity in `[-1, 1]`; replaced by the reranker's score when
    /// reranking is enabled downstream.
    pub similarity: f32,
}

/// In-memory vector index with SQLite persistence.
#[derive(Debug)]
pub struct VectorIndex {
    dimension: usize,
    records: Vec<VectorRecord>,
    by_id: HashMap<String, usize>,
}

impl VectorIndex {
    /// Create an empty index with the declared dimension `D`.
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(KilnError::InvalidConfig(
                "vector dimension must be > 0".into(),
            ));
        }
        Ok(Self {
            dimension,
            records: Vec::new(),
            by_id: HashMap::new(),
        })
    }

    /// The declared dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Insert records in order. An id collision replaces the existing record
    /// in place, keeping its original insertion position.
    pub fn add_many(&mut self, records: Vec<VectorRecord>) -> Result<()> {
        for record in records {
            if record.embedding.len() != self.dimension {
                return Err(KilnError::DimensionMismatch {
                    expected: self.dimension,
                    got: record.embedding.len(),
                });
            }
            match self.by_id.get(&record.id) {
                Some(&pos) => self.records[pos] = record,
                None => {
                    self.by_id.insert(record.id.clone(), self.records.len());
                    self.records.push(record);
                }
            }
        }
        Ok(())
    }

    /// Top-k records by cosine similarity, descending; ties break by
    /// insertion order. An empty index yields an empty result.
    pub fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if embedding.len() != self.dimension {
            return Err(KilnError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.len(),
            });
        }

        let mut scored: Vec<(f32, &VectorRecord)> = self
            .records
            .iter()
            .map(|r| (cosine_similarity(embedding, &r.embedding), r))
            .collect();
        // Stable sort keeps insertion order for equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(similarity, r)| VectorHit {
                id: r.id.clone(),
                content: r.content.clone(),
                source: r.source.clone(),
                similarity,
            })
            .collect())
    }

    /// Load a persisted index from `dir`, verifying the stored dimension
    /// matches the declared one.
    pub async fn open(dir: &Path, dimension: usize) -> Result<Self> {
        let db_path = dir.join(DB_FILE);
        if !db_path.exists() {
            return Err(KilnError::NotFound(format!(
                "vector index {} (run 'kiln build' first)",
                db_path.display()
            )));
        }

        let pool = connect(&db_path, false).await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT value FROM meta WHERE key = 'dimension'")
                .fetch_optional(&pool)
                .await?;
        let stored: usize = stored
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KilnError::Internal("vector index meta is missing dimension".into()))?;
        if stored != dimension {
            pool.close().await;
            return Err(KilnError::InvalidConfig(format!(
                "vector index was built with dimension {stored}, manifest declares {dimension}"
            )));
        }

        let rows = sqlx::query(
            "SELECT id, content, source, chunk_index, embedding FROM records ORDER BY position",
        )
        .fetch_all(&pool)
        .await?;

        let mut index = Self::new(dimension)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            let chunk_index: i64 = row.get("chunk_index");
            records.push(VectorRecord {
                id: row.get("id"),
                content: row.get("content"),
                source: row.get("source"),
                index: chunk_index as usize,
                embedding,
            });
        }
        pool.close().await;

        index.add_many(records)?;
        Ok(index)
    }

    /// Persist the full index to `dir` atomically: the new state becomes
    /// visible only when the transaction commits.
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let pool = connect(&db_path, true).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (
                position INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM records").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM meta").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO meta (key, value) VALUES ('dimension', ?)")
            .bind(self.dimension.to_string())
            .execute(&mut *tx)
            .await?;

        for (position, record) in self.records.iter().enumerate() {
            sqlx::query(
                "INSERT INTO records (position, id, content, source, chunk_index, embedding)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(position as i64)
            .bind(&record.id)
            .bind(&record.content)
            .bind(&record.source)
            .bind(record.index as i64)
            .bind(vec_to_blob(&record.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        pool.close().await;
        Ok(())
    }
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

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors; `0.0` for mismatched lengths or
/// zero-magnitude inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
