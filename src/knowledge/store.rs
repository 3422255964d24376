//! SQLite-backed vector store with hybrid retrieval.
//!
//! Chunks are keyed by `{namespace, kind, target_id, chunk_id}` and carry a
//! dense embedding as a little-endian f32 BLOB. Ranking blends semantic and
//! keyword scores: `alpha * cosine + (1 - alpha) * keyword_overlap`. Chunks
//! whose embedding is missing score zero on the semantic term but still
//! participate in the keyword term.

use crate::error::Result;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use std::path::Path;

/// Namespaced knowledge categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Contract,
    BugReport,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Contract => "contract",
            ChunkKind::BugReport => "bug_report",
        }
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk to insert.
pub struct ChunkInsert<'a> {
    pub namespace: &'a str,
    pub kind: ChunkKind,
    /// Canonical target id for contract chunks; `None` for bug reports.
    pub target_id: Option<&'a str>,
    /// Class FQN used by the `target_class` retrieval filter.
    pub target_class: Option<&'a str>,
    pub chunk_id: &'a str,
    pub content: &'a str,
    pub tags: &'a [String],
    pub metadata: serde_json::Value,
    /// `None` marks the chunk `embedding_missing`.
    pub embedding: Option<&'a [f32]>,
}

/// Retrieval filters; all optional, combined with AND.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub kind: Option<ChunkKind>,
    pub target_class: Option<String>,
    pub tag: Option<String>,
}

/// A scored retrieval hit.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub kind: String,
    pub target_id: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub score: f64,
}

#[derive(FromRow)]
struct ChunkRow {
    chunk_id: String,
    kind: String,
    target_id: String,
    content: String,
    tags: String,
    metadata: String,
    embedding: Option<Vec<u8>>,
    seq: i64,
}

/// Vector store backed by its own SQLite database.
#[derive(Clone)]
pub struct VectorStore {
    pool: Pool<Sqlite>,
}

impl VectorStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                kind TEXT NOT NULL,
                target_id TEXT NOT NULL DEFAULT '',
                target_class TEXT,
                chunk_id TEXT NOT NULL,
                content TEXT NOT NULL,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(namespace, kind, target_id, chunk_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_ns_kind ON chunks(namespace, kind)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace one chunk.
    pub async fn insert(&self, chunk: ChunkInsert<'_>) -> Result<()> {
        let tags_json = serde_json::to_string(chunk.tags)
            .unwrap_or_else(|_| "[]".to_string());
        let metadata_json = chunk.metadata.to_string();
        let embedding_blob = chunk.embedding.map(encode_embedding);

        sqlx::query(
            r#"
            INSERT INTO chunks
                (namespace, kind, target_id, target_class, chunk_id, content, tags, metadata, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, kind, target_id, chunk_id) DO UPDATE SET
                content = excluded.content,
                tags = excluded.tags,
                metadata = excluded.metadata,
                embedding = excluded.embedding
            "#,
        )
        .bind(chunk.namespace)
        .bind(chunk.kind.as_str())
        // Empty string rather than NULL so the uniqueness constraint (and
        // upsert) applies to chunks without a target.
        .bind(chunk.target_id.unwrap_or(""))
        .bind(chunk.target_class)
        .bind(chunk.chunk_id)
        .bind(chunk.content)
        .bind(tags_json)
        .bind(metadata_json)
        .bind(embedding_blob)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hybrid search within a namespace. Returns at most `k` hits, best
    /// first; ties broken by insertion recency. Zero hits is an empty list,
    /// never an error.
    pub async fn search(
        &self,
        namespace: &str,
        query_text: &str,
        query_embedding: Option<&[f32]>,
        filter: &ChunkFilter,
        k: usize,
        alpha: f64,
    ) -> Result<Vec<RetrievedChunk>> {
        let mut sql = String::from(
            "SELECT chunk_id, kind, target_id, content, tags, metadata, embedding, seq \
             FROM chunks WHERE namespace = ?",
        );
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if filter.target_class.is_some() {
            sql.push_str(" AND target_class = ?");
        }
        if filter.tag.is_some() {
            sql.push_str(" AND tags LIKE ?");
        }

        let mut query = sqlx::query_as::<_, ChunkRow>(&sql).bind(namespace);
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(target_class) = &filter.target_class {
            query = query.bind(target_class.clone());
        }
        if let Some(tag) = &filter.tag {
            query = query.bind(format!("%\"{tag}\"%"));
        }

        let rows = query.fetch_all(&self.pool).await?;

        let query_terms = tokenize(query_text);
        let mut scored: Vec<(f64, i64, RetrievedChunk)> = rows
            .into_iter()
            .map(|row| {
                let semantic = match (query_embedding, row.embedding.as_deref()) {
                    (Some(query_vec), Some(blob)) => {
                        let chunk_vec = decode_embedding(blob);
                        normalized_cosine(query_vec, &chunk_vec)
                    }
                    _ => 0.0,
                };
                let keyword = keyword_overlap(&query_terms, &row.content);
                let score = alpha * semantic + (1.0 - alpha) * keyword;

                let tags: Vec<String> =
                    serde_json::from_str(&row.tags).unwrap_or_default();
                let metadata: serde_json::Value = serde_json::from_str(&row.metadata)
                    .unwrap_or(serde_json::Value::Null);

                (
                    score,
                    row.seq,
                    RetrievedChunk {
                        chunk_id: row.chunk_id,
                        kind: row.kind,
                        target_id: (!row.target_id.is_empty()).then_some(row.target_id),
                        content: row.content,
                        tags,
                        metadata,
                        score,
                    },
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(score, _, mut chunk)| {
                chunk.score = score;
                chunk
            })
            .collect())
    }

    /// Delete every chunk in a namespace. Idempotent.
    pub async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of chunks in a namespace (used by indexing reports).
    pub async fn count(&self, namespace: &str) -> Result<i64> {
        #[derive(FromRow)]
        struct CountRow {
            n: i64,
        }
        let row = sqlx::query_as::<_, CountRow>(
            "SELECT COUNT(*) AS n FROM chunks WHERE namespace = ?",
        )
        .bind(namespace)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.n)
    }
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity mapped from [-1, 1] into [0, 1].
fn normalized_cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += (*x as f64).powi(2);
        norm_b += (*y as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    (cosine + 1.0) / 2.0
}

fn tokenize(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_string())
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Fraction of distinct query terms present in the content.
fn keyword_overlap(query_terms: &[String], content: &str) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let hits = query_terms
        .iter()
        .filter(|t| content_lower.contains(t.as_str()))
        .count();
    hits as f64 / query_terms.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, VectorStore) {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::new(&dir.path().join("knowledge.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn insert_chunk<'a>(
        chunk_id: &'a str,
        content: &'a str,
        tags: &'a [String],
        embedding: Option<&'a [f32]>,
    ) -> ChunkInsert<'a> {
        ChunkInsert {
            namespace: "run1",
            kind: ChunkKind::BugReport,
            target_id: None,
            target_class: None,
            chunk_id,
            content,
            tags,
            metadata: serde_json::json!({}),
            embedding,
        }
    }

    #[test]
    fn test_embedding_roundtrip() {
        let vector = vec![0.5f32, -1.25, 3.0];
        let blob = encode_embedding(&vector);
        assert_eq!(blob.len(), 12);
        assert_eq!(decode_embedding(&blob), vector);
    }

    #[test]
    fn test_normalized_cosine_bounds() {
        let a = vec![1.0f32, 0.0];
        let b = vec![1.0f32, 0.0];
        let c = vec![-1.0f32, 0.0];
        assert!((normalized_cosine(&a, &b) - 1.0).abs() < 1e-9);
        assert!(normalized_cosine(&a, &c).abs() < 1e-9);
        assert_eq!(normalized_cosine(&a, &[]), 0.0);
        assert_eq!(normalized_cosine(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_keyword_overlap() {
        let terms = tokenize("divide by zero exception");
        let full = keyword_overlap(&terms, "Division by ZERO raises an exception");
        let partial = keyword_overlap(&terms, "zero");
        assert!(full > partial);
        assert!(partial > 0.0);
        assert_eq!(keyword_overlap(&[], "anything"), 0.0);
    }

    #[tokio::test]
    async fn test_insert_and_keyword_search() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        store
            .insert(insert_chunk("c1", "boundary check on quantity", &no_tags, None))
            .await
            .unwrap();
        store
            .insert(insert_chunk("c2", "thread race in cache", &no_tags, None))
            .await
            .unwrap();

        let hits = store
            .search("run1", "quantity boundary", None, &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_semantic_term_dominates_with_embeddings() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        let near = vec![1.0f32, 0.0];
        let far = vec![-1.0f32, 0.0];
        store
            .insert(insert_chunk("near", "unrelated words entirely", &no_tags, Some(&near)))
            .await
            .unwrap();
        store
            .insert(insert_chunk("far", "unrelated words entirely", &no_tags, Some(&far)))
            .await
            .unwrap();

        let query_vec = vec![1.0f32, 0.0];
        let hits = store
            .search("run1", "zzz", Some(&query_vec), &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "near");
    }

    #[tokio::test]
    async fn test_missing_embedding_still_scores_keywords() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        store
            .insert(insert_chunk("m", "null check removed from validator", &no_tags, None))
            .await
            .unwrap();

        let query_vec = vec![1.0f32, 0.0];
        let hits = store
            .search("run1", "null check", Some(&query_vec), &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_tag_filter() {
        let (_dir, store) = temp_store().await;
        let boundary_tags = vec!["boundary".to_string()];
        let mock_tags = vec!["mock".to_string()];
        store
            .insert(insert_chunk("b", "off by one in range check", &boundary_tags, None))
            .await
            .unwrap();
        store
            .insert(insert_chunk("m", "missing stub for repository", &mock_tags, None))
            .await
            .unwrap();

        let filter = ChunkFilter {
            tag: Some("boundary".into()),
            ..ChunkFilter::default()
        };
        let hits = store
            .search("run1", "check", None, &filter, 5, 0.7)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "b");
    }

    #[tokio::test]
    async fn test_ties_broken_by_recency() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        store
            .insert(insert_chunk("older", "identical content here", &no_tags, None))
            .await
            .unwrap();
        store
            .insert(insert_chunk("newer", "identical content here", &no_tags, None))
            .await
            .unwrap();

        let hits = store
            .search("run1", "identical content", None, &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert_eq!(hits[0].chunk_id, "newer");
    }

    #[tokio::test]
    async fn test_clear_namespace_idempotent() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        store
            .insert(insert_chunk("c", "content", &no_tags, None))
            .await
            .unwrap();
        assert_eq!(store.count("run1").await.unwrap(), 1);

        store.clear_namespace("run1").await.unwrap();
        assert_eq!(store.count("run1").await.unwrap(), 0);
        // Clearing again is a no-op, not an error.
        store.clear_namespace("run1").await.unwrap();
    }

    #[tokio::test]
    async fn test_search_empty_store_returns_empty() {
        let (_dir, store) = temp_store().await;
        let hits = store
            .search("run1", "anything", None, &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_insert_replaces_on_conflict() {
        let (_dir, store) = temp_store().await;
        let no_tags: Vec<String> = vec![];
        store
            .insert(insert_chunk("c", "version one", &no_tags, None))
            .await
            .unwrap();
        store
            .insert(insert_chunk("c", "version two", &no_tags, None))
            .await
            .unwrap();
        assert_eq!(store.count("run1").await.unwrap(), 1);

        let hits = store
            .search("run1", "version", None, &ChunkFilter::default(), 5, 0.7)
            .await
            .unwrap();
        assert!(hits[0].content.contains("version two"));
    }
}
