//! Knowledge base: retrieval-augmented context for generation prompts.
//!
//! Source contracts and bug reports are chunked, embedded, and stored in a
//! per-run vector namespace. Retrieval blends semantic and keyword scores.
//! When disabled by configuration, retrieval returns empty and prompts omit
//! their context section; nothing else changes.

pub mod bug_parser;
pub mod chunker;
pub mod embedding;
pub mod store;

use crate::error::Result;
use crate::models::Target;
use bug_parser::BugReportParser;
use chunker::{chunk_prose, MethodSpan};
use embedding::EmbeddingClient;
use std::path::PathBuf;
use store::{ChunkFilter, ChunkInsert, ChunkKind, RetrievedChunk, VectorStore};

/// Token budget for one prose chunk.
const PROSE_CHUNK_TOKENS: usize = 500;

/// Outcome of an indexing pass. Per-chunk failures never abort the run;
/// they are logged and counted here.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexReport {
    pub chunks_indexed: usize,
    pub embedding_failures: usize,
}

/// Facade over the vector store and embedding client.
pub struct KnowledgeBase {
    store: VectorStore,
    embedder: EmbeddingClient,
    enabled: bool,
    namespace: String,
    alpha: f64,
}

impl KnowledgeBase {
    pub fn new(
        store: VectorStore,
        embedder: EmbeddingClient,
        enabled: bool,
        namespace: impl Into<String>,
        alpha: f64,
    ) -> Self {
        Self {
            store,
            embedder,
            enabled,
            namespace: namespace.into(),
            alpha,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Index one target's contract: its method chunk plus the class-level
    /// chunk (fields and class javadoc, deduplicated across targets of the
    /// same class by chunk id).
    pub async fn index_source(&self, target: &Target, class_source: &str) -> Result<IndexReport> {
        if !self.enabled {
            return Ok(IndexReport::default());
        }

        let span = MethodSpan {
            name: target.id.method_name.clone(),
            line_start: target.line_start,
            line_end: target.line_end,
        };
        let chunks = chunker::chunk_code(class_source, std::slice::from_ref(&span));

        let mut report = IndexReport::default();
        for chunk in chunks {
            let is_method_chunk = chunk.method_name.is_some();
            let chunk_id = if is_method_chunk {
                format!("method:{}", target.id.canonical())
            } else {
                "class".to_string()
            };

            let metadata = serde_json::json!({
                "javadoc": target.javadoc,
                "signature": target.signature,
                "preconditions": {
                    "null_checks": target.facts.null_checks,
                    "boundary_checks": target.facts.boundary_checks,
                },
                "raised_errors": target.facts.exception_handling,
                "source_path": target.file_path,
                "line_range": [chunk.line_start, chunk.line_end],
            });

            let embedding = self.embed_or_missing(&chunk.content, &mut report).await;
            let target_id = is_method_chunk.then(|| target.id.canonical());
            self.store
                .insert(ChunkInsert {
                    namespace: &self.namespace,
                    kind: ChunkKind::Contract,
                    target_id: target_id.as_deref(),
                    target_class: Some(&target.id.class_fqn),
                    chunk_id: &chunk_id,
                    content: &chunk.content,
                    tags: &[],
                    metadata,
                    embedding: embedding.as_deref(),
                })
                .await?;
            report.chunks_indexed += 1;
        }

        Ok(report)
    }

    /// Index bug reports from files and/or directories.
    pub async fn index_bug_reports(&self, paths: &[PathBuf]) -> Result<IndexReport> {
        if !self.enabled {
            return Ok(IndexReport::default());
        }

        let mut parser = BugReportParser::new();
        let mut reports = Vec::new();
        for path in paths {
            if path.is_dir() {
                reports.extend(parser.parse_directory(path));
            } else if let Some(report) = parser.parse_file(path) {
                reports.push(report);
            }
        }

        let mut index_report = IndexReport::default();
        for bug in &reports {
            let text = format!("# {}\n\n{}", bug.title, bug.content);
            for (i, chunk) in chunk_prose(&text, PROSE_CHUNK_TOKENS).iter().enumerate() {
                let chunk_id = format!("{}:{}", bug.id, i);
                let metadata = serde_json::json!({
                    "title": bug.title,
                    "heading": chunk.heading,
                    "source_path": bug.file_path,
                    "file_type": bug.file_type,
                });

                let embedding = self.embed_or_missing(&chunk.content, &mut index_report).await;
                self.store
                    .insert(ChunkInsert {
                        namespace: &self.namespace,
                        kind: ChunkKind::BugReport,
                        target_id: None,
                        target_class: None,
                        chunk_id: &chunk_id,
                        content: &chunk.content,
                        tags: &bug.tags,
                        metadata,
                        embedding: embedding.as_deref(),
                    })
                    .await?;
                index_report.chunks_indexed += 1;
            }
        }

        tracing::info!(
            "indexed {} bug report chunks ({} embedding failures)",
            index_report.chunks_indexed,
            index_report.embedding_failures
        );
        Ok(index_report)
    }

    async fn embed_or_missing(
        &self,
        content: &str,
        report: &mut IndexReport,
    ) -> Option<Vec<f32>> {
        match self.embedder.embed(content).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                // The chunk stays retrievable through the keyword term.
                tracing::warn!("chunk marked embedding_missing: {e}");
                report.embedding_failures += 1;
                None
            }
        }
    }

    /// Retrieve the top-`k` chunks for a query. Returns an empty list when
    /// disabled or when nothing matches; never an error for zero hits.
    pub async fn retrieve(
        &self,
        query_text: &str,
        filter: &ChunkFilter,
        k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if !self.enabled || k == 0 {
            return Ok(Vec::new());
        }

        let query_embedding = match self.embedder.embed(query_text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!("query embedding failed, keyword-only retrieval: {e}");
                None
            }
        };

        self.store
            .search(
                &self.namespace,
                query_text,
                query_embedding.as_deref(),
                filter,
                k,
                self.alpha,
            )
            .await
    }

    /// Delete this run's namespace. Idempotent.
    pub async fn clear_namespace(&self) -> Result<()> {
        self.store.clear_namespace(&self.namespace).await
    }
}

/// Render retrieved chunks into the prompt context section. `None` when
/// there is nothing to show (the prompt omits the section entirely).
pub fn format_context(chunks: &[RetrievedChunk]) -> Option<String> {
    if chunks.is_empty() {
        return None;
    }

    let mut sections = Vec::new();

    let contracts: Vec<_> = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::Contract.as_str())
        .collect();
    if !contracts.is_empty() {
        let mut lines = vec!["## Method contracts".to_string()];
        for chunk in contracts {
            lines.push(chunk.content.clone());
        }
        sections.push(lines.join("\n\n"));
    }

    let bugs: Vec<_> = chunks
        .iter()
        .filter(|c| c.kind == ChunkKind::BugReport.as_str())
        .collect();
    if !bugs.is_empty() {
        let mut lines = vec!["## Related bug reports".to_string()];
        for chunk in bugs {
            let title = chunk
                .metadata
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("report");
            let tags = if chunk.tags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", chunk.tags.join(", "))
            };
            lines.push(format!("### {title}{tags}\n{}", chunk.content));
        }
        sections.push(lines.join("\n\n"));
    }

    Some(sections.join("\n\n"))
}
