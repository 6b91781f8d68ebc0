//! Query-time retrieval: dual-column dense search and hybrid scoring.
//!
//! Two entry points share the same store:
//!
//! - [`RetrievalEngine::dual_retrieve`] — the embedding-dual-retrieval path.
//!   Waits (bounded) for embedding completion of the accessible ids, embeds
//!   the query, runs one top-k scan per embedding column (content, then QA),
//!   and returns the two blocks concatenated in that order without
//!   deduplication.
//! - [`RetrievalEngine::hybrid_search`] — dense-only, sparse-only (FTS5
//!   BM25), or fused scoring via a weighted linear combination of min-max
//!   normalized scores or Reciprocal Rank Fusion.
//!
//! The completion wait polls on a fixed interval and is always bounded by a
//! deadline; expiry surfaces a retryable [`RetrievalError::NotReady`], never
//! a silent partial result.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetrievalConfig;
use crate::embedding::{blob_to_vec, inner_product, EmbeddingInput, EmbeddingService};
use crate::models::RetrievedChunk;
use crate::progress::ProgressTracker;

/// RRF rank constant; the conventional value from the fusion literature.
const RRF_K: f64 = 60.0;

/// Retrieval failure kinds callers branch on.
#[derive(Debug)]
pub enum RetrievalError {
    /// Embeddings not ready before the deadline. Retryable.
    NotReady { pending: Vec<String> },
    /// The embedding service rejected the query.
    Embedding(String),
    /// Vector-store access failed.
    Store(String),
}

impl std::fmt::Display for RetrievalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalError::NotReady { pending } => write!(
                f,
                "embeddings not ready before deadline ({} pending); retry later",
                pending.len()
            ),
            RetrievalError::Embedding(e) => write!(f, "query embedding failed: {}", e),
            RetrievalError::Store(e) => write!(f, "vector store query failed: {}", e),
        }
    }
}

impl std::error::Error for RetrievalError {}

/// Scoring mode for [`RetrievalEngine::hybrid_search`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Dense,
    Sparse,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dense" => Some(SearchMode::Dense),
            "sparse" => Some(SearchMode::Sparse),
            "hybrid" => Some(SearchMode::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Dense => "dense",
            SearchMode::Sparse => "sparse",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HybridParams {
    pub top_k: usize,
    pub mode: SearchMode,
    pub dense_weight: f64,
    pub sparse_weight: f64,
    pub use_rrf: bool,
}

#[derive(Clone)]
pub struct RetrievalEngine {
    pool: SqlitePool,
    tracker: ProgressTracker,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(pool: SqlitePool, tracker: ProgressTracker, config: RetrievalConfig) -> Self {
        Self {
            pool,
            tracker,
            config,
        }
    }

    /// Block (bounded) until every id is embedded. Unsubmitted ids are
    /// submitted on the first poll; failures and stalls requeue inside the
    /// tracker.
    async fn wait_for_completion(&self, ids: &[String]) -> Result<(), RetrievalError> {
        let poll = Duration::from_secs(self.config.poll_interval_secs);
        let deadline = Instant::now() + Duration::from_secs(self.config.completion_deadline_secs);

        loop {
            let check = self.tracker.check_completion(ids).await;
            if check.all_complete {
                return Ok(());
            }

            for id in &check.requires_embedding {
                if let Err(e) = self.tracker.manually_queue(id).await {
                    tracing::warn!(object_id = %id, error = %e, "failed to submit embedding job");
                }
            }

            if Instant::now() + poll >= deadline {
                let mut pending = check.pending;
                pending.extend(check.requires_embedding);
                return Err(RetrievalError::NotReady { pending });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// The embedding-dual-retrieval path (§ query API). Returns the primary
    /// content-column block followed by the QA-column block; the caller
    /// relies on that ordering.
    pub async fn dual_retrieve(
        &self,
        service: &dyn EmbeddingService,
        query: &str,
        accessible_ids: &[String],
        limit: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        if accessible_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.wait_for_completion(accessible_ids).await?;

        let embedded = service
            .embed(query, EmbeddingInput::Query)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        let mut results = self
            .fetch_dense_candidates(&embedded.vector, accessible_ids, "vector_embedding", limit)
            .await
            .map_err(|e| RetrievalError::Store(e.to_string()))?;
        let qa = self
            .fetch_dense_candidates(&embedded.vector, accessible_ids, "qa_vector_embedding", limit)
            .await
            .map_err(|e| RetrievalError::Store(e.to_string()))?;

        // Simple union: primary block then QA block, not re-ranked.
        results.extend(qa);
        Ok(results)
    }

    /// Dense/sparse/fused search over explicit document ids. Per-document
    /// failures are skipped so one bad document cannot sink the request.
    pub async fn hybrid_search(
        &self,
        service: &dyn EmbeddingService,
        query: &str,
        document_ids: &[String],
        params: &HybridParams,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let query_vec = if params.mode != SearchMode::Sparse {
            Some(
                service
                    .embed(query, EmbeddingInput::Query)
                    .await
                    .map_err(|e| RetrievalError::Embedding(e.to_string()))?
                    .vector,
            )
        } else {
            None
        };

        let mut dense: Vec<RetrievedChunk> = Vec::new();
        let mut sparse: Vec<RetrievedChunk> = Vec::new();

        for doc_id in document_ids {
            let doc_ids = std::slice::from_ref(doc_id);

            if let Some(ref vec) = query_vec {
                match self
                    .fetch_dense_candidates(vec, doc_ids, "vector_embedding", params.top_k)
                    .await
                {
                    Ok(hits) => dense.extend(hits),
                    Err(e) => {
                        tracing::warn!(document_id = %doc_id, error = %e, "dense search failed; skipping document");
                        continue;
                    }
                }
            }

            if params.mode != SearchMode::Dense {
                match self.fetch_sparse_candidates(query, doc_id, params.top_k).await {
                    Ok(hits) => sparse.extend(hits),
                    Err(e) => {
                        tracing::warn!(document_id = %doc_id, error = %e, "sparse search failed; skipping document");
                    }
                }
            }
        }

        let mut fused = match params.mode {
            SearchMode::Dense => dense,
            SearchMode::Sparse => sparse,
            SearchMode::Hybrid => {
                if params.use_rrf {
                    rrf_fuse(dense, sparse)
                } else {
                    linear_fuse(dense, sparse, params.dense_weight, params.sparse_weight)
                }
            }
        };

        fused.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        fused.truncate(params.top_k);
        Ok(fused)
    }

    /// Top-k scan of one embedding column restricted to `src ∈ ids`, ranked
    /// by inner product descending (negated inner-product distance).
    async fn fetch_dense_candidates(
        &self,
        query_vec: &[f32],
        ids: &[String],
        column: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<RetrievedChunk>> {
        // column is one of two compile-time names, never user input.
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, src, content, locations, orig_indexes, char_index, token_count, {col} AS embedding \
             FROM embeddings WHERE src IN ({ph}) AND {col} IS NOT NULL",
            col = column,
            ph = placeholders
        );

        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut candidates: Vec<RetrievedChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let score = inner_product(query_vec, &vec) as f64;
                row_to_chunk(row, score)
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    /// BM25 candidates from the FTS5 mirror for one document.
    async fn fetch_sparse_candidates(
        &self,
        query: &str,
        doc_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<RetrievedChunk>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT e.id, e.src, e.content, e.locations, e.orig_indexes,
                   e.char_index, e.token_count, chunks_fts.rank AS rank
            FROM chunks_fts
            JOIN embeddings e ON e.id = chunks_fts.chunk_id AND e.src = chunks_fts.src
            WHERE chunks_fts MATCH ? AND chunks_fts.src = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(doc_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                // bm25 rank: lower is better; negate so higher = better.
                row_to_chunk(row, -rank)
            })
            .collect())
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow, score: f64) -> RetrievedChunk {
    let locations: String = row.get("locations");
    let orig_indexes: String = row.get("orig_indexes");
    RetrievedChunk {
        content: row.get("content"),
        src: row.get("src"),
        locations: serde_json::from_str(&locations).unwrap_or_default(),
        orig_indexes: serde_json::from_str(&orig_indexes).unwrap_or_default(),
        char_index: row.get::<i64, _>("char_index") as usize,
        token_count: row.get::<i64, _>("token_count") as usize,
        id: row.get("id"),
        score,
    }
}

/// Quote query terms for FTS5 MATCH so user punctuation cannot change the
/// query grammar. Terms are OR'd for recall; BM25 ranks the overlap.
fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Min-max normalize scores to [0, 1]; a uniform list normalizes to 1.0.
fn normalize_scores(hits: &mut [RetrievedChunk]) {
    if hits.is_empty() {
        return;
    }
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);
    for hit in hits {
        hit.score = if (max - min).abs() < f64::EPSILON {
            1.0
        } else {
            (hit.score - min) / (max - min)
        };
    }
}

fn chunk_key(hit: &RetrievedChunk) -> (String, i64) {
    (hit.src.clone(), hit.id)
}

/// Weighted linear combination of normalized dense and sparse scores.
fn linear_fuse(
    mut dense: Vec<RetrievedChunk>,
    mut sparse: Vec<RetrievedChunk>,
    dense_weight: f64,
    sparse_weight: f64,
) -> Vec<RetrievedChunk> {
    normalize_scores(&mut dense);
    normalize_scores(&mut sparse);

    let mut merged: HashMap<(String, i64), RetrievedChunk> = HashMap::new();
    for hit in dense {
        let score = hit.score * dense_weight;
        let mut hit = hit;
        hit.score = score;
        merged.insert(chunk_key(&hit), hit);
    }
    for hit in sparse {
        let key = chunk_key(&hit);
        let weighted = hit.score * sparse_weight;
        match merged.get_mut(&key) {
            Some(existing) => existing.score += weighted,
            None => {
                let mut hit = hit;
                hit.score = weighted;
                merged.insert(key, hit);
            }
        }
    }
    merged.into_values().collect()
}

/// Reciprocal Rank Fusion: each list contributes `1 / (k + rank)`.
fn rrf_fuse(dense: Vec<RetrievedChunk>, sparse: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let mut merged: HashMap<(String, i64), RetrievedChunk> = HashMap::new();
    for list in [dense, sparse] {
        for (rank, hit) in list.into_iter().enumerate() {
            let contribution = 1.0 / (RRF_K + rank as f64 + 1.0);
            let key = chunk_key(&hit);
            match merged.get_mut(&key) {
                Some(existing) => existing.score += contribution,
                None => {
                    let mut hit = hit;
                    hit.score = contribution;
                    merged.insert(key, hit);
                }
            }
        }
    }
    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64, src: &str, score: f64) -> RetrievedChunk {
        RetrievedChunk {
            content: format!("chunk {}", id),
            src: src.to_string(),
            locations: Vec::new(),
            orig_indexes: Vec::new(),
            char_index: 0,
            token_count: 1,
            id,
            score,
        }
    }

    #[test]
    fn search_mode_parsing() {
        assert_eq!(SearchMode::parse("dense"), Some(SearchMode::Dense));
        assert_eq!(SearchMode::parse("sparse"), Some(SearchMode::Sparse));
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("fuzzy"), None);
    }

    #[test]
    fn fts_expr_quotes_and_ors_terms() {
        assert_eq!(fts_match_expr("alpha beta"), "\"alpha\" OR \"beta\"");
        assert_eq!(fts_match_expr("a\"b"), "\"ab\"");
        assert_eq!(fts_match_expr("   "), "");
    }

    #[test]
    fn normalize_scores_unit_range() {
        let mut hits = vec![hit(1, "d", 10.0), hit(2, "d", 5.0), hit(3, "d", 0.0)];
        normalize_scores(&mut hits);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.5).abs() < 1e-9);
        assert!((hits[2].score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_scores_uniform_is_one() {
        let mut hits = vec![hit(1, "d", 3.0), hit(2, "d", 3.0)];
        normalize_scores(&mut hits);
        assert!(hits.iter().all(|h| (h.score - 1.0).abs() < 1e-9));
    }

    #[test]
    fn linear_fuse_weights_channels() {
        let dense = vec![hit(1, "d", 1.0), hit(2, "d", 0.0)];
        let sparse = vec![hit(2, "d", 1.0), hit(1, "d", 0.0)];
        let mut fused = linear_fuse(dense, sparse, 0.7, 0.3);
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        // chunk 1: 0.7·1.0 + 0.3·0.0 = 0.7; chunk 2: 0.3
        assert_eq!(fused[0].id, 1);
        assert!((fused[0].score - 0.7).abs() < 1e-9);
        assert!((fused[1].score - 0.3).abs() < 1e-9);
    }

    #[test]
    fn rrf_rewards_presence_in_both_lists() {
        let dense = vec![hit(1, "d", 0.9), hit(2, "d", 0.8)];
        let sparse = vec![hit(2, "d", 5.0), hit(3, "d", 4.0)];
        let mut fused = rrf_fuse(dense, sparse);
        fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        // chunk 2 appears rank 2 dense + rank 1 sparse, beating both singles.
        assert_eq!(fused[0].id, 2);
        let expected = 1.0 / 62.0 + 1.0 / 61.0;
        assert!((fused[0].score - expected).abs() < 1e-9);
    }

    #[test]
    fn rrf_is_score_scale_invariant() {
        let dense_small = vec![hit(1, "d", 0.01), hit(2, "d", 0.001)];
        let dense_big = vec![hit(1, "d", 1000.0), hit(2, "d", 500.0)];
        let sparse = vec![hit(2, "d", 1.0)];
        let a = rrf_fuse(dense_small, sparse.clone());
        let b = rrf_fuse(dense_big, sparse);
        let score = |hits: &[RetrievedChunk], id| {
            hits.iter().find(|h| h.id == id).unwrap().score
        };
        assert!((score(&a, 1) - score(&b, 1)).abs() < 1e-12);
        assert!((score(&a, 2) - score(&b, 2)).abs() < 1e-12);
    }
}
