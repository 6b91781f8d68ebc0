//! Visual document retrieval (VDR): page-image multi-vector embedding and
//! MaxSim querying.
//!
//! Ingestion runs beside the text pipeline on the same store: download the
//! object, rasterize each page at a fixed DPI, embed every page image into a
//! late-interaction multi-vector set (hundreds of vectors per page), and
//! upsert `document_vdr_pages` rows idempotently. A single page failure is
//! logged and skipped; the document fails only when zero pages succeed.
//! Temporary rasterization files live in a [`tempfile::TempDir`] and are
//! removed on every exit path.
//!
//! Querying embeds the query with the same model into multiple vectors and
//! scores each candidate page by MaxSim: for every query vector take the
//! maximum similarity over the page's vectors, then sum across query
//! vectors. The hybrid mode blends page scores with text-chunk scores per
//! document under independent weights into one tagged result list.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

use crate::embedding::{blob_to_vec, inner_product, vec_to_blob};
use crate::models::{RetrievedChunk, SourceDocument};
use crate::storage::ObjectStore;

/// Pages per progress report during ingestion.
const PROGRESS_EVERY_PAGES: usize = 10;

// ============ Collaborator contracts ============

/// Rasterizes a document into one image file per page at the given DPI.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(&self, document: &Path, out_dir: &Path, dpi: u32) -> Result<Vec<PathBuf>>;
}

/// The visual retrieval model: image (or query text) to a multi-vector
/// late-interaction embedding.
#[async_trait]
pub trait VisualEncoder: Send + Sync {
    async fn embed_image(&self, image: &Path) -> Result<Vec<Vec<f32>>>;
    async fn embed_query(&self, text: &str) -> Result<Vec<Vec<f32>>>;
}

/// Page-granularity ingestion progress (every 10 pages and on completion).
pub trait VdrProgressReporter: Send + Sync {
    fn report(&self, document_id: &str, pages_done: usize, total_pages: usize);
}

/// Human-readable progress on stderr.
pub struct StderrVdrProgress;

impl VdrProgressReporter for StderrVdrProgress {
    fn report(&self, document_id: &str, pages_done: usize, total_pages: usize) {
        eprintln!("vdr {}  embedded {} / {} pages", document_id, pages_done, total_pages);
    }
}

/// No-op reporter when progress is disabled.
pub struct NoVdrProgress;

impl VdrProgressReporter for NoVdrProgress {
    fn report(&self, _: &str, _: usize, _: usize) {}
}

// ============ HTTP visual encoder ============

/// Calls the external visual-retrieval model service: raw image bytes in,
/// `{"vectors": [[...], ...]}` out.
pub struct HttpVisualEncoder {
    url: String,
    client: reqwest::Client,
}

impl HttpVisualEncoder {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { url, client })
    }

    async fn parse_vectors(resp: reqwest::Response) -> Result<Vec<Vec<f32>>> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("visual model error {}: {}", status, body);
        }
        let json: serde_json::Value = resp.json().await?;
        let vectors = json
            .get("vectors")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid visual model response: missing vectors"))?;
        vectors
            .iter()
            .map(|vec| {
                vec.as_array()
                    .map(|vals| vals.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                    .ok_or_else(|| anyhow::anyhow!("invalid visual model response: bad vector"))
            })
            .collect()
    }
}

#[async_trait]
impl VisualEncoder for HttpVisualEncoder {
    async fn embed_image(&self, image: &Path) -> Result<Vec<Vec<f32>>> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("Failed to read page image {}", image.display()))?;
        let resp = self
            .client
            .post(format!("{}/embed-image", self.url))
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        Self::parse_vectors(resp).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<Vec<f32>>> {
        let resp = self
            .client
            .post(format!("{}/embed-query", self.url))
            .json(&serde_json::json!({ "query": text }))
            .send()
            .await?;
        Self::parse_vectors(resp).await
    }
}

// ============ pdfium rasterizer ============

/// Rasterizer backed by pdfium. Rendering is CPU-bound and runs on the
/// blocking pool.
#[cfg(feature = "vdr-pdfium")]
pub struct PdfiumRasterizer;

#[cfg(feature = "vdr-pdfium")]
#[async_trait]
impl PageRasterizer for PdfiumRasterizer {
    async fn rasterize(&self, document: &Path, out_dir: &Path, dpi: u32) -> Result<Vec<PathBuf>> {
        let document = document.to_path_buf();
        let out_dir = out_dir.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            use pdfium_render::prelude::*;

            let pdfium = Pdfium::new(
                Pdfium::bind_to_system_library()
                    .map_err(|e| anyhow::anyhow!("failed to bind pdfium: {}", e))?,
            );
            let doc = pdfium
                .load_pdf_from_file(&document, None)
                .map_err(|e| anyhow::anyhow!("failed to load PDF: {}", e))?;

            let scale = dpi as f32 / 72.0;
            let config = PdfRenderConfig::new().scale_page_by_factor(scale);

            let mut paths = Vec::new();
            for (index, page) in doc.pages().iter().enumerate() {
                let bitmap = page
                    .render_with_config(&config)
                    .map_err(|e| anyhow::anyhow!("failed to render page {}: {}", index + 1, e))?;

                let width = bitmap.width() as u32;
                let height = bitmap.height() as u32;
                let pixel_data = bitmap.as_raw_bytes();

                // BGRA to RGB
                let mut rgb_data = Vec::with_capacity((width * height * 3) as usize);
                for pixel in pixel_data.chunks_exact(4) {
                    rgb_data.push(pixel[2]);
                    rgb_data.push(pixel[1]);
                    rgb_data.push(pixel[0]);
                }

                let rgb: image::RgbImage = image::ImageBuffer::from_raw(width, height, rgb_data)
                    .ok_or_else(|| anyhow::anyhow!("failed to build RGB image from raw data"))?;

                let path = out_dir.join(format!("page-{:04}.png", index + 1));
                rgb.save(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                paths.push(path);
            }
            Ok(paths)
        })
        .await?
    }
}

// ============ Multi-vector blob codec ============

/// Flatten a multi-vector embedding into one BLOB of concatenated
/// little-endian f32 vectors. All vectors must share one dimensionality.
pub fn vecs_to_blob(vecs: &[Vec<f32>]) -> Vec<u8> {
    let mut blob = Vec::new();
    for vec in vecs {
        blob.extend_from_slice(&vec_to_blob(vec));
    }
    blob
}

/// Recover the vectors from a flattened BLOB.
pub fn blob_to_vecs(blob: &[u8], num_vectors: usize) -> Vec<Vec<f32>> {
    if num_vectors == 0 || blob.is_empty() {
        return Vec::new();
    }
    let flat = blob_to_vec(blob);
    let dim = flat.len() / num_vectors;
    if dim == 0 {
        return Vec::new();
    }
    flat.chunks(dim).map(|c| c.to_vec()).collect()
}

// ============ Ingestion ============

/// Ingest one document through the visual pipeline. Idempotent: page rows
/// and the document record are upserted by natural key.
pub async fn ingest_document(
    pool: &SqlitePool,
    store: &dyn ObjectStore,
    rasterizer: &dyn PageRasterizer,
    encoder: &dyn VisualEncoder,
    reporter: &dyn VdrProgressReporter,
    doc: &SourceDocument,
    dpi: u32,
) -> Result<usize> {
    let bytes = store.get_object(&doc.bucket, &doc.key).await?;

    // Dropped on every exit path, taking the rasterized pages with it.
    let temp = tempfile::TempDir::new()?;
    let pdf_path = temp.path().join("source.pdf");
    tokio::fs::write(&pdf_path, &bytes).await?;

    let pages = rasterizer.rasterize(&pdf_path, temp.path(), dpi).await?;
    let total_pages = pages.len();

    let mut embedded_pages = 0usize;
    for (index, page_path) in pages.iter().enumerate() {
        let page_num = index + 1;
        let vectors = match encoder.embed_image(page_path).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => {
                tracing::warn!(document_id = %doc.id, page = page_num, "empty page embedding; skipping page");
                continue;
            }
            Err(e) => {
                tracing::warn!(document_id = %doc.id, page = page_num, error = %e, "page embedding failed; skipping page");
                continue;
            }
        };

        upsert_page(pool, &doc.id, page_num as i64, &vectors).await?;
        embedded_pages += 1;

        if embedded_pages % PROGRESS_EVERY_PAGES == 0 {
            reporter.report(&doc.id, embedded_pages, total_pages);
        }
    }
    reporter.report(&doc.id, embedded_pages, total_pages);

    if embedded_pages == 0 {
        bail!("no pages could be embedded for {}", doc.id);
    }

    upsert_vdr_document(pool, doc).await?;
    Ok(embedded_pages)
}

async fn upsert_page(
    pool: &SqlitePool,
    document_id: &str,
    page_num: i64,
    vectors: &[Vec<f32>],
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO document_vdr_pages (document_id, page_num, embedding_vectors, num_vectors)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(document_id, page_num) DO UPDATE SET
            embedding_vectors = excluded.embedding_vectors,
            num_vectors = excluded.num_vectors
        "#,
    )
    .bind(document_id)
    .bind(page_num)
    .bind(vecs_to_blob(vectors))
    .bind(vectors.len() as i64)
    .execute(pool)
    .await?;
    Ok(())
}

async fn upsert_vdr_document(pool: &SqlitePool, doc: &SourceDocument) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO documents (id, bucket, key, user_id, mime_type, tags_json, metadata_json, pipeline_type, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 'vdr', ?)
        ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            mime_type = excluded.mime_type,
            tags_json = excluded.tags_json,
            metadata_json = excluded.metadata_json,
            pipeline_type = 'vdr'
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.bucket)
    .bind(&doc.key)
    .bind(&doc.user_id)
    .bind(&doc.mime_type)
    .bind(serde_json::to_string(&doc.tags)?)
    .bind(doc.metadata.to_string())
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Query ============

/// A scored VDR page.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VdrPageHit {
    pub document_id: String,
    pub page_num: i64,
    pub score: f64,
}

/// One entry of the blended hybrid result list.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SearchHit {
    VdrPage(VdrPageHit),
    TextChunk(RetrievedChunk),
}

impl SearchHit {
    pub fn score(&self) -> f64 {
        match self {
            SearchHit::VdrPage(h) => h.score,
            SearchHit::TextChunk(h) => h.score,
        }
    }
}

/// MaxSim late-interaction score: per query vector, the best similarity over
/// page vectors; summed across query vectors.
pub fn maxsim(query_vectors: &[Vec<f32>], page_vectors: &[Vec<f32>]) -> f64 {
    if query_vectors.is_empty() || page_vectors.is_empty() {
        return 0.0;
    }
    query_vectors
        .iter()
        .map(|q| {
            page_vectors
                .iter()
                .map(|p| inner_product(q, p) as f64)
                .fold(f64::NEG_INFINITY, f64::max)
        })
        .sum()
}

/// Score every page of the candidate documents by MaxSim against the query.
pub async fn query_pages(
    pool: &SqlitePool,
    encoder: &dyn VisualEncoder,
    query: &str,
    document_ids: &[String],
    top_k: usize,
) -> Result<Vec<VdrPageHit>> {
    if document_ids.is_empty() {
        return Ok(Vec::new());
    }
    let query_vectors = encoder.embed_query(query).await?;

    let placeholders = vec!["?"; document_ids.len()].join(", ");
    let sql = format!(
        "SELECT document_id, page_num, embedding_vectors, num_vectors \
         FROM document_vdr_pages WHERE document_id IN ({})",
        placeholders
    );
    let mut q = sqlx::query(&sql);
    for id in document_ids {
        q = q.bind(id);
    }
    let rows = q.fetch_all(pool).await?;

    let mut hits: Vec<VdrPageHit> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding_vectors");
            let num_vectors: i64 = row.get("num_vectors");
            let page_vectors = blob_to_vecs(&blob, num_vectors as usize);
            VdrPageHit {
                document_id: row.get("document_id"),
                page_num: row.get("page_num"),
                score: maxsim(&query_vectors, &page_vectors),
            }
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);
    Ok(hits)
}

/// Blend VDR page hits and text chunk hits under independent weights.
/// Channel scores are min-max normalized first so the weights compare like
/// with like; the output is one tagged list sorted by blended score.
pub fn blend_hits(
    vdr_hits: Vec<VdrPageHit>,
    text_hits: Vec<RetrievedChunk>,
    vdr_weight: f64,
    text_weight: f64,
    top_k: usize,
) -> Vec<SearchHit> {
    let normalize = |scores: Vec<f64>| -> Vec<f64> {
        let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        scores
            .into_iter()
            .map(|s| {
                if (max - min).abs() < f64::EPSILON {
                    1.0
                } else {
                    (s - min) / (max - min)
                }
            })
            .collect()
    };

    let mut results: Vec<SearchHit> = Vec::new();

    if !vdr_hits.is_empty() {
        let norms = normalize(vdr_hits.iter().map(|h| h.score).collect());
        for (mut hit, norm) in vdr_hits.into_iter().zip(norms) {
            hit.score = norm * vdr_weight;
            results.push(SearchHit::VdrPage(hit));
        }
    }
    if !text_hits.is_empty() {
        let norms = normalize(text_hits.iter().map(|h| h.score).collect());
        for (mut hit, norm) in text_hits.into_iter().zip(norms) {
            hit.score = norm * text_weight;
            results.push(SearchHit::TextChunk(hit));
        }
    }

    results.sort_by(|a, b| {
        b.score()
            .partial_cmp(&a.score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(top_k);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRasterizer {
        pages: usize,
    }

    #[async_trait]
    impl PageRasterizer for FakeRasterizer {
        async fn rasterize(&self, _: &Path, out_dir: &Path, _: u32) -> Result<Vec<PathBuf>> {
            let mut paths = Vec::new();
            for i in 1..=self.pages {
                let path = out_dir.join(format!("page-{:04}.png", i));
                tokio::fs::write(&path, b"png").await?;
                paths.push(path);
            }
            Ok(paths)
        }
    }

    /// Encoder that fails a configurable set of pages.
    struct FakeEncoder {
        fail_all: bool,
        fail_page: Option<usize>,
        calls: AtomicUsize,
    }

    impl FakeEncoder {
        fn new() -> Self {
            Self {
                fail_all: false,
                fail_page: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl VisualEncoder for FakeEncoder {
        async fn embed_image(&self, _: &Path) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_all || self.fail_page == Some(call) {
                bail!("model rejected page");
            }
            Ok(vec![vec![1.0, 0.0], vec![0.0, 1.0]])
        }

        async fn embed_query(&self, _: &str) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0, 0.0]])
        }
    }

    struct CountingReporter {
        reports: AtomicUsize,
    }

    impl VdrProgressReporter for CountingReporter {
        fn report(&self, _: &str, _: usize, _: usize) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn doc(id: &str) -> SourceDocument {
        SourceDocument {
            id: id.to_string(),
            bucket: "uploads".to_string(),
            key: id.rsplit('/').next().unwrap_or(id).to_string(),
            user_id: "user-u".to_string(),
            mime_type: "application/pdf".to_string(),
            tags: Vec::new(),
            metadata: serde_json::json!({}),
        }
    }

    async fn pool_with_object(key: &str) -> (SqlitePool, crate::storage::FsObjectStore, tempfile::TempDir) {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let obj_dir = dir.path().join("uploads");
        std::fs::create_dir_all(&obj_dir).unwrap();
        std::fs::write(obj_dir.join(key), b"%PDF-1.4 fake").unwrap();
        let store = crate::storage::FsObjectStore::new(dir.path().to_path_buf());
        (pool, store, dir)
    }

    #[test]
    fn maxsim_takes_best_match_per_query_vector() {
        let query = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let page = vec![vec![0.9, 0.0], vec![0.1, 0.4]];
        // q1 best: 0.9 (p1); q2 best: 0.4 (p2); sum 1.3
        assert!((maxsim(&query, &page) - 1.3).abs() < 1e-6);
        assert_eq!(maxsim(&query, &[]), 0.0);
        assert_eq!(maxsim(&[], &page), 0.0);
    }

    #[test]
    fn multi_vector_blob_roundtrip() {
        let vecs = vec![vec![1.0f32, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]];
        let blob = vecs_to_blob(&vecs);
        assert_eq!(blob_to_vecs(&blob, 3), vecs);
        assert!(blob_to_vecs(&[], 0).is_empty());
    }

    #[test]
    fn blend_orders_across_channels_and_tags() {
        let vdr = vec![
            VdrPageHit { document_id: "d1".into(), page_num: 1, score: 10.0 },
            VdrPageHit { document_id: "d1".into(), page_num: 2, score: 0.0 },
        ];
        let text = vec![RetrievedChunk {
            content: "chunk".into(),
            src: "d1".into(),
            locations: Vec::new(),
            orig_indexes: Vec::new(),
            char_index: 0,
            token_count: 1,
            id: 1,
            score: 3.0,
        }];
        let blended = blend_hits(vdr, text, 0.6, 0.4, 10);
        assert_eq!(blended.len(), 3);
        // Best VDR page: 1.0·0.6 = 0.6; only text chunk normalizes to 1.0·0.4.
        assert!(matches!(blended[0], SearchHit::VdrPage(ref h) if h.page_num == 1));
        assert!((blended[0].score() - 0.6).abs() < 1e-9);
        assert!(matches!(blended[1], SearchHit::TextChunk(_)));
        assert!((blended[1].score() - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ingest_writes_pages_and_document() {
        let (pool, store, _dir) = pool_with_object("report.pdf").await;
        let document = doc("uploads/report.pdf");

        let pages = ingest_document(
            &pool,
            &store,
            &FakeRasterizer { pages: 3 },
            &FakeEncoder::new(),
            &NoVdrProgress,
            &document,
            150,
        )
        .await
        .unwrap();
        assert_eq!(pages, 3);

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_vdr_pages WHERE document_id = ?")
                .bind(&document.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 3);

        let pipeline: String =
            sqlx::query_scalar("SELECT pipeline_type FROM documents WHERE id = ?")
                .bind(&document.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(pipeline, "vdr");
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let (pool, store, _dir) = pool_with_object("report.pdf").await;
        let document = doc("uploads/report.pdf");

        for _ in 0..2 {
            ingest_document(
                &pool,
                &store,
                &FakeRasterizer { pages: 2 },
                &FakeEncoder::new(),
                &NoVdrProgress,
                &document,
                150,
            )
            .await
            .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_vdr_pages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn single_page_failure_is_skipped() {
        let (pool, store, _dir) = pool_with_object("report.pdf").await;
        let document = doc("uploads/report.pdf");
        let encoder = FakeEncoder {
            fail_page: Some(2),
            ..FakeEncoder::new()
        };

        let pages = ingest_document(
            &pool,
            &store,
            &FakeRasterizer { pages: 3 },
            &encoder,
            &NoVdrProgress,
            &document,
            150,
        )
        .await
        .unwrap();
        assert_eq!(pages, 2);

        let stored: Vec<i64> = sqlx::query_scalar(
            "SELECT page_num FROM document_vdr_pages WHERE document_id = ? ORDER BY page_num",
        )
        .bind(&document.id)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(stored, vec![1, 3]);
    }

    #[tokio::test]
    async fn zero_successful_pages_fails_the_document() {
        let (pool, store, _dir) = pool_with_object("report.pdf").await;
        let document = doc("uploads/report.pdf");
        let encoder = FakeEncoder {
            fail_all: true,
            ..FakeEncoder::new()
        };

        let result = ingest_document(
            &pool,
            &store,
            &FakeRasterizer { pages: 3 },
            &encoder,
            &NoVdrProgress,
            &document,
            150,
        )
        .await;
        assert!(result.is_err());

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 0);
    }

    #[tokio::test]
    async fn progress_reported_every_ten_pages_and_at_completion() {
        let (pool, store, _dir) = pool_with_object("report.pdf").await;
        let document = doc("uploads/report.pdf");
        let reporter = CountingReporter {
            reports: AtomicUsize::new(0),
        };

        ingest_document(
            &pool,
            &store,
            &FakeRasterizer { pages: 25 },
            &FakeEncoder::new(),
            &reporter,
            &document,
            150,
        )
        .await
        .unwrap();
        // At 10, 20, and completion.
        assert_eq!(reporter.reports.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn query_ranks_pages_by_maxsim() {
        let (pool, _store, _dir) = pool_with_object("report.pdf").await;
        upsert_page(&pool, "d1", 1, &[vec![1.0, 0.0]]).await.unwrap();
        upsert_page(&pool, "d1", 2, &[vec![0.2, 0.0]]).await.unwrap();
        upsert_page(&pool, "d2", 1, &[vec![0.5, 0.0]]).await.unwrap();

        let hits = query_pages(
            &pool,
            &FakeEncoder::new(),
            "query",
            &["d1".to_string(), "d2".to_string()],
            2,
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!((hits[0].document_id.as_str(), hits[0].page_num), ("d1", 1));
        assert_eq!((hits[1].document_id.as_str(), hits[1].page_num), ("d2", 1));
    }
}
