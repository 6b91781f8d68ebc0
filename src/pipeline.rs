//! Ingestion pipeline orchestration.
//!
//! Three queue consumers move an uploaded object through the text pipeline
//! (extract → chunk → embed), with a fourth handling the visual path when a
//! PDF profiles as a scan. Every consumer is idempotent: chunk and page rows
//! are replaced by natural key, so at-least-once delivery and manual
//! requeues re-do work instead of duplicating it. Messages are deleted only
//! on success; failures rely on visibility-timeout redelivery.
//!
//! Documents are processed in parallel across workers with no cross-document
//! ordering; chunking of a single document happens inside one message so its
//! `char_index` / `orig_indexes` stay deterministic.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::access::grant_access;
use crate::chunker::chunk_items;
use crate::embedding::{vec_to_blob, EmbeddingInput, EmbeddingService};
use crate::extract::{extract_content, HandlerRegistry, MIME_PDF};
use crate::models::{document_id, Chunk, ChunkStatus, ContentItem, SourceDocument};
use crate::ocr;
use crate::progress::ProgressTracker;
use crate::queue::{Queue, CHUNK_QUEUE, EMBED_QUEUE, EXTRACT_QUEUE, VDR_QUEUE};
use crate::storage::{detect_content_type, ObjectStore};
use crate::vdr::{PageRasterizer, VdrProgressReporter, VisualEncoder};

/// Storage "object created" event, the pipeline entry message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket: String,
    pub key: String,
    pub user_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Extraction output handed to the chunking stage. ContentItems are
/// ephemeral; they live only in this message.
#[derive(Debug, Serialize, Deserialize)]
struct ChunkJob {
    document: SourceDocument,
    items: Vec<ContentItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmbedJob {
    object_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VdrJob {
    document: SourceDocument,
}

/// Visual-path collaborators; absent when no visual model is deployed, in
/// which case everything routes through the text pipeline.
pub struct VdrContext {
    pub rasterizer: Arc<dyn PageRasterizer>,
    pub encoder: Arc<dyn VisualEncoder>,
    pub reporter: Arc<dyn VdrProgressReporter>,
    pub dpi: u32,
}

/// Everything a worker needs, constructed once per process.
pub struct PipelineContext {
    pub pool: SqlitePool,
    pub queue: Queue,
    pub registry: HandlerRegistry,
    pub store: Arc<dyn ObjectStore>,
    pub embedding: Arc<dyn EmbeddingService>,
    pub tracker: ProgressTracker,
    pub min_chunk_size: usize,
    pub vdr: Option<VdrContext>,
}

/// Enqueue an upload event; the public ingestion trigger.
pub async fn submit_upload(queue: &Queue, event: &UploadEvent) -> Result<String> {
    queue
        .send(EXTRACT_QUEUE, &serde_json::to_string(event)?)
        .await
}

/// Process at most one message from each queue. Returns whether any work was
/// done; the worker loop idles briefly when all queues are drained.
pub async fn tick(ctx: &PipelineContext) -> bool {
    let mut worked = false;
    worked |= consume_one(ctx, EXTRACT_QUEUE).await;
    worked |= consume_one(ctx, VDR_QUEUE).await;
    worked |= consume_one(ctx, CHUNK_QUEUE).await;
    worked |= consume_one(ctx, EMBED_QUEUE).await;
    worked
}

/// Run the worker loop until the task is cancelled.
pub async fn run_workers(ctx: &PipelineContext) {
    loop {
        if !tick(ctx).await {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }
}

async fn consume_one(ctx: &PipelineContext, queue_name: &str) -> bool {
    let message = match ctx.queue.receive(queue_name).await {
        Ok(Some(m)) => m,
        Ok(None) => return false,
        Err(e) => {
            tracing::error!(queue = queue_name, error = %e, "queue receive failed");
            return false;
        }
    };

    let outcome = match queue_name {
        EXTRACT_QUEUE => process_extract(ctx, &message.payload).await,
        CHUNK_QUEUE => process_chunk(ctx, &message.payload).await,
        EMBED_QUEUE => process_embed(ctx, &message.payload).await,
        VDR_QUEUE => process_vdr(ctx, &message.payload).await,
        _ => Ok(()),
    };

    match outcome {
        Ok(()) => {
            if let Err(e) = ctx.queue.delete(&message.id).await {
                tracing::warn!(queue = queue_name, error = %e, "failed to delete message");
            }
        }
        Err(e) => {
            // Left invisible; redelivered after the visibility timeout.
            tracing::warn!(
                queue = queue_name,
                attempts = message.attempts,
                error = %e,
                "message processing failed; awaiting redelivery"
            );
        }
    }
    true
}

/// Extraction consumer: download, upsert the document record and owner
/// grant, then route to the text or visual pipeline.
async fn process_extract(ctx: &PipelineContext, payload: &str) -> Result<()> {
    let event: UploadEvent = serde_json::from_str(payload).context("bad upload event payload")?;
    let mime = event
        .mime_type
        .clone()
        .unwrap_or_else(|| detect_content_type(&event.key));

    let doc = SourceDocument {
        id: document_id(&event.bucket, &event.key),
        bucket: event.bucket.clone(),
        key: event.key.clone(),
        user_id: event.user_id.clone(),
        mime_type: mime.clone(),
        tags: Vec::new(),
        metadata: serde_json::json!({}),
    };

    let bytes = ctx.store.get_object(&event.bucket, &event.key).await?;

    upsert_document(&ctx.pool, &doc, "text").await?;
    grant_access(&ctx.pool, &doc.id, "user", &doc.user_id, "owner").await?;

    // Scanned PDFs go to the visual pipeline when one is wired in.
    if mime == MIME_PDF && ctx.vdr.is_some() {
        match ocr::analyze_pdf(&bytes) {
            Ok(analysis) if analysis.is_ocr_candidate => {
                tracing::info!(
                    document_id = %doc.id,
                    confidence = analysis.confidence,
                    recommendation = analysis.recommendation,
                    "routing to visual pipeline"
                );
                let job = VdrJob { document: doc };
                ctx.queue
                    .send(VDR_QUEUE, &serde_json::to_string(&job)?)
                    .await?;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(document_id = %doc.id, error = %e, "OCR analysis failed; using text pipeline");
            }
        }
    }

    let items = extract_content(&ctx.registry, &bytes, &event.key, &mime);
    let job = ChunkJob {
        document: doc,
        items,
    };
    ctx.queue
        .send(CHUNK_QUEUE, &serde_json::to_string(&job)?)
        .await?;
    Ok(())
}

/// Chunking consumer. Zero extracted content is a terminal failure for the
/// document, not an error for the queue.
async fn process_chunk(ctx: &PipelineContext, payload: &str) -> Result<()> {
    let job: ChunkJob = serde_json::from_str(payload).context("bad chunk job payload")?;
    let chunks = chunk_items(&job.items, ctx.min_chunk_size);

    if chunks.is_empty() {
        tracing::warn!(document_id = %job.document.id, "zero chunks extracted; marking failed");
        ctx.tracker.terminate(&job.document.id).await?;
        return Ok(());
    }

    replace_chunks(&ctx.pool, &job.document.id, &chunks).await?;
    ctx.tracker
        .set_status(&job.document.id, ChunkStatus::Starting)
        .await?;

    let embed = EmbedJob {
        object_id: job.document.id.clone(),
    };
    ctx.queue
        .send(EMBED_QUEUE, &serde_json::to_string(&embed)?)
        .await?;
    Ok(())
}

/// Embedding consumer: fills both vector columns for every chunk of the
/// document. Failure marks the record failed and leaves the message for
/// redelivery; the tracker's stall detection also covers a worker that dies
/// mid-document.
async fn process_embed(ctx: &PipelineContext, payload: &str) -> Result<()> {
    let job: EmbedJob = serde_json::from_str(payload).context("bad embed job payload")?;
    ctx.tracker
        .set_status(&job.object_id, ChunkStatus::Processing)
        .await?;

    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, content FROM embeddings WHERE src = ? ORDER BY id")
            .bind(&job.object_id)
            .fetch_all(&ctx.pool)
            .await?;

    if rows.is_empty() {
        ctx.tracker.terminate(&job.object_id).await?;
        return Ok(());
    }

    for (chunk_id, content) in &rows {
        let result = async {
            let content_emb = ctx.embedding.embed(content, EmbeddingInput::Content).await?;
            let qa_emb = ctx.embedding.embed(content, EmbeddingInput::Qa).await?;
            anyhow::Ok((content_emb, qa_emb))
        }
        .await;

        let (content_emb, qa_emb) = match result {
            Ok(pair) => pair,
            Err(e) => {
                ctx.tracker
                    .set_status(&job.object_id, ChunkStatus::Failed)
                    .await?;
                return Err(e.context(format!("embedding chunk {} failed", chunk_id)));
            }
        };

        sqlx::query(
            "UPDATE embeddings SET vector_embedding = ?, qa_vector_embedding = ? WHERE id = ? AND src = ?",
        )
        .bind(vec_to_blob(&content_emb.vector))
        .bind(vec_to_blob(&qa_emb.vector))
        .bind(chunk_id)
        .bind(&job.object_id)
        .execute(&ctx.pool)
        .await?;
    }

    ctx.tracker
        .set_status(&job.object_id, ChunkStatus::Completed)
        .await?;
    Ok(())
}

/// Visual consumer. Ingestion failure (zero pages) is terminal for the
/// document; the message is consumed rather than redelivered forever.
async fn process_vdr(ctx: &PipelineContext, payload: &str) -> Result<()> {
    let job: VdrJob = serde_json::from_str(payload).context("bad vdr job payload")?;
    let Some(ref vdr) = ctx.vdr else {
        tracing::warn!(document_id = %job.document.id, "no visual pipeline configured; dropping job");
        return Ok(());
    };

    match crate::vdr::ingest_document(
        &ctx.pool,
        ctx.store.as_ref(),
        vdr.rasterizer.as_ref(),
        vdr.encoder.as_ref(),
        vdr.reporter.as_ref(),
        &job.document,
        vdr.dpi,
    )
    .await
    {
        Ok(pages) => {
            tracing::info!(document_id = %job.document.id, pages, "visual ingestion complete");
            ctx.tracker
                .set_status(&job.document.id, ChunkStatus::Completed)
                .await?;
            Ok(())
        }
        Err(e) => {
            tracing::error!(document_id = %job.document.id, error = %e, "visual ingestion failed");
            ctx.tracker.terminate(&job.document.id).await?;
            Ok(())
        }
    }
}

/// Upsert the document record. Re-uploads supersede: last-writer-wins on the
/// natural key, no version history.
pub async fn upsert_document(
    pool: &SqlitePool,
    doc: &SourceDocument,
    pipeline_type: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO documents (id, bucket, key, user_id, mime_type, tags_json, metadata_json, pipeline_type, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            mime_type = excluded.mime_type,
            tags_json = excluded.tags_json,
            metadata_json = excluded.metadata_json,
            pipeline_type = excluded.pipeline_type
        "#,
    )
    .bind(&doc.id)
    .bind(&doc.bucket)
    .bind(&doc.key)
    .bind(&doc.user_id)
    .bind(&doc.mime_type)
    .bind(serde_json::to_string(&doc.tags)?)
    .bind(doc.metadata.to_string())
    .bind(pipeline_type)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace a document's chunk rows and FTS mirror in one transaction.
/// Chunk ids are the 0-based chunk order, so re-processing overwrites.
pub async fn replace_chunks(pool: &SqlitePool, src: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM embeddings WHERE src = ?")
        .bind(src)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE src = ?")
        .bind(src)
        .execute(&mut *tx)
        .await?;

    for (index, chunk) in chunks.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO embeddings (id, src, content, locations, orig_indexes, char_index, token_count)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(index as i64)
        .bind(src)
        .bind(&chunk.content)
        .bind(serde_json::to_string(&chunk.locations)?)
        .bind(serde_json::to_string(&chunk.orig_indexes)?)
        .bind(chunk.char_index as i64)
        .bind(chunk.token_count as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, src, content) VALUES (?, ?, ?)")
            .bind(index as i64)
            .bind(src)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}
