//! Embedding progress tracking and stall recovery.
//!
//! Every document moving through the embedding stage has one row in
//! `embedding_progress`, keyed by normalized object id:
//!
//! ```text
//! not_submitted → starting → processing → {completed | failed}
//! ```
//!
//! `failed` rows and in-flight rows whose `last_updated` is older than the
//! stale threshold are requeued automatically — the pipeline self-heals from
//! crashed or wedged workers without operator involvement. A `terminated`
//! row (total failure: zero chunks produced) is terminal until
//! [`ProgressTracker::manually_queue`] resubmits it.
//!
//! Lookups fail safe: a read error classifies the id as pending, never as
//! complete.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{ChunkStatus, ProgressRecord};
use crate::queue::{Queue, EMBED_QUEUE};

/// Result of a completion check over a set of object ids.
#[derive(Debug, Clone, Default)]
pub struct CompletionCheck {
    pub all_complete: bool,
    /// Ids still in flight (including requeued failures and stalls).
    pub pending: Vec<String>,
    /// Ids with no progress record at all; the caller must submit them.
    pub requires_embedding: Vec<String>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    pool: SqlitePool,
    queue: Queue,
    stale_after_secs: i64,
}

impl ProgressTracker {
    pub fn new(pool: SqlitePool, queue: Queue, stale_after_secs: i64) -> Self {
        Self {
            pool,
            queue,
            stale_after_secs,
        }
    }

    /// Upsert the status for an object, stamping `last_updated` with the
    /// current time. Clears the terminated flag unless the new status is a
    /// terminal failure.
    pub async fn set_status(&self, object_id: &str, status: ChunkStatus) -> Result<()> {
        self.write_status(object_id, status, false).await
    }

    /// Mark an object failed with no retry until manual resubmission.
    pub async fn terminate(&self, object_id: &str) -> Result<()> {
        self.write_status(object_id, ChunkStatus::Failed, true).await
    }

    async fn write_status(
        &self,
        object_id: &str,
        status: ChunkStatus,
        terminated: bool,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO embedding_progress (object_id, parent_chunk_status, terminated, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(object_id) DO UPDATE SET
                parent_chunk_status = excluded.parent_chunk_status,
                terminated = excluded.terminated,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(object_id)
        .bind(status.as_str())
        .bind(terminated as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, object_id: &str) -> Result<Option<ProgressRecord>> {
        let row = sqlx::query(
            "SELECT object_id, parent_chunk_status, terminated, last_updated FROM embedding_progress WHERE object_id = ?",
        )
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let status: String = r.get("parent_chunk_status");
            ProgressRecord {
                object_id: r.get("object_id"),
                status: ChunkStatus::parse(&status).unwrap_or(ChunkStatus::NotSubmitted),
                terminated: r.get::<i64, _>("terminated") != 0,
                last_updated: r.get("last_updated"),
            }
        }))
    }

    /// Classify a set of ids, requeueing failures and stalls as a side
    /// effect. Never errors: a lookup failure keeps the id pending.
    pub async fn check_completion(&self, ids: &[String]) -> CompletionCheck {
        let now = chrono::Utc::now().timestamp();
        let mut check = CompletionCheck::default();

        for id in ids {
            let record = match self.get(id).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(object_id = %id, error = %e, "progress lookup failed; treating as pending");
                    check.pending.push(id.clone());
                    continue;
                }
            };

            match record {
                None => check.requires_embedding.push(id.clone()),
                Some(r) if r.status == ChunkStatus::Completed => {}
                Some(r) if r.status == ChunkStatus::Failed => {
                    if !r.terminated {
                        self.requeue(id).await;
                    }
                    check.pending.push(id.clone());
                }
                Some(r) if r.status.is_in_flight() => {
                    if now - r.last_updated > self.stale_after_secs {
                        tracing::warn!(
                            object_id = %id,
                            age_secs = now - r.last_updated,
                            "stalled embedding job; requeueing"
                        );
                        self.requeue(id).await;
                    }
                    check.pending.push(id.clone());
                }
                Some(_) => check.pending.push(id.clone()),
            }
        }

        check.all_complete = check.pending.is_empty() && check.requires_embedding.is_empty();
        check
    }

    /// At-least-once, idempotent resubmission. Consumers overwrite rows by
    /// natural key, so a duplicate delivery re-does work instead of
    /// duplicating it.
    pub async fn manually_queue(&self, object_id: &str) -> Result<()> {
        self.write_status(object_id, ChunkStatus::Starting, false)
            .await?;
        self.queue
            .send(EMBED_QUEUE, &embed_job_payload(object_id))
            .await?;
        Ok(())
    }

    /// Internal self-healing requeue; best-effort, not surfaced to callers.
    async fn requeue(&self, object_id: &str) {
        if let Err(e) = self.manually_queue(object_id).await {
            tracing::warn!(object_id = %object_id, error = %e, "requeue failed");
        }
    }
}

pub fn embed_job_payload(object_id: &str) -> String {
    serde_json::json!({ "object_id": object_id }).to_string()
}
