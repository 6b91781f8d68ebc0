//! At-least-once work queues.
//!
//! Pipeline stages communicate through named queues backed by the
//! `queue_messages` table. A claimed message becomes invisible for the
//! configured visibility timeout and is redelivered if the consumer does not
//! delete it in time, so consumers must be idempotent: re-processing a key
//! overwrites prior rows rather than appending.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Queue names for the three pipeline stages plus the visual path.
pub const EXTRACT_QUEUE: &str = "extract";
pub const CHUNK_QUEUE: &str = "chunk";
pub const EMBED_QUEUE: &str = "embed";
pub const VDR_QUEUE: &str = "vdr";

/// A message claimed from a queue. Hold the receipt to delete on success.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub payload: String,
    pub attempts: i64,
}

#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
    visibility_timeout_secs: i64,
}

impl Queue {
    pub fn new(pool: SqlitePool, visibility_timeout_secs: i64) -> Self {
        Self {
            pool,
            visibility_timeout_secs,
        }
    }

    /// Enqueue a payload. At-least-once: callers may enqueue the same work
    /// twice (manual requeue, redelivery) and consumers must tolerate it.
    pub async fn send(&self, queue: &str, payload: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO queue_messages (id, queue, payload, available_at, attempts) VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&id)
        .bind(queue)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the next visible message, making it invisible for the
    /// visibility timeout. Returns `None` when the queue is drained.
    pub async fn receive(&self, queue: &str) -> Result<Option<QueueMessage>> {
        let now = chrono::Utc::now().timestamp();
        let invisible_until = now + self.visibility_timeout_secs;

        // Single-statement claim keeps concurrent workers from double-claiming
        // within the visibility window.
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET available_at = ?, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND available_at <= ?
                ORDER BY available_at
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(invisible_until)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| QueueMessage {
            id: r.get("id"),
            payload: r.get("payload"),
            attempts: r.get("attempts"),
        }))
    }

    /// Delete a message after successful processing. Deleting an already
    /// redelivered-and-deleted message is a no-op.
    pub async fn delete(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Make a claimed message immediately visible again (explicit nack).
    pub async fn release(&self, message_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE queue_messages SET available_at = ? WHERE id = ?")
            .bind(now)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};

    async fn queue(visibility: i64) -> Queue {
        let pool = db::connect_memory().await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        Queue::new(pool, visibility)
    }

    #[tokio::test]
    async fn send_receive_delete() {
        let q = queue(300).await;
        q.send(EXTRACT_QUEUE, r#"{"bucket":"b","key":"k"}"#)
            .await
            .unwrap();

        let msg = q.receive(EXTRACT_QUEUE).await.unwrap().unwrap();
        assert_eq!(msg.payload, r#"{"bucket":"b","key":"k"}"#);
        assert_eq!(msg.attempts, 1);

        // Claimed message is invisible until the timeout elapses.
        assert!(q.receive(EXTRACT_QUEUE).await.unwrap().is_none());

        q.delete(&msg.id).await.unwrap();
        assert_eq!(q.depth(EXTRACT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unacked_message_is_redelivered() {
        // Zero visibility timeout: claim and immediate redelivery.
        let q = queue(0).await;
        q.send(CHUNK_QUEUE, "payload").await.unwrap();

        let first = q.receive(CHUNK_QUEUE).await.unwrap().unwrap();
        let second = q.receive(CHUNK_QUEUE).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);
    }

    #[tokio::test]
    async fn release_makes_message_visible() {
        let q = queue(300).await;
        q.send(EMBED_QUEUE, "job").await.unwrap();

        let msg = q.receive(EMBED_QUEUE).await.unwrap().unwrap();
        assert!(q.receive(EMBED_QUEUE).await.unwrap().is_none());

        q.release(&msg.id).await.unwrap();
        assert!(q.receive(EMBED_QUEUE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let q = queue(300).await;
        q.send(EXTRACT_QUEUE, "a").await.unwrap();
        assert!(q.receive(CHUNK_QUEUE).await.unwrap().is_none());
    }
}
