use anyhow::Result;
use sqlx::SqlitePool;

/// Create all tables. Idempotent; safe to run on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Source documents. Re-uploading the same bucket/key supersedes the row.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            key TEXT NOT NULL,
            user_id TEXT NOT NULL,
            mime_type TEXT NOT NULL DEFAULT 'application/octet-stream',
            tags_json TEXT NOT NULL DEFAULT '[]',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            pipeline_type TEXT NOT NULL DEFAULT 'text',
            created_at INTEGER NOT NULL,
            UNIQUE(bucket, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunk rows with both embedding columns, keyed by (id, src).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            id INTEGER NOT NULL,
            src TEXT NOT NULL,
            content TEXT NOT NULL,
            locations TEXT NOT NULL DEFAULT '[]',
            orig_indexes TEXT NOT NULL DEFAULT '[]',
            char_index INTEGER NOT NULL,
            token_count INTEGER NOT NULL,
            vector_embedding BLOB,
            qa_vector_embedding BLOB,
            PRIMARY KEY (id, src)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Per-document embedding job progress, keyed by normalized object id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_progress (
            object_id TEXT PRIMARY KEY,
            parent_chunk_status TEXT NOT NULL DEFAULT 'not_submitted',
            terminated INTEGER NOT NULL DEFAULT 0,
            last_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Access grants for user and group principals.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS object_access (
            object_id TEXT NOT NULL,
            object_type TEXT NOT NULL DEFAULT 'datasource',
            principal_type TEXT NOT NULL,
            principal_id TEXT NOT NULL,
            permission_level TEXT NOT NULL,
            PRIMARY KEY (object_id, principal_type, principal_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS groups (
            group_id TEXT PRIMARY KEY,
            is_public INTEGER NOT NULL DEFAULT 0,
            members_json TEXT NOT NULL DEFAULT '[]',
            system_users_json TEXT NOT NULL DEFAULT '[]',
            amplify_groups_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Multi-vector page embeddings for the visual pipeline. embedding_vectors
    // is num_vectors concatenated little-endian f32 vectors.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_vdr_pages (
            document_id TEXT NOT NULL,
            page_num INTEGER NOT NULL,
            embedding_vectors BLOB NOT NULL,
            num_vectors INTEGER NOT NULL,
            PRIMARY KEY (document_id, page_num)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At-least-once work queues with visibility-timeout redelivery.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            available_at INTEGER NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table for the sparse (BM25) channel.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                src UNINDEXED,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_src ON embeddings(src)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_object_access_principal ON object_access(principal_type, principal_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_messages_queue ON queue_messages(queue, available_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = db::connect_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        for required in [
            "documents",
            "embeddings",
            "embedding_progress",
            "object_access",
            "groups",
            "document_vdr_pages",
            "queue_messages",
            "chunks_fts",
        ] {
            assert!(
                tables.iter().any(|t| t == required),
                "missing table {}",
                required
            );
        }
    }
}
