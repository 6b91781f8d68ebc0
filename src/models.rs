//! Core data models used throughout docrag.
//!
//! These types represent the documents, extracted content, chunks, progress
//! records, and access grants that flow through the ingestion and retrieval
//! pipeline.

use serde::{Deserialize, Serialize};

/// Build the canonical document id from a storage location.
///
/// Progress records, access grants, and chunk rows are all keyed by this
/// normalized form, so the same object always resolves to the same id no
/// matter which stage produced the reference.
pub fn document_id(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket.trim_matches('/'), key.trim_start_matches('/'))
}

/// An uploaded source object. Superseded (not versioned) on re-upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub user_id: String,
    pub mime_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One extracted unit of content, produced per extraction run.
///
/// `location` is opaque provenance (`{"page": 3}`, `{"sheet": "Q2"}`, ...).
/// Items with `can_split = false` (tabular data) pass through chunking as a
/// single chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentItem {
    pub content: String,
    pub location: serde_json::Value,
    pub can_split: bool,
    pub token_count: usize,
}

impl ContentItem {
    pub fn new(content: String, location: serde_json::Value, can_split: bool) -> Self {
        let token_count = estimate_tokens(&content);
        Self {
            content,
            location,
            can_split,
            token_count,
        }
    }
}

/// Approximate chars-per-token ratio used for token estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text without calling the embedding service.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// A bounded span of sentence text with provenance, the atomic retrievable
/// unit. Keyed by `(id, src)` in the `embeddings` table and overwritten on
/// re-processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    /// Locations of every sentence that contributed, in order.
    pub locations: Vec<serde_json::Value>,
    /// Index of each contributing sentence's source item.
    pub orig_indexes: Vec<usize>,
    /// Offset of this chunk in the virtual space-joined document.
    pub char_index: usize,
    pub token_count: usize,
}

/// Embedding job status for one document.
///
/// `NotSubmitted → Starting → Processing → {Completed | Failed}`; `Failed`
/// and stale records are requeued back to `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    NotSubmitted,
    Starting,
    Processing,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::NotSubmitted => "not_submitted",
            ChunkStatus::Starting => "starting",
            ChunkStatus::Processing => "processing",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_submitted" => Some(ChunkStatus::NotSubmitted),
            "starting" => Some(ChunkStatus::Starting),
            "processing" => Some(ChunkStatus::Processing),
            "completed" => Some(ChunkStatus::Completed),
            "failed" => Some(ChunkStatus::Failed),
            _ => None,
        }
    }

    /// A record in `starting` or `processing` can go stale.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ChunkStatus::Starting | ChunkStatus::Processing)
    }
}

/// One row of the `embedding_progress` table.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub object_id: String,
    pub status: ChunkStatus,
    pub terminated: bool,
    /// Unix seconds; only ever written with the current time, so monotonic.
    pub last_updated: i64,
}

/// Permission levels on an access grant. Any level grants visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Read,
    Write,
    Owner,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Read => "read",
            PermissionLevel::Write => "write",
            PermissionLevel::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(PermissionLevel::Read),
            "write" => Some(PermissionLevel::Write),
            "owner" => Some(PermissionLevel::Owner),
            _ => None,
        }
    }
}

/// Group record controlling collective visibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    pub group_id: String,
    pub is_public: bool,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub system_users: Vec<String>,
    #[serde(default)]
    pub amplify_groups: Vec<String>,
}

/// A chunk returned from the retrieval engine.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub src: String,
    pub locations: Vec<serde_json::Value>,
    pub orig_indexes: Vec<usize>,
    pub char_index: usize,
    pub token_count: usize,
    pub id: i64,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_normalizes_slashes() {
        assert_eq!(document_id("uploads", "a/b.pdf"), "uploads/a/b.pdf");
        assert_eq!(document_id("uploads/", "/a/b.pdf"), "uploads/a/b.pdf");
    }

    #[test]
    fn chunk_status_roundtrip() {
        for s in [
            ChunkStatus::NotSubmitted,
            ChunkStatus::Starting,
            ChunkStatus::Processing,
            ChunkStatus::Completed,
            ChunkStatus::Failed,
        ] {
            assert_eq!(ChunkStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ChunkStatus::parse("bogus"), None);
    }

    #[test]
    fn in_flight_states() {
        assert!(ChunkStatus::Starting.is_in_flight());
        assert!(ChunkStatus::Processing.is_in_flight());
        assert!(!ChunkStatus::Completed.is_in_flight());
        assert!(!ChunkStatus::Failed.is_in_flight());
        assert!(!ChunkStatus::NotSubmitted.is_in_flight());
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
