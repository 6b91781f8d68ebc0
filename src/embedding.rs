//! Embedding service abstraction and implementations.
//!
//! The embedding model is an external black-box service: the pipeline only
//! depends on the [`EmbeddingService`] contract `text -> (vector, token
//! count)` with explicit success/error. Implementations:
//!
//! - **[`HttpEmbeddingService`]** — calls an OpenAI-compatible embeddings
//!   endpoint with exponential backoff (429/5xx retried, other 4xx fatal).
//! - **[`HashEmbeddingService`]** — deterministic token-bucket hashing, used
//!   by tests and offline smoke runs.
//! - **[`DisabledEmbeddingService`]** — always errors; used when embeddings
//!   are not configured.
//!
//! Also provides the vector utilities shared by the retrieval engine:
//! [`vec_to_blob`] / [`blob_to_vec`] for SQLite BLOB storage and
//! [`inner_product`] / [`cosine_similarity`] scoring.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::models::estimate_tokens;

/// Which column (and therefore which instruction framing) a text is embedded
/// for. The QA variant prefixes the text so the secondary column gets
/// distinct geometry from the same black-box model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingInput {
    Content,
    Qa,
    Query,
}

const QA_PREFIX: &str = "passage for question answering: ";

/// A produced embedding with the token count the service charged for it.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub token_count: usize,
}

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str, input: EmbeddingInput) -> Result<Embedding>;
    fn dims(&self) -> usize;
}

/// Build the configured service.
pub fn create_service(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbeddingService)),
        "http" => Ok(Box::new(HttpEmbeddingService::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn frame_input(text: &str, input: EmbeddingInput) -> String {
    match input {
        EmbeddingInput::Content | EmbeddingInput::Query => text.to_string(),
        EmbeddingInput::Qa => format!("{}{}", QA_PREFIX, text),
    }
}

// ============ Disabled ============

pub struct DisabledEmbeddingService;

#[async_trait]
impl EmbeddingService for DisabledEmbeddingService {
    async fn embed(&self, _text: &str, _input: EmbeddingInput) -> Result<Embedding> {
        bail!("Embedding provider is disabled")
    }

    fn dims(&self) -> usize {
        0
    }
}

// ============ HTTP (OpenAI-compatible) ============

/// Calls `POST <url>` with `{"model", "input"}` and reads
/// `data[].embedding` plus `usage.total_tokens`.
///
/// Retry strategy:
/// - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ... capped at 2^5)
/// - other 4xx → fail immediately
/// - network errors → retry
pub struct HttpEmbeddingService {
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for http provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for http provider"))?;
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for http provider"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            url,
            model,
            dims,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str, input: EmbeddingInput) -> Result<Embedding> {
        let framed = frame_input(text, input);
        let body = serde_json::json!({
            "model": self.model,
            "input": [framed],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self.client.post(&self.url).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json, &framed);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "Embedding service error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("Embedding service error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn parse_embedding_response(json: &serde_json::Value, input_text: &str) -> Result<Embedding> {
    let vector: Vec<f32> = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing data[0].embedding"))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect();

    if vector.is_empty() {
        bail!("Invalid embedding response: empty vector");
    }

    let token_count = json
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_u64())
        .map(|t| t as usize)
        .unwrap_or_else(|| estimate_tokens(input_text));

    Ok(Embedding {
        vector,
        token_count,
    })
}

// ============ Hash (deterministic, offline) ============

/// Token-bucket hash embedding. Deterministic and cheap; suitable for tests
/// and offline smoke runs, not for semantic quality.
pub struct HashEmbeddingService {
    dims: usize,
}

impl HashEmbeddingService {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl EmbeddingService for HashEmbeddingService {
    async fn embed(&self, text: &str, input: EmbeddingInput) -> Result<Embedding> {
        let framed = frame_input(text, input);
        let mut vector = vec![0.0f32; self.dims];
        for token in framed.to_lowercase().split_whitespace() {
            let mut h: u64 = 1469598103934665603; // FNV-1a
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            vector[(h % self.dims as u64) as usize] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(Embedding {
            vector,
            token_count: estimate_tokens(&framed),
        })
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Inner product of two vectors. Returns 0.0 on length mismatch.
///
/// The dense rankings order by inner-product distance negated, i.e. plain
/// inner product descending.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Cosine similarity in `[-1.0, 1.0]`; 0.0 for empty or mismatched vectors.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn inner_product_basics() {
        assert_eq!(inner_product(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(inner_product(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(inner_product(&[], &[]), 0.0);
    }

    #[test]
    fn cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[tokio::test]
    async fn hash_embedding_is_deterministic_and_normalized() {
        let service = HashEmbeddingService::new(64);
        let a = service
            .embed("stall recovery requeue", EmbeddingInput::Content)
            .await
            .unwrap();
        let b = service
            .embed("stall recovery requeue", EmbeddingInput::Content)
            .await
            .unwrap();
        assert_eq!(a.vector, b.vector);
        let norm: f32 = a.vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn qa_framing_changes_the_vector() {
        let service = HashEmbeddingService::new(64);
        let content = service.embed("alpha beta", EmbeddingInput::Content).await.unwrap();
        let qa = service.embed("alpha beta", EmbeddingInput::Qa).await.unwrap();
        assert_ne!(content.vector, qa.vector);
    }

    #[tokio::test]
    async fn disabled_provider_errors() {
        let service = DisabledEmbeddingService;
        assert!(service.embed("x", EmbeddingInput::Query).await.is_err());
    }

    #[test]
    fn parse_response_reads_vector_and_usage() {
        let json = serde_json::json!({
            "data": [{"embedding": [0.1, 0.2]}],
            "usage": {"total_tokens": 7}
        });
        let emb = parse_embedding_response(&json, "ignored").unwrap();
        assert_eq!(emb.vector.len(), 2);
        assert_eq!(emb.token_count, 7);
    }

    #[test]
    fn parse_response_rejects_missing_embedding() {
        let json = serde_json::json!({"data": []});
        assert!(parse_embedding_response(&json, "x").is_err());
    }
}
