use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub vdr: VdrConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// "s3" or "filesystem".
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root directory for the filesystem backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            region: default_region(),
            endpoint_url: None,
            root: None,
        }
    }
}

fn default_storage_backend() -> String {
    "s3".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
        }
    }
}

fn default_min_chunk_size() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// An in-flight record older than this is stale and requeued.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_stale_after_secs() -> i64 {
    180
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Upper bound on the completion wait before a retryable not-ready error.
    #[serde(default = "default_completion_deadline_secs")]
    pub completion_deadline_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_dense_weight")]
    pub dense_weight: f64,
    #[serde(default = "default_sparse_weight")]
    pub sparse_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            completion_deadline_secs: default_completion_deadline_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            dense_weight: default_dense_weight(),
            sparse_weight: default_sparse_weight(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_completion_deadline_secs() -> u64 {
    120
}
fn default_poll_interval_secs() -> u64 {
    3
}
fn default_dense_weight() -> f64 {
    0.7
}
fn default_sparse_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Seconds a claimed message stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

fn default_visibility_timeout_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct VdrConfig {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default)]
    pub model_url: Option<String>,
    #[serde(default = "default_vdr_weight")]
    pub vdr_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VdrConfig {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            model_url: None,
            vdr_weight: default_vdr_weight(),
            text_weight: default_text_weight(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_dpi() -> u32 {
    150
}
fn default_vdr_weight() -> f64 {
    0.6
}
fn default_text_weight() -> f64 {
    0.4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.min_chunk_size == 0 {
        anyhow::bail!("chunking.min_chunk_size must be > 0");
    }

    if config.retrieval.completion_deadline_secs == 0 {
        anyhow::bail!("retrieval.completion_deadline_secs must be > 0");
    }
    if config.retrieval.poll_interval_secs == 0 {
        anyhow::bail!("retrieval.poll_interval_secs must be > 0");
    }
    if config.retrieval.dense_weight < 0.0 || config.retrieval.sparse_weight < 0.0 {
        anyhow::bail!("retrieval weights must be >= 0");
    }

    if config.tracker.stale_after_secs <= 0 {
        anyhow::bail!("tracker.stale_after_secs must be > 0");
    }

    match config.storage.backend.as_str() {
        "s3" => {}
        "filesystem" => {
            if config.storage.root.is_none() {
                anyhow::bail!("storage.root required for the filesystem backend");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be s3 or filesystem.",
            other
        ),
    }

    if config.embedding.is_enabled() {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("docrag.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[db]
path = "/tmp/docrag.sqlite"

[server]
bind = "127.0.0.1:7841"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.min_chunk_size, 512);
        assert_eq!(config.tracker.stale_after_secs, 180);
        assert_eq!(config.retrieval.completion_deadline_secs, 120);
        assert_eq!(config.retrieval.poll_interval_secs, 3);
        assert_eq!(config.vdr.dpi, 150);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[db]
path = "/tmp/docrag.sqlite"

[chunking]
min_chunk_size = 0

[server]
bind = "127.0.0.1:7841"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_enabled_embedding_without_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[db]
path = "/tmp/docrag.sqlite"

[embedding]
provider = "http"

[server]
bind = "127.0.0.1:7841"
"#,
        );
        assert!(load_config(&path).is_err());
    }
}
