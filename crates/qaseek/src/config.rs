//! Configuration handling for qaseek.
//!
//! Configuration is layered: built-in defaults, then the TOML file, then
//! environment variables, then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use directories::ProjectDirs;
use qaseek_core::{RetryPolicy, TextComposer, TextMode, DEFAULT_VECTOR_FIELD};
use qaseek_store::OpenSearchConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_URL: &str = "QASEEK_OPENSEARCH_URL";
pub const ENV_USERNAME: &str = "OPENSEARCH_USERNAME";
pub const ENV_PASSWORD: &str = "OPENSEARCH_INITIAL_ADMIN_PASSWORD";
pub const ENV_MODEL: &str = "QASEEK_EMBEDDING_MODEL";
pub const ENV_DIMENSION: &str = "QASEEK_EMBEDDING_DIMENSION";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// OpenSearch connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Embedding configuration
    #[serde(default)]
    pub embedding: EmbeddingSection,

    /// Indexing configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Query configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenSearch connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default = "default_username")]
    pub username: String,

    /// Usually supplied through the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Accept self-signed certificates (development clusters)
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Request gzip-compressed responses
    #[serde(default = "default_true")]
    pub compression: bool,
}

fn default_url() -> String {
    "https://localhost:9200".to_string()
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            username: default_username(),
            password: None,
            accept_invalid_certs: default_true(),
            timeout_secs: default_timeout_secs(),
            compression: default_true(),
        }
    }
}

/// Embedding-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSection {
    /// Model to use: `hash`, or a Hugging Face model id (needs the `candle` feature)
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector dimension; must match the index mapping
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Max concurrent embedding calls
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Texts per embedding call
    #[serde(default = "default_micro_batch_size")]
    pub micro_batch_size: usize,

    /// Word limit for the hash model
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Model download cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

#[cfg(feature = "candle")]
fn default_embedding_model() -> String {
    qaseek_embed::DEFAULT_MODEL_ID.to_string()
}

#[cfg(not(feature = "candle"))]
fn default_embedding_model() -> String {
    qaseek_embed::HASH_MODEL_NAME.to_string()
}

fn default_dimension() -> usize {
    384
}

fn default_max_concurrent() -> usize {
    4
}

fn default_micro_batch_size() -> usize {
    32
}

fn default_max_tokens() -> usize {
    2048
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
            max_concurrent: default_max_concurrent(),
            micro_batch_size: default_micro_batch_size(),
            max_tokens: default_max_tokens(),
            cache_dir: None,
        }
    }
}

/// Indexing-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Collection holding the canonical records
    #[serde(default = "default_source")]
    pub source: String,

    /// Vector collection to write
    #[serde(default = "default_collection")]
    pub destination: String,

    /// Documents per bulk write
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Records per scroll page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Bulk writes in flight
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,

    /// Retries after a failed bulk write
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Progress log interval (records)
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,

    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    #[serde(default)]
    pub text_mode: TextMode,

    /// Separator between question and answer
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_source() -> String {
    "amazon_qa_software".to_string()
}

fn default_collection() -> String {
    "amazon_qa_software_vec".to_string()
}

fn default_batch_size() -> usize {
    qaseek_core::DEFAULT_BATCH_SIZE
}

fn default_page_size() -> usize {
    qaseek_core::DEFAULT_PAGE_SIZE
}

fn default_max_inflight_batches() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_progress_every() -> u64 {
    100
}

fn default_vector_field() -> String {
    DEFAULT_VECTOR_FIELD.to_string()
}

fn default_delimiter() -> String {
    "\n".to_string()
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            destination: default_collection(),
            batch_size: default_batch_size(),
            page_size: default_page_size(),
            max_inflight_batches: default_max_inflight_batches(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            progress_every: default_progress_every(),
            vector_field: default_vector_field(),
            text_mode: TextMode::default(),
            delimiter: default_delimiter(),
        }
    }
}

impl IndexingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(
            self.max_retries,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }

    pub fn composer(&self) -> TextComposer {
        TextComposer::new(self.text_mode, self.delimiter.clone())
    }
}

/// Query-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Vector collection to search
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Default result limit
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Maximum result limit
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,
}

fn default_top_k() -> usize {
    10
}

fn default_max_top_k() -> usize {
    100
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            default_top_k: default_top_k(),
            max_top_k: default_max_top_k(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load from the default path, then apply environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path` (or the default path), then apply environment overrides.
    ///
    /// A missing file at the default path yields the defaults; an explicit
    /// path must exist.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_URL) {
            self.backend.url = url;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.backend.username = username;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.backend.password = Some(password);
        }
        if let Some(model) = lookup(ENV_MODEL) {
            self.embedding.model = model;
        }
        if let Some(dimension) = lookup(ENV_DIMENSION) {
            self.embedding.dimension = dimension
                .parse()
                .with_context(|| format!("{ENV_DIMENSION} is not a number: {dimension}"))?;
        }
        Ok(())
    }

    /// Connection settings for the OpenSearch client.
    ///
    /// Fails before any network call when no password is configured.
    pub fn opensearch(&self) -> qaseek_core::Result<OpenSearchConfig> {
        let password = self
            .backend
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                qaseek_core::Error::Config(format!(
                    "no OpenSearch password configured (set {ENV_PASSWORD} or backend.password)"
                ))
            })?;

        Ok(OpenSearchConfig {
            url: self.backend.url.clone(),
            username: self.backend.username.clone(),
            password: Some(password),
            accept_invalid_certs: self.backend.accept_invalid_certs,
            timeout: Duration::from_secs(self.backend.timeout_secs),
            compression: self.backend.compression,
        })
    }

    /// Default config file location.
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Commented sample configuration.
    pub fn sample_toml() -> &'static str {
        r#"# qaseek configuration

[backend]
url = "https://localhost:9200"
username = "admin"
# password is usually taken from OPENSEARCH_INITIAL_ADMIN_PASSWORD
accept_invalid_certs = true
timeout_secs = 30
compression = true

[embedding]
# "hash", or a sentence-transformers model id when built with the candle feature
model = "hash"
dimension = 384
max_concurrent = 4
micro_batch_size = 32

[indexing]
source = "amazon_qa_software"
destination = "amazon_qa_software_vec"
batch_size = 500
page_size = 500
max_inflight_batches = 2
max_retries = 3
retry_base_ms = 500
retry_max_ms = 30000
progress_every = 100
vector_field = "question_vector"
text_mode = "question_answer"
delimiter = "\n"

[query]
collection = "amazon_qa_software_vec"
default_top_k = 10
max_top_k = 100

[logging]
level = "info"
# file = "/var/log/qaseek.log"
"#
    }
}

/// Get the XDG config directory for qaseek.
pub fn config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("QASEEK_CONFIG_DIR") {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("", "", "qaseek").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the XDG cache directory for qaseek.
#[cfg_attr(not(feature = "candle"), allow(dead_code))]
pub fn cache_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "qaseek").map(|dirs| dirs.cache_dir().to_path_buf())
}
