use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for FixForge
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub store: StoreConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub clusters: ClustersConfig,
    pub generation: GenerationConfig,
}

/// Configuration for embedding generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding backend: "onnx" (default) or "hashing"
    pub backend: EmbeddingBackend,
    /// Model name, resolved under the model cache directory
    pub model: String,
    /// Batch size for embedding generation
    pub batch_size: usize,
}

/// Embedding backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingBackend {
    /// Local ONNX runtime inference
    Onnx,
    /// Feature hashing; no model download
    Hashing,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::Onnx
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            model: "all-MiniLM-L6-v2".into(),
            batch_size: 32,
        }
    }
}

/// Where bugs, solutions and clusters live
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Supabase project URL (required for the supabase backend)
    pub url: Option<String>,
    /// API key, literal value or "env:VAR_NAME" to read from environment
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// SQLite file under the data directory
    #[default]
    Sqlite,
    Supabase,
}

/// Vector index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: IndexBackend,
    /// Endee server URL (required for the endee backend)
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Index name
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IndexBackend {
    /// Brute-force index in a local SQLite file
    #[default]
    Local,
    Endee,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::default(),
            url: None,
            api_key: None,
            name: "fixforge_bugs".into(),
        }
    }
}

/// Duplicate detection and context retrieval thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Similarity at or above which a submission is a duplicate
    pub duplicate_threshold: f32,
    /// Neighbors requested when building generation context
    pub top_k: usize,
    /// Minimum similarity for a neighbor to enter the context
    pub min_score: f32,
    pub max_cases: usize,
    /// Characters of solution text per context case
    pub excerpt_chars: usize,
    pub related_top_k: usize,
    pub related_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.85,
            top_k: 5,
            min_score: 0.7,
            max_cases: 3,
            excerpt_chars: 300,
            related_top_k: 3,
            related_threshold: 0.85,
        }
    }
}

/// Batch clustering job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClustersConfig {
    pub k: usize,
    /// Only bugs with this status are clustered
    pub status: String,
    pub max_iterations: usize,
    pub seed: u64,
    pub upsert_batch: usize,
}

impl Default for ClustersConfig {
    fn default() -> Self {
        Self {
            k: 6,
            status: "Solved".into(),
            max_iterations: 100,
            seed: 42,
            upsert_batch: 50,
        }
    }
}

/// Text generation service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    /// API key, literal value or "env:VAR_NAME" to read from environment
    pub api_key: Option<String>,
    pub primary_model: String,
    pub fallback_model: Option<String>,
    /// Attempts per model on overload or timeout
    pub attempts: u32,
    pub backoff_secs: u64,
    pub text_timeout_secs: u64,
    pub image_timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            api_key: Some("env:GEMINI_API_KEY".into()),
            primary_model: "models/gemini-1.5-pro-latest".into(),
            fallback_model: Some("models/gemini-1.5-flash-latest".into()),
            attempts: 2,
            backoff_secs: 5,
            text_timeout_secs: 90,
            image_timeout_secs: 120,
        }
    }
}

/// Resolve a secret, supporting "env:VAR_NAME" syntax
pub fn resolve_secret(value: Option<&str>) -> Option<String> {
    value.and_then(|key| {
        if let Some(var_name) = key.strip_prefix("env:") {
            std::env::var(var_name).ok().filter(|v| !v.is_empty())
        } else if key.is_empty() {
            None
        } else {
            Some(key.to_string())
        }
    })
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Get the path to the fixforge data directory for a project
    pub fn data_dir(root: &Path) -> PathBuf {
        root.join(".fixforge")
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::data_dir(root).join("config.toml")
    }

    /// SQLite database holding bugs, solutions and clusters
    pub fn db_path(root: &Path) -> PathBuf {
        Self::data_dir(root).join("fixforge.db")
    }

    /// Local vector index file
    pub fn vectors_path(root: &Path) -> PathBuf {
        Self::data_dir(root).join("vectors.db")
    }

    /// Get the global model cache directory
    pub fn model_cache_dir() -> Result<PathBuf> {
        let project_dirs = directories::ProjectDirs::from("dev", "fixforge", "fixforge")
            .context("Failed to determine user directories")?;
        Ok(project_dirs.cache_dir().join("models"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.embedding.backend, EmbeddingBackend::Onnx);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.index.name, "fixforge_bugs");
        assert_eq!(config.retrieval.duplicate_threshold, 0.85);
        assert_eq!(config.clusters.k, 6);
        assert_eq!(config.generation.attempts, 2);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[embedding]
backend = "hashing"

[index]
backend = "endee"
url = "http://localhost:8080"

[clusters]
k = 4
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashing);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.index.backend, IndexBackend::Endee);
        assert_eq!(config.index.name, "fixforge_bugs");
        assert_eq!(config.clusters.k, 4);
        assert_eq!(config.clusters.seed, 42);
        assert_eq!(config.retrieval.min_score, 0.7);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        let mut config = Config::default();
        config.store.backend = StoreBackend::Supabase;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.store.backend, StoreBackend::Supabase);
        assert_eq!(loaded.generation.primary_model, "models/gemini-1.5-pro-latest");
    }

    #[test]
    fn test_resolve_secret_literal() {
        assert_eq!(resolve_secret(Some("sk-123")), Some("sk-123".into()));
        assert_eq!(resolve_secret(Some("")), None);
        assert_eq!(resolve_secret(None), None);
    }

    #[test]
    fn test_resolve_secret_env() {
        std::env::set_var("FIXFORGE_TEST_SECRET_XYZ", "from-env");
        assert_eq!(
            resolve_secret(Some("env:FIXFORGE_TEST_SECRET_XYZ")),
            Some("from-env".into())
        );
        std::env::remove_var("FIXFORGE_TEST_SECRET_XYZ");
        assert_eq!(resolve_secret(Some("env:FIXFORGE_TEST_SECRET_XYZ")), None);
    }
}
