use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::ClusterConfig;
use crate::config::{resolve_secret, Config, IndexBackend, StoreBackend};
use crate::embed;
use crate::generate::{FallbackPolicy, GeminiClient, SharedGenerator};
use crate::search::ContextConfig;
use crate::storage::{SharedStore, SqliteStore, SupabaseStore};
use crate::tracker::{Tracker, TrackerSettings};
use crate::vector::{EndeeIndex, LocalIndex, SharedIndex};

/// Project directory flag shared by every command that opens a project
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project directory (defaults to current directory)
    #[arg(long, short = 'C', default_value = ".")]
    pub path: PathBuf,
}

/// An initialized fixforge directory and its configuration
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn open(path: &Path) -> Result<Self> {
        let root = path
            .canonicalize()
            .with_context(|| format!("Invalid path: {}", path.display()))?;

        let config_path = Config::config_path(&root);
        if !config_path.exists() {
            bail!(
                "FixForge not initialized in {}. Run `fixforge init` first.",
                root.display()
            );
        }
        let config = Config::load(&config_path).with_context(|| "Failed to load configuration")?;
        Ok(Self { root, config })
    }

    pub fn open_store(&self) -> Result<SharedStore> {
        let store = &self.config.store;
        match store.backend {
            StoreBackend::Sqlite => {
                let db_path = Config::db_path(&self.root);
                let store = SqliteStore::open(&db_path)
                    .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
                Ok(Arc::new(store))
            }
            StoreBackend::Supabase => {
                let url = store
                    .url
                    .as_deref()
                    .context("store.url is required for the supabase backend")?;
                let key = resolve_secret(store.api_key.as_deref())
                    .context("store.api_key is required for the supabase backend")?;
                Ok(Arc::new(SupabaseStore::new(url, &key)))
            }
        }
    }

    pub async fn open_index(&self) -> Result<SharedIndex> {
        let index = &self.config.index;
        match index.backend {
            IndexBackend::Local => {
                let path = Config::vectors_path(&self.root);
                let local = LocalIndex::open(&path)
                    .with_context(|| format!("Failed to open vector index: {}", path.display()))?;
                Ok(Arc::new(local))
            }
            IndexBackend::Endee => {
                let url = index
                    .url
                    .as_deref()
                    .context("index.url is required for the endee backend")?;
                let key = resolve_secret(index.api_key.as_deref());
                let endee = EndeeIndex::connect(url, key, &index.name)
                    .await
                    .context("Failed to connect to vector index")?;
                Ok(Arc::new(endee))
            }
        }
    }

    /// Gemini client when an API key resolves; `None` disables suggestions
    pub fn generator(&self) -> Option<SharedGenerator> {
        let generation = &self.config.generation;
        let key = resolve_secret(generation.api_key.as_deref())?;
        let client = GeminiClient::new(&generation.base_url, &key).with_timeouts(
            Duration::from_secs(generation.text_timeout_secs),
            Duration::from_secs(generation.image_timeout_secs),
        );
        Some(Arc::new(client))
    }

    fn settings(&self) -> TrackerSettings {
        let retrieval = &self.config.retrieval;
        let clusters = &self.config.clusters;
        let generation = &self.config.generation;
        TrackerSettings {
            duplicate_threshold: retrieval.duplicate_threshold,
            context: ContextConfig {
                top_k: retrieval.top_k,
                min_score: retrieval.min_score,
                max_cases: retrieval.max_cases,
                excerpt_chars: retrieval.excerpt_chars,
                related_top_k: retrieval.related_top_k,
                related_threshold: retrieval.related_threshold,
            },
            clusters: ClusterConfig {
                k: clusters.k,
                status: clusters.status.clone(),
                max_iterations: clusters.max_iterations,
                seed: clusters.seed,
                upsert_batch: clusters.upsert_batch,
            },
            policy: FallbackPolicy::new(
                generation.primary_model.clone(),
                generation.fallback_model.clone(),
            )
            .with_attempts(generation.attempts)
            .with_backoff(Duration::from_secs(generation.backoff_secs)),
        }
    }

    /// Wire up every collaborator from the configuration
    pub async fn tracker(&self) -> Result<Tracker> {
        let model_dir = Config::model_cache_dir()?;
        let embedder = embed::from_config(&self.config.embedding, &model_dir)
            .await
            .context("Failed to load embedding model")?;
        let store = self.open_store()?;
        let index = self.open_index().await?;
        Ok(Tracker::new(
            embedder,
            store,
            index,
            self.generator(),
            self.settings(),
        ))
    }
}
