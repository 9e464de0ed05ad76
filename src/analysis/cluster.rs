use std::collections::HashMap;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::kmeans::{kmeans, KMeansParams};
use crate::embed::{embed_texts, SharedEmbedder};
use crate::error::{Error, Result};
use crate::storage::{self, Query, SharedStore, Table};
use crate::types::{BugRecord, BugStatus, ClusterPosition, ClusterRecord, EmbeddingVector, Row};

const MAX_TERMS: usize = 3;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub k: usize,
    pub status: String,
    pub max_iterations: usize,
    pub seed: u64,
    /// Rows per upsert call
    pub upsert_batch: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: 6,
            status: BugStatus::Solved.as_str().to_string(),
            max_iterations: 100,
            seed: 42,
            upsert_batch: 50,
        }
    }
}

/// Groups the bug corpus into topic clusters and maintains the cluster table
pub struct ClusterBuilder {
    embedder: SharedEmbedder,
    store: SharedStore,
    config: ClusterConfig,
}

impl ClusterBuilder {
    pub fn new(embedder: SharedEmbedder, store: SharedStore, config: ClusterConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Recompute clusters over bugs with `status_filter` and upsert them.
    ///
    /// `k` is clamped to the number of bugs. Rows written before a failed or
    /// cancelled upsert batch stay written.
    pub async fn rebuild_clusters(
        &self,
        k: usize,
        status_filter: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterRecord>> {
        let status: BugStatus = status_filter.parse()?;
        let bugs = storage::load_bugs(
            self.store.as_ref(),
            &Query::new().eq("status", status.as_str()),
        )
        .await?;
        if bugs.is_empty() || k == 0 {
            tracing::info!("No {status} bugs to cluster");
            return Ok(Vec::new());
        }

        let points = self.ensure_embeddings(&bugs).await?;

        let params = KMeansParams {
            k,
            max_iterations: self.config.max_iterations,
            seed: self.config.seed,
        };
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || kmeans(&points, params, &token))
            .await
            .map_err(|e| Error::Model(format!("clustering task failed: {e}")))??;

        let now = Utc::now();
        let mut clusters = Vec::new();
        for (cluster_id, centroid) in result.centroids.iter().enumerate() {
            let members: Vec<&BugRecord> = result.members(cluster_id).map(|i| &bugs[i]).collect();
            if members.is_empty() {
                continue;
            }
            let top_terms = top_terms(&members, MAX_TERMS);
            let label = if top_terms.is_empty() {
                format!("Cluster {cluster_id}")
            } else {
                top_terms.join(", ")
            };
            clusters.push(ClusterRecord {
                cluster_id: cluster_id as u32,
                size: members.len(),
                top_terms,
                label,
                centroid: centroid.clone(),
                x: None,
                y: None,
                last_updated: Some(now),
            });
        }

        tracing::info!(
            "Clustered {} bugs into {} clusters in {} iterations",
            bugs.len(),
            clusters.len(),
            result.iterations
        );

        let rows: Vec<Row> = clusters.iter().map(ClusterRecord::to_upsert_row).collect();
        self.upsert_batched(rows, cancel).await?;
        Ok(clusters)
    }

    /// Cached vectors where valid; the rest embedded in one batch and written
    /// back best-effort
    async fn ensure_embeddings(&self, bugs: &[BugRecord]) -> Result<Vec<EmbeddingVector>> {
        let mut vectors: Vec<Option<EmbeddingVector>> =
            bugs.iter().map(BugRecord::cached_embedding).collect();
        let missing: Vec<usize> = (0..bugs.len()).filter(|&i| vectors[i].is_none()).collect();

        if !missing.is_empty() {
            tracing::info!("Embedding {} bugs without a cached vector", missing.len());
            let texts = missing.iter().map(|&i| bugs[i].embedding_text()).collect();
            let computed = embed_texts(&self.embedder, texts).await?;

            let writes = missing.iter().zip(&computed).map(|(&i, vector)| {
                let mut patch = Row::new();
                patch.insert("embedding".into(), json!(vector.as_slice()));
                self.store.update(Table::Bugs, &bugs[i].id, patch)
            });
            for (result, &i) in join_all(writes).await.into_iter().zip(&missing) {
                if let Err(e) = result {
                    tracing::warn!("Failed to cache embedding for {}: {e}", bugs[i].id);
                }
            }

            for (&i, vector) in missing.iter().zip(computed) {
                vectors[i] = Some(vector);
            }
        }

        Ok(vectors.into_iter().flatten().collect())
    }

    async fn upsert_batched(&self, rows: Vec<Row>, cancel: &CancellationToken) -> Result<usize> {
        let batch_size = self.config.upsert_batch.max(1);
        let mut written = 0;
        for batch in rows.chunks(batch_size) {
            if cancel.is_cancelled() {
                tracing::warn!("Cluster upsert cancelled after {written} rows");
                return Err(Error::Cancelled);
            }
            match self.store.upsert(Table::Clusters, batch.to_vec()).await {
                Ok(n) => written += n,
                Err(e) => {
                    return Err(Error::PartialUpsert {
                        table: Table::Clusters.name().to_string(),
                        written,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(written)
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        storage::load_clusters(self.store.as_ref()).await
    }

    /// Store layout coordinates; only `x`/`y` are written
    pub async fn save_positions(&self, positions: &[ClusterPosition]) -> Result<usize> {
        if let Some(bad) = positions.iter().find(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(Error::invalid(format!(
                "position for cluster {} is not finite",
                bad.cluster_id
            )));
        }
        let rows: Vec<Row> = positions
            .iter()
            .map(|p| {
                let mut row = Row::new();
                row.insert("cluster_id".into(), Value::from(p.cluster_id));
                row.insert("x".into(), Value::from(p.x));
                row.insert("y".into(), Value::from(p.y));
                row
            })
            .collect();
        self.store.upsert(Table::Clusters, rows).await
    }
}

/// Most frequent terms across members, ties in first-seen order.
///
/// A member contributes its tags, or lowercase title words longer than three
/// characters when it has no tags.
pub fn top_terms(members: &[&BugRecord], limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut seen = 0usize;
    let mut add = |term: String| {
        let entry = counts.entry(term).or_insert((0, seen));
        entry.0 += 1;
        seen += 1;
    };

    for bug in members {
        let tags: Vec<&str> = bug
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            for word in bug.title.split_whitespace() {
                if word.chars().count() > 3 {
                    add(word.to_lowercase());
                }
            }
        } else {
            for tag in tags {
                add(tag.to_string());
            }
        }
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(limit).map(|(term, _)| term).collect()
}
