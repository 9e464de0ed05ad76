use futures::future::join_all;
use serde::Serialize;

use crate::embed::{embed_text, SharedEmbedder};
use crate::error::Result;
use crate::storage::{self, SharedStore};
use crate::types::{round_to, to_percent, BugRecord, BugStatus, EmbeddingVector, SimilarityMatch};
use crate::vector::{MetadataFilter, SharedIndex};

/// Configuration for context assembly
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Neighbors requested from the index
    pub top_k: usize,
    /// Neighbors scoring below this are dropped from the prompt context
    pub min_score: f32,
    pub max_cases: usize,
    /// Excerpt length in characters before the ellipsis
    pub excerpt_chars: usize,
    pub related_top_k: usize,
    /// Best score needed to flag a bug as having related solved bugs
    pub related_threshold: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.7,
            max_cases: 3,
            excerpt_chars: 300,
            related_top_k: 3,
            related_threshold: 0.85,
        }
    }
}

/// One prior solved bug used as prompt context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RagCase {
    pub bug_id: String,
    /// 0-100, one decimal
    pub similarity_percentage: f64,
    pub solution_excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RagContext {
    pub cases: Vec<RagCase>,
}

impl RagContext {
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelatedBug {
    pub id: String,
    pub title: String,
    pub description: String,
    /// 0-100, two decimals
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub id: u32,
    pub label: String,
    pub size: usize,
    pub x: Option<f64>,
    pub y: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RelatedBugs {
    pub top_suggestions: Vec<RelatedBug>,
    pub has_related: bool,
    pub clusters: Vec<ClusterSummary>,
}

/// Builds retrieval context from similar solved bugs
pub struct ContextBuilder {
    embedder: SharedEmbedder,
    index: SharedIndex,
    store: SharedStore,
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(
        embedder: SharedEmbedder,
        index: SharedIndex,
        store: SharedStore,
        config: ContextConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Context with the configured `top_k` and `min_score`
    pub async fn build_context(&self, target: &BugRecord) -> Result<RagContext> {
        self.build_context_with(target, self.config.top_k, self.config.min_score)
            .await
    }

    /// Up to `max_cases` solved neighbors scoring at least `min_score`, each
    /// with an excerpt of its first solution, best first.
    ///
    /// Degrades to an empty context when the index is unreachable. A neighbor
    /// whose solutions cannot be fetched is left out.
    pub async fn build_context_with(
        &self,
        target: &BugRecord,
        k: usize,
        min_score: f32,
    ) -> Result<RagContext> {
        let vector = self.target_vector(target).await?;
        let Some(neighbors) = self.solved_neighbors(target, &vector, k).await? else {
            return Ok(RagContext::default());
        };
        let neighbors: Vec<SimilarityMatch> = neighbors
            .into_iter()
            .filter(|m| m.score >= min_score)
            .collect();

        let fetches = neighbors
            .iter()
            .map(|m| storage::load_solutions(self.store.as_ref(), &m.id));
        let solutions = join_all(fetches).await;

        let mut cases = Vec::new();
        for (neighbor, fetched) in neighbors.iter().zip(solutions) {
            if cases.len() >= self.config.max_cases {
                break;
            }
            let solutions = match fetched {
                Ok(solutions) => solutions,
                Err(e) => {
                    tracing::warn!("Skipping {} in context: {e}", neighbor.id);
                    continue;
                }
            };
            let Some(first) = solutions.first() else {
                continue;
            };
            cases.push(RagCase {
                bug_id: neighbor.id.clone(),
                similarity_percentage: to_percent(neighbor.score, 1),
                solution_excerpt: excerpt(&first.body(), self.config.excerpt_chars),
            });
        }

        tracing::debug!("Built context with {} cases for {}", cases.len(), target.id);
        Ok(RagContext { cases })
    }

    /// Most similar solved bugs for the "related" panel, plus current clusters
    pub async fn find_related(&self, target: &BugRecord) -> Result<RelatedBugs> {
        let vector = self.target_vector(target).await?;
        let neighbors = self
            .solved_neighbors(target, &vector, self.config.related_top_k)
            .await?
            .unwrap_or_default();

        let has_related = neighbors
            .first()
            .is_some_and(|best| best.score >= self.config.related_threshold);

        let lookups = neighbors
            .iter()
            .map(|m| storage::load_bug(self.store.as_ref(), &m.id));
        let bugs = join_all(lookups).await;

        let top_suggestions = neighbors
            .iter()
            .zip(bugs)
            .map(|(m, bug)| {
                let (title, description) = match bug {
                    Ok(bug) => (bug.title, bug.description),
                    Err(e) => {
                        tracing::warn!("Using index metadata for {}: {e}", m.id);
                        let title = m
                            .metadata
                            .get("title")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        (title, String::new())
                    }
                };
                RelatedBug {
                    id: m.id.clone(),
                    title,
                    description,
                    similarity: round_to(f64::from(m.score) * 100.0, 2),
                }
            })
            .collect();

        let clusters = match storage::load_clusters(self.store.as_ref()).await {
            Ok(clusters) => clusters
                .into_iter()
                .map(|c| ClusterSummary {
                    id: c.cluster_id,
                    label: c.display_label(),
                    size: c.size,
                    x: c.x,
                    y: c.y,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("Could not load clusters: {e}");
                Vec::new()
            }
        };

        Ok(RelatedBugs {
            top_suggestions,
            has_related,
            clusters,
        })
    }

    async fn target_vector(&self, target: &BugRecord) -> Result<EmbeddingVector> {
        match target.cached_embedding() {
            Some(v) => Ok(v),
            None => embed_text(&self.embedder, target.embedding_text()).await,
        }
    }

    /// Solved neighbors excluding the target, best first. `None` when the
    /// index could not be queried or answered with something unreadable.
    async fn solved_neighbors(
        &self,
        target: &BugRecord,
        vector: &EmbeddingVector,
        k: usize,
    ) -> Result<Option<Vec<SimilarityMatch>>> {
        if k == 0 {
            return Ok(Some(Vec::new()));
        }
        let filter = MetadataFilter::new().eq("status", BugStatus::Solved.as_str());
        // One extra in case the target itself is among the hits
        match self.index.search(vector, k + 1, &filter).await {
            Ok(hits) => Ok(Some(
                hits.into_iter()
                    .filter(|m| m.id != target.id)
                    .take(k)
                    .collect(),
            )),
            Err(e) => {
                tracing::warn!("Vector search failed, continuing without context: {e}");
                Ok(None)
            }
        }
    }
}

/// First `max_chars` characters, with `...` appended only when cut
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::embed::HashingEmbedder;
    use crate::error::Error;
    use crate::storage::{Persistence, SqliteStore, Table};
    use crate::types::{EmbeddingVector, Row, EMBEDDING_DIM};
    use crate::vector::{bug_metadata, IndexStats, LocalIndex, VectorIndex};

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    /// Unit vector leaning `tilt` away from axis 0 toward `axis`
    fn make_embedding(axis: usize, tilt: f32) -> EmbeddingVector {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[0] = (1.0 - tilt * tilt).sqrt();
        v[axis] += tilt;
        EmbeddingVector::new(v).unwrap()
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        index: Arc<LocalIndex>,
        builder: ContextBuilder,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let index = Arc::new(LocalIndex::open_in_memory().unwrap());
        let builder = ContextBuilder::new(
            Arc::new(HashingEmbedder::new()),
            index.clone(),
            store.clone(),
            ContextConfig::default(),
        );
        Fixture {
            store,
            index,
            builder,
        }
    }

    async fn add_bug(f: &Fixture, id: &str, status: &str, vector: &EmbeddingVector) -> BugRecord {
        let mut r = row(json!({"id": id, "title": format!("Bug {id}"), "description": "desc", "status": status}));
        r.insert("embedding".into(), json!(vector.as_slice()));
        f.store.insert(Table::Bugs, r.clone()).await.unwrap();
        let bug = BugRecord::from_row(r).unwrap();
        f.index.upsert(id, vector, bug_metadata(&bug)).await.unwrap();
        bug
    }

    async fn add_solution(f: &Fixture, id: &str, bug_id: &str, explanation: &str) {
        f.store
            .insert(
                Table::Solutions,
                row(json!({"id": id, "bug_id": bug_id, "title": "fix", "explanation": explanation, "code": ""})),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_excerpt_truncation() {
        assert_eq!(excerpt("short", 300), "short");
        let long = "a".repeat(301);
        let cut = excerpt(&long, 300);
        assert_eq!(cut.len(), 303);
        assert!(cut.ends_with("..."));
        assert_eq!(excerpt(&"a".repeat(300), 300), "a".repeat(300));
    }

    #[test]
    fn test_excerpt_multibyte_safe() {
        let text = "é".repeat(310);
        let cut = excerpt(&text, 300);
        assert_eq!(cut.chars().count(), 303);
    }

    #[tokio::test]
    async fn test_context_filters_and_orders() {
        let f = fixture();
        let target = add_bug(&f, "FF-target", "Open", &make_embedding(1, 0.0)).await;
        add_bug(&f, "FF-close", "Solved", &make_embedding(1, 0.2)).await;
        add_bug(&f, "FF-closer", "Solved", &make_embedding(1, 0.1)).await;
        add_bug(&f, "FF-far", "Solved", &make_embedding(1, 0.9)).await;
        add_bug(&f, "FF-open", "Open", &make_embedding(1, 0.05)).await;
        add_solution(&f, "s1", "FF-close", "Close fix").await;
        add_solution(&f, "s2", "FF-closer", "Closer fix").await;
        add_solution(&f, "s3", "FF-far", "Far fix").await;
        add_solution(&f, "s4", "FF-open", "Open fix").await;

        let ctx = f.builder.build_context(&target).await.unwrap();
        let ids: Vec<_> = ctx.cases.iter().map(|c| c.bug_id.as_str()).collect();
        assert_eq!(ids, vec!["FF-closer", "FF-close"]);
        assert!(ctx.cases[0].similarity_percentage >= ctx.cases[1].similarity_percentage);
        assert_eq!(ctx.cases[0].solution_excerpt, "Closer fix");
    }

    #[tokio::test]
    async fn test_context_caps_cases_and_skips_unsolved_neighbors() {
        let f = fixture();
        let target = add_bug(&f, "FF-target", "Open", &make_embedding(1, 0.0)).await;
        for i in 0..5 {
            let id = format!("FF-{i}");
            add_bug(&f, &id, "Solved", &make_embedding(1, 0.05 * (i as f32 + 1.0))).await;
            if i != 0 {
                add_solution(&f, &format!("s{i}"), &id, &"x".repeat(400)).await;
            }
        }

        let ctx = f.builder.build_context(&target).await.unwrap();
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.cases[0].bug_id, "FF-1");
        assert!(ctx.cases.iter().all(|c| c.solution_excerpt.chars().count() == 303));
    }

    #[tokio::test]
    async fn test_context_excludes_solved_target_itself() {
        let f = fixture();
        let target = add_bug(&f, "FF-self", "Solved", &make_embedding(1, 0.0)).await;
        add_solution(&f, "s1", "FF-self", "own fix").await;
        let ctx = f.builder.build_context(&target).await.unwrap();
        assert!(ctx.is_empty());
    }

    /// Index whose every call fails with the error `fail` builds
    struct BrokenIndex {
        fail: fn() -> Error,
    }

    #[async_trait::async_trait]
    impl VectorIndex for BrokenIndex {
        async fn upsert(&self, _: &str, _: &EmbeddingVector, _: Row) -> Result<()> {
            Err((self.fail)())
        }
        async fn search(
            &self,
            _: &EmbeddingVector,
            _: usize,
            _: &MetadataFilter,
        ) -> Result<Vec<SimilarityMatch>> {
            Err((self.fail)())
        }
        async fn delete(&self, _: &[String]) -> Result<()> {
            Err((self.fail)())
        }
        async fn stats(&self) -> Result<IndexStats> {
            Err((self.fail)())
        }
    }

    async fn assert_degrades_to_empty(fail: fn() -> Error) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let builder = ContextBuilder::new(
            Arc::new(HashingEmbedder::new()),
            Arc::new(BrokenIndex { fail }),
            store,
            ContextConfig::default(),
        );
        let target = BugRecord::from_row(row(json!({"id": "FF-1", "title": "Crash"}))).unwrap();

        assert!(builder.build_context(&target).await.unwrap().is_empty());
        let related = builder.find_related(&target).await.unwrap();
        assert!(related.top_suggestions.is_empty());
        assert!(!related.has_related);
    }

    #[tokio::test]
    async fn test_index_down_degrades_to_empty() {
        assert_degrades_to_empty(|| Error::unavailable("endee", "down")).await;
    }

    #[tokio::test]
    async fn test_garbled_index_reply_degrades_to_empty() {
        assert_degrades_to_empty(|| Error::Decode {
            kind: "endee search response",
            message: "expected value at line 1 column 1".into(),
        })
        .await;
    }

    #[tokio::test]
    async fn test_find_related_percentages_and_flag() {
        let f = fixture();
        let target = add_bug(&f, "FF-target", "Open", &make_embedding(1, 0.0)).await;
        add_bug(&f, "FF-a", "Solved", &make_embedding(1, 0.3)).await;
        add_bug(&f, "FF-b", "Solved", &make_embedding(1, 0.6)).await;
        f.store
            .upsert(Table::Clusters, vec![row(json!({"cluster_id": 0, "size": 2, "top_terms": ["auth"]}))])
            .await
            .unwrap();

        let related = f.builder.find_related(&target).await.unwrap();
        assert!(related.has_related);
        assert_eq!(related.top_suggestions.len(), 2);
        assert_eq!(related.top_suggestions[0].id, "FF-a");
        assert_eq!(related.top_suggestions[0].description, "desc");
        // cos = sqrt(1 - 0.09) = 0.95394
        assert_eq!(related.top_suggestions[0].similarity, 95.39);
        assert_eq!(related.clusters.len(), 1);
        assert_eq!(related.clusters[0].label, "auth");
    }

    #[tokio::test]
    async fn test_find_related_below_threshold() {
        let f = fixture();
        let target = add_bug(&f, "FF-target", "Open", &make_embedding(1, 0.0)).await;
        add_bug(&f, "FF-b", "Solved", &make_embedding(1, 0.6)).await;
        let related = f.builder.find_related(&target).await.unwrap();
        assert!(!related.has_related);
        assert_eq!(related.top_suggestions.len(), 1);
    }
}
