//! Bug tracker operations over the store, the vector index and the
//! generation collaborator.

use chrono::Utc;
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::analysis::{ClusterBuilder, ClusterConfig, DuplicateDetector};
use crate::embed::{embed_text, embed_texts, SharedEmbedder};
use crate::error::{Error, Result};
use crate::generate::{fetch_screenshot, FallbackPolicy, SharedGenerator};
use crate::search::{assemble_prompt, ContextBuilder, ContextConfig, RagContext, RelatedBugs};
use crate::storage::{self, Query, SharedStore, Table};
use crate::types::{
    to_percent, BugRecord, BugStatus, ClusterPosition, ClusterRecord, EmbeddingVector, NewBug,
    NewSolution, Row, Solution,
};
use crate::vector::{bug_metadata, IndexStats, MetadataFilter, SharedIndex};

pub const MAX_SEARCH_RESULTS: usize = 50;

/// Tunables that are not owned by a single component
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub duplicate_threshold: f32,
    pub context: ContextConfig,
    pub clusters: ClusterConfig,
    pub policy: FallbackPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Duplicate {
        bug_id: String,
        similarity: f64,
        has_solutions: bool,
        solution_count: usize,
    },
    Created {
        bug_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub bug_id: String,
    pub model_used: String,
    pub suggestion: String,
    pub rag_context_count: usize,
    #[serde(skip)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub bug_id: String,
    pub title: String,
    pub severity: String,
    pub status: String,
    pub similarity: f64,
    pub solution_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub succeeded: usize,
    pub failed: Vec<String>,
}

pub struct Tracker {
    embedder: SharedEmbedder,
    store: SharedStore,
    index: SharedIndex,
    generator: Option<SharedGenerator>,
    detector: DuplicateDetector,
    context: ContextBuilder,
    clusters: ClusterBuilder,
    policy: FallbackPolicy,
    http: reqwest::Client,
}

impl Tracker {
    pub fn new(
        embedder: SharedEmbedder,
        store: SharedStore,
        index: SharedIndex,
        generator: Option<SharedGenerator>,
        settings: TrackerSettings,
    ) -> Self {
        let context = ContextBuilder::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            settings.context,
        );
        let clusters = ClusterBuilder::new(embedder.clone(), store.clone(), settings.clusters);
        Self {
            embedder,
            store,
            index,
            generator,
            detector: DuplicateDetector::new(settings.duplicate_threshold),
            context,
            clusters,
            policy: settings.policy,
            http: reqwest::Client::new(),
        }
    }

    /// File a new bug unless it duplicates a stored one.
    ///
    /// The bug row is written before the index. If the index write fails the
    /// error names the stored bug so `reindex` can pick it up.
    pub async fn submit_bug(&self, new: NewBug) -> Result<SubmitOutcome> {
        let title = new.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::invalid("title is required"));
        }
        let description = new.description.trim().to_string();
        if description.is_empty() {
            return Err(Error::invalid("description is required"));
        }
        let severity = non_blank(new.severity).unwrap_or_else(|| "Low".into());
        let client_type = non_blank(new.client_type).unwrap_or_else(|| "Web".into());
        let tags: Vec<String> = new
            .tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let text = crate::types::embedding_text(&title, &description, &severity, &client_type, &tags);
        let vector = embed_text(&self.embedder, text).await?;

        let corpus = self.corpus().await?;
        if let Some(found) = self.detector.find_duplicate(&vector, &corpus) {
            let solution_count =
                match storage::load_solutions(self.store.as_ref(), &found.bug_id).await {
                    Ok(solutions) => solutions.len(),
                    Err(e) => {
                        tracing::warn!("Could not load solutions for {}: {e}", found.bug_id);
                        0
                    }
                };
            tracing::info!(
                "Submission duplicates {} ({:.3})",
                found.bug_id,
                found.similarity
            );
            return Ok(SubmitOutcome::Duplicate {
                bug_id: found.bug_id,
                similarity: to_percent(found.similarity, 2),
                has_solutions: solution_count > 0,
                solution_count,
            });
        }

        let bug = BugRecord {
            id: new_bug_id(),
            title,
            description,
            category: new.category.and_then(non_blank),
            severity,
            client_type,
            code: new.code.and_then(non_blank),
            code_language: new.code_language.and_then(non_blank),
            screenshot: new.screenshot.and_then(non_blank),
            screenshot_notes: new.screenshot_notes.and_then(non_blank),
            status: BugStatus::Open,
            tags,
            created_at: Some(Utc::now()),
            user_id: new.user_id,
            embedding: Some(vector.as_slice().to_vec()),
        };
        self.store.insert(Table::Bugs, bug.to_row()).await?;
        tracing::info!("Stored bug {}", bug.id);

        self.index
            .upsert(&bug.id, &vector, bug_metadata(&bug))
            .await
            .map_err(|e| Error::IndexWrite {
                bug_id: bug.id.clone(),
                message: e.to_string(),
            })?;

        Ok(SubmitOutcome::Created { bug_id: bug.id })
    }

    /// Every stored bug with a usable vector, in stored order. Bugs without
    /// a cached embedding are embedded on the fly.
    async fn corpus(&self) -> Result<Vec<(BugRecord, EmbeddingVector)>> {
        let bugs = storage::load_bugs(self.store.as_ref(), &Query::new()).await?;
        let vectors = self.vectors_for(&bugs).await?;
        Ok(bugs.into_iter().zip(vectors).collect())
    }

    async fn vectors_for(&self, bugs: &[BugRecord]) -> Result<Vec<EmbeddingVector>> {
        let missing: Vec<usize> = bugs
            .iter()
            .enumerate()
            .filter(|(_, b)| b.cached_embedding().is_none())
            .map(|(i, _)| i)
            .collect();
        let texts = missing.iter().map(|&i| bugs[i].embedding_text()).collect();
        let mut computed = embed_texts(&self.embedder, texts).await?.into_iter();

        let mut vectors = Vec::with_capacity(bugs.len());
        for bug in bugs {
            let vector = match bug.cached_embedding() {
                Some(v) => v,
                None => computed
                    .next()
                    .ok_or_else(|| Error::Model("embedder returned too few vectors".into()))?,
            };
            vectors.push(vector);
        }
        Ok(vectors)
    }

    /// Record a fix and mark the bug Solved in both store and index
    pub async fn add_solution(&self, new: NewSolution) -> Result<Solution> {
        let mut bug = storage::load_bug(self.store.as_ref(), &new.bug_id).await?;
        if new.explanation.trim().is_empty() && new.code.trim().is_empty() {
            return Err(Error::invalid("a solution needs an explanation or code"));
        }

        let solution = Solution {
            id: uuid::Uuid::new_v4().to_string(),
            bug_id: bug.id.clone(),
            user_id: new.user_id,
            title: new.title,
            explanation: new.explanation,
            code: new.code,
            patch: new.patch.and_then(non_blank),
            author: Some(new.author.and_then(non_blank).unwrap_or_else(|| "Anonymous".into())),
            from_ai: new.from_ai,
            votes: 0,
            created_at: Some(Utc::now()),
        };
        self.store.insert(Table::Solutions, solution.to_row()).await?;

        let mut patch = Row::new();
        patch.insert("status".into(), json!(BugStatus::Solved.as_str()));
        self.store.update(Table::Bugs, &bug.id, patch).await?;
        bug.status = BugStatus::Solved;

        let vector = match bug.cached_embedding() {
            Some(v) => v,
            None => embed_text(&self.embedder, bug.embedding_text()).await?,
        };
        self.index
            .upsert(&bug.id, &vector, bug_metadata(&bug))
            .await
            .map_err(|e| Error::IndexWrite {
                bug_id: bug.id.clone(),
                message: e.to_string(),
            })?;

        tracing::info!("Bug {} solved by solution {}", bug.id, solution.id);
        Ok(solution)
    }

    pub async fn related(&self, bug_id: &str) -> Result<RelatedBugs> {
        let bug = storage::load_bug(self.store.as_ref(), bug_id).await?;
        self.context.find_related(&bug).await
    }

    pub async fn context_for(&self, bug_id: &str) -> Result<RagContext> {
        let bug = storage::load_bug(self.store.as_ref(), bug_id).await?;
        self.context.build_context(&bug).await
    }

    /// The generation prompt for a bug and the context it was built from
    pub async fn prompt_for(&self, bug_id: &str) -> Result<(BugRecord, RagContext, String)> {
        let bug = storage::load_bug(self.store.as_ref(), bug_id).await?;
        let context = self.context.build_context(&bug).await?;
        let prompt = assemble_prompt(&bug, &context);
        Ok((bug, context, prompt))
    }

    /// Ask the generation service for a fix, primary model first
    pub async fn suggest_fix(&self, bug_id: &str) -> Result<Suggestion> {
        let generator = self
            .generator
            .as_ref()
            .ok_or_else(|| Error::unavailable("generation", "no API key configured"))?;
        let (bug, context, prompt) = self.prompt_for(bug_id).await?;

        let image = match bug.screenshot.as_deref() {
            Some(url) => fetch_screenshot(&self.http, url).await,
            None => None,
        };

        let (suggestion, model_used) = self
            .policy
            .run(generator.as_ref(), &prompt, image.as_ref())
            .await
            .into_result()?;

        Ok(Suggestion {
            bug_id: bug.id,
            model_used,
            suggestion,
            rag_context_count: context.len(),
            prompt,
        })
    }

    /// Free-text search over the index
    pub async fn semantic_search(
        &self,
        query: &str,
        top_k: usize,
        severity: Option<&str>,
        status: Option<BugStatus>,
    ) -> Result<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::invalid("query is empty"));
        }
        let top_k = top_k.clamp(1, MAX_SEARCH_RESULTS);
        let vector = embed_text(&self.embedder, query.to_string()).await?;

        let mut filter = MetadataFilter::new();
        if let Some(severity) = severity {
            filter = filter.eq("severity", severity);
        }
        if let Some(status) = status {
            filter = filter.eq("status", status.as_str());
        }
        let matches = self.index.search(&vector, top_k, &filter).await?;

        let counts = join_all(
            matches
                .iter()
                .map(|m| storage::load_solutions(self.store.as_ref(), &m.id)),
        )
        .await;

        Ok(matches
            .into_iter()
            .zip(counts)
            .enumerate()
            .map(|(i, (m, solutions))| {
                let meta = |key: &str| {
                    m.metadata
                        .get(key)
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                };
                SearchHit {
                    rank: i + 1,
                    title: meta("title"),
                    severity: meta("severity"),
                    status: meta("status"),
                    similarity: to_percent(m.score, 2),
                    solution_count: solutions.map_or(0, |s| s.len()),
                    bug_id: m.id,
                }
            })
            .collect())
    }

    /// Push every stored bug into the index. Failures are collected, not
    /// fatal; a dry run only counts.
    pub async fn reindex(&self, dry_run: bool, show_progress: bool) -> Result<ReindexReport> {
        let bugs = storage::load_bugs(self.store.as_ref(), &Query::new()).await?;
        if dry_run {
            return Ok(ReindexReport {
                succeeded: bugs.len(),
                failed: Vec::new(),
            });
        }
        let vectors = self.vectors_for(&bugs).await?;

        let progress = if show_progress {
            let pb = ProgressBar::new(bugs.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut report = ReindexReport::default();
        for (bug, vector) in bugs.iter().zip(&vectors) {
            progress.set_message(bug.id.clone());
            match self.index.upsert(&bug.id, vector, bug_metadata(bug)).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    tracing::warn!("Failed to index {}: {e}", bug.id);
                    report.failed.push(bug.id.clone());
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(report)
    }

    pub async fn index_stats(&self) -> Result<IndexStats> {
        self.index.stats().await
    }

    pub async fn rebuild_clusters(
        &self,
        k: Option<usize>,
        status: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ClusterRecord>> {
        let config = self.clusters.config();
        let k = k.unwrap_or(config.k);
        let status = status.unwrap_or(&config.status).to_string();
        self.clusters.rebuild_clusters(k, &status, cancel).await
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        self.clusters.list_clusters().await
    }

    pub async fn save_positions(&self, positions: &[ClusterPosition]) -> Result<usize> {
        self.clusters.save_positions(positions).await
    }
}

fn new_bug_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("FF-{}", uuid[..8].to_uppercase())
}

fn non_blank(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
