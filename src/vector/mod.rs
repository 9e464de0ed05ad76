//! Nearest-neighbor search over bug embeddings.

pub mod endee;
pub mod local;

pub use self::endee::EndeeIndex;
pub use self::local::LocalIndex;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::types::{BugRecord, EmbeddingVector, Row, SimilarityMatch};

/// Equality constraints on match metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetadataFilter(BTreeMap<String, Value>);

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, metadata: &Row) -> bool {
        self.0
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub backend: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_vectors: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

/// Vector similarity service keyed by bug id
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector and metadata stored under `id`
    async fn upsert(&self, id: &str, vector: &EmbeddingVector, metadata: Row) -> Result<()>;

    /// Top-`top_k` matches by cosine similarity, best first, scores in [0, 1]
    async fn search(
        &self,
        vector: &EmbeddingVector,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SimilarityMatch>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn stats(&self) -> Result<IndexStats>;
}

pub type SharedIndex = Arc<dyn VectorIndex>;

/// Metadata snapshot stored alongside a bug's vector
pub fn bug_metadata(bug: &BugRecord) -> Row {
    let mut meta = Row::new();
    meta.insert("bug_id".into(), Value::from(bug.id.clone()));
    meta.insert("title".into(), Value::from(bug.title.clone()));
    meta.insert("severity".into(), Value::from(bug.severity.clone()));
    meta.insert("status".into(), Value::from(bug.status.as_str()));
    meta.insert("tags".into(), Value::from(bug.tags.clone()));
    meta.insert(
        "created_at".into(),
        bug.created_at
            .map_or(Value::Null, |t| Value::from(t.to_rfc3339())),
    );
    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let meta = json!({"status": "Solved", "severity": "High"})
            .as_object()
            .cloned()
            .unwrap();
        assert!(MetadataFilter::new().matches(&meta));
        assert!(MetadataFilter::new().eq("status", "Solved").matches(&meta));
        assert!(!MetadataFilter::new().eq("status", "Open").matches(&meta));
        assert!(!MetadataFilter::new().eq("owner", "x").matches(&meta));
    }

    #[test]
    fn test_filter_serializes_flat() {
        let filter = MetadataFilter::new().eq("status", "Solved");
        assert_eq!(serde_json::to_value(&filter).unwrap(), json!({"status": "Solved"}));
    }

    #[test]
    fn test_bug_metadata_fields() {
        let bug = BugRecord::from_row(
            json!({"id": "FF-1", "title": "t", "status": "solved", "tags": ["a"]})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .unwrap();
        let meta = bug_metadata(&bug);
        assert_eq!(meta["bug_id"], json!("FF-1"));
        assert_eq!(meta["status"], json!("Solved"));
        assert_eq!(meta["tags"], json!(["a"]));
        assert_eq!(meta["created_at"], Value::Null);
    }
}
