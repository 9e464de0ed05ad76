use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Dimension of every stored and queried embedding (all-MiniLM-L6-v2)
pub const EMBEDDING_DIM: usize = 384;

/// A row as exchanged with the persistence collaborator
pub type Row = Map<String, Value>;

/// A validated embedding of exactly [`EMBEDDING_DIM`] values
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.len() != EMBEDDING_DIM {
            return Err(Error::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::invalid("embedding contains non-finite values"));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Lifecycle state of a bug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BugStatus {
    Open,
    InProgress,
    Solved,
    NeedsReview,
}

impl BugStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BugStatus::Open => "Open",
            BugStatus::InProgress => "InProgress",
            BugStatus::Solved => "Solved",
            BugStatus::NeedsReview => "NeedsReview",
        }
    }
}

impl std::fmt::Display for BugStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BugStatus {
    type Err = Error;

    /// Accepts "Solved", "solved", "In Progress", "in_progress", "needs-review", ...
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "open" => Ok(BugStatus::Open),
            "inprogress" => Ok(BugStatus::InProgress),
            "solved" => Ok(BugStatus::Solved),
            "needsreview" => Ok(BugStatus::NeedsReview),
            _ => Err(Error::invalid(format!("unknown bug status '{s}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for BugStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Default for BugStatus {
    fn default() -> Self {
        Self::Open
    }
}

/// A submitted bug report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugRecord {
    pub id: String,
    pub title: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default = "default_severity", deserialize_with = "lenient::severity")]
    pub severity: String,
    #[serde(default = "default_client_type", deserialize_with = "lenient::client_type")]
    pub client_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_language: Option<String>,
    /// Public URL of an uploaded screenshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_notes: Option<String>,
    #[serde(default)]
    pub status: BugStatus,
    #[serde(default, deserialize_with = "lenient::tags")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Advisory embedding cache; may be absent, stale or the wrong length
    #[serde(default, deserialize_with = "lenient::vector", skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_severity() -> String {
    "Low".to_string()
}

fn default_client_type() -> String {
    "Web".to_string()
}

impl BugRecord {
    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row)).map_err(|e| Error::Decode {
            kind: "bug",
            message: e.to_string(),
        })
    }

    pub fn to_row(&self) -> Row {
        to_row(self)
    }

    /// The cached embedding, only if it has the right shape
    pub fn cached_embedding(&self) -> Option<EmbeddingVector> {
        self.embedding
            .as_ref()
            .and_then(|v| EmbeddingVector::new(v.clone()).ok())
    }

    pub fn embedding_text(&self) -> String {
        embedding_text(
            &self.title,
            &self.description,
            &self.severity,
            &self.client_type,
            &self.tags,
        )
    }
}

/// Canonical text a bug is embedded from. Field order and single-space
/// joins are fixed; stored vectors depend on it.
pub fn embedding_text(
    title: &str,
    description: &str,
    severity: &str,
    client_type: &str,
    tags: &[String],
) -> String {
    format!(
        "{title} {description} {severity} {client_type} {}",
        tags.join(" ")
    )
}

/// A proposed fix for a bug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    pub id: String,
    pub bug_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub explanation: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub from_ai: bool,
    #[serde(default)]
    pub votes: i64,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Solution {
    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row)).map_err(|e| Error::Decode {
            kind: "solution",
            message: e.to_string(),
        })
    }

    pub fn to_row(&self) -> Row {
        to_row(self)
    }

    /// Text used for prompt excerpts: the explanation followed by the code
    pub fn body(&self) -> String {
        let explanation = self.explanation.trim();
        let code = self.code.trim();
        match (explanation.is_empty(), code.is_empty()) {
            (false, false) => format!("{explanation}\n{code}"),
            (false, true) => explanation.to_string(),
            (true, false) => code.to_string(),
            (true, true) => self.title.trim().to_string(),
        }
    }
}

/// One topic cluster produced by the batch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub cluster_id: u32,
    #[serde(default)]
    pub size: usize,
    #[serde(default, deserialize_with = "lenient::tags")]
    pub top_terms: Vec<String>,
    #[serde(default)]
    pub label: String,
    #[serde(default, deserialize_with = "lenient::vector_or_empty")]
    pub centroid: Vec<f32>,
    /// Layout coordinates owned by the positions concern
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default, deserialize_with = "lenient::timestamp", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ClusterRecord {
    pub fn from_row(row: Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row)).map_err(|e| Error::Decode {
            kind: "cluster",
            message: e.to_string(),
        })
    }

    /// Row written by the batch job; `x`/`y` are left out so a previously
    /// chosen layout survives the upsert
    pub fn to_upsert_row(&self) -> Row {
        let mut row = to_row(self);
        row.remove("x");
        row.remove("y");
        row
    }

    pub fn display_label(&self) -> String {
        if !self.top_terms.is_empty() {
            self.top_terms.join(", ")
        } else if !self.label.is_empty() {
            self.label.clone()
        } else {
            format!("Cluster {}", self.cluster_id)
        }
    }
}

/// A UI-chosen layout position for a cluster bubble
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClusterPosition {
    pub cluster_id: u32,
    pub x: f64,
    pub y: f64,
}

/// A nearest-neighbor hit from the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatch {
    pub id: String,
    /// Cosine similarity clamped to [0, 1]
    pub score: f32,
    #[serde(default)]
    pub metadata: Row,
}

/// Outcome of a positive duplicate check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateMatch {
    pub bug_id: String,
    pub similarity: f32,
}

/// Input for a new bug submission
#[derive(Debug, Clone, Default)]
pub struct NewBug {
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub severity: String,
    pub client_type: String,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
    pub code: Option<String>,
    pub code_language: Option<String>,
    pub screenshot: Option<String>,
    pub screenshot_notes: Option<String>,
}

/// Input for a new solution
#[derive(Debug, Clone, Default)]
pub struct NewSolution {
    pub bug_id: String,
    pub title: String,
    pub explanation: String,
    pub code: String,
    pub patch: Option<String>,
    pub user_id: Option<String>,
    pub author: Option<String>,
    pub from_ai: bool,
}

/// Round to a fixed number of decimals for percentage display
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Score in [0, 1] as a 0-100 percentage
pub fn to_percent(score: f32, decimals: i32) -> f64 {
    round_to(f64::from(score) * 100.0, decimals)
}

fn to_row<T: Serialize>(value: &T) -> Row {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Row::new(),
    }
}

/// Deserializers that tolerate the loosely-typed rows the store hands back
mod lenient {
    use super::*;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
        Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
    }

    pub fn severity<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
        Ok(Option::<String>::deserialize(d)?
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_severity))
    }

    pub fn client_type<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
        Ok(Option::<String>::deserialize(d)?
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(default_client_type))
    }

    /// Tags arrive as a JSON list, a JSON-encoded string, a comma list, or null
    pub fn tags<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<String>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(parse_tags(&value))
    }

    pub fn parse_tags(value: &Value) -> Vec<String> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.trim().to_string(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.starts_with('[') {
                    if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                        return parse_tags(&parsed);
                    }
                }
                trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Embeddings arrive as a number list or a pgvector literal; anything
    /// malformed is treated as a missing cache entry
    pub fn vector<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<f32>>, D::Error> {
        let value = Value::deserialize(d)?;
        Ok(parse_vector(&value))
    }

    pub fn vector_or_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<f32>, D::Error> {
        Ok(vector(d)?.unwrap_or_default())
    }

    pub fn parse_vector(value: &Value) -> Option<Vec<f32>> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32))
                .collect(),
            Value::String(s) => serde_json::from_str::<Vec<f32>>(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        Ok(raw.and_then(|s| parse_timestamp(&s)))
    }

    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        // Postgres `timestamp without time zone`
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_embedding_vector_rejects_wrong_dimension() {
        let err = EmbeddingVector::new(vec![0.0; 10]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 384,
                actual: 10
            }
        ));
        assert!(EmbeddingVector::new(vec![0.1; EMBEDDING_DIM]).is_ok());
    }

    #[test]
    fn test_embedding_vector_rejects_nan() {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[3] = f32::NAN;
        assert!(EmbeddingVector::new(values).is_err());
    }

    #[test]
    fn test_status_parsing_variants() {
        assert_eq!("Solved".parse::<BugStatus>().unwrap(), BugStatus::Solved);
        assert_eq!("open".parse::<BugStatus>().unwrap(), BugStatus::Open);
        assert_eq!("In Progress".parse::<BugStatus>().unwrap(), BugStatus::InProgress);
        assert_eq!("needs_review".parse::<BugStatus>().unwrap(), BugStatus::NeedsReview);
        assert!("closed".parse::<BugStatus>().is_err());
    }

    #[test]
    fn test_bug_from_minimal_row() {
        let bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "Crash"}))).unwrap();
        assert_eq!(bug.description, "");
        assert_eq!(bug.severity, "Low");
        assert_eq!(bug.client_type, "Web");
        assert_eq!(bug.status, BugStatus::Open);
        assert!(bug.tags.is_empty());
        assert!(bug.embedding.is_none());
    }

    #[test]
    fn test_bug_from_row_missing_title_fails() {
        let err = BugRecord::from_row(row(json!({"id": "FF-1"}))).unwrap_err();
        assert!(matches!(err, Error::Decode { kind: "bug", .. }));
    }

    #[test]
    fn test_bug_tags_accept_comma_string_and_nulls() {
        let bug = BugRecord::from_row(row(json!({
            "id": "FF-1", "title": "t", "tags": "ui, safari ,", "severity": null, "description": null
        })))
        .unwrap();
        assert_eq!(bug.tags, vec!["ui", "safari"]);
        assert_eq!(bug.severity, "Low");

        let bug = BugRecord::from_row(row(json!({"id": "FF-2", "title": "t", "tags": null}))).unwrap();
        assert!(bug.tags.is_empty());

        let bug = BugRecord::from_row(row(json!({"id": "FF-3", "title": "t", "tags": "[\"a\", \"b\"]"}))).unwrap();
        assert_eq!(bug.tags, vec!["a", "b"]);
    }

    #[test]
    fn test_bug_embedding_pgvector_literal() {
        let literal = format!("[{}]", vec!["0.5"; EMBEDDING_DIM].join(","));
        let bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "t", "embedding": literal}))).unwrap();
        let cached = bug.cached_embedding().unwrap();
        assert_eq!(cached.as_slice().len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_bug_wrong_length_embedding_is_not_cached() {
        let bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "t", "embedding": [0.1, 0.2]}))).unwrap();
        assert!(bug.embedding.is_some());
        assert!(bug.cached_embedding().is_none());

        let bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "t", "embedding": {"bad": true}}))).unwrap();
        assert!(bug.embedding.is_none());
    }

    #[test]
    fn test_bug_timestamp_variants() {
        let bug = BugRecord::from_row(row(json!({
            "id": "FF-1", "title": "t", "created_at": "2024-05-01T10:00:00.123456+00:00"
        })))
        .unwrap();
        assert!(bug.created_at.is_some());

        let bug = BugRecord::from_row(row(json!({
            "id": "FF-1", "title": "t", "created_at": "2024-05-01T10:00:00.5"
        })))
        .unwrap();
        assert!(bug.created_at.is_some());

        let bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "t", "created_at": "yesterday"}))).unwrap();
        assert!(bug.created_at.is_none());
    }

    #[test]
    fn test_bug_row_round_trips_status_text() {
        let mut bug = BugRecord::from_row(row(json!({"id": "FF-1", "title": "t"}))).unwrap();
        bug.status = BugStatus::Solved;
        let row = bug.to_row();
        assert_eq!(row["status"], json!("Solved"));
        assert!(!row.contains_key("embedding"));
    }

    #[test]
    fn test_solution_body_prefers_explanation_and_code() {
        let sol = Solution::from_row(row(json!({
            "id": "s1", "bug_id": "FF-1", "title": "Fix", "explanation": "Reset state", "code": "x = 0"
        })))
        .unwrap();
        assert_eq!(sol.body(), "Reset state\nx = 0");

        let sol = Solution::from_row(row(json!({"id": "s2", "bug_id": "FF-1", "title": "Only title"}))).unwrap();
        assert_eq!(sol.body(), "Only title");
    }

    #[test]
    fn test_cluster_upsert_row_omits_layout() {
        let cluster = ClusterRecord {
            cluster_id: 2,
            size: 4,
            top_terms: vec!["auth".into()],
            label: "auth".into(),
            centroid: vec![0.0; 3],
            x: Some(10.0),
            y: Some(20.0),
            last_updated: None,
        };
        let row = cluster.to_upsert_row();
        assert!(!row.contains_key("x"));
        assert!(!row.contains_key("y"));
        assert_eq!(row["cluster_id"], json!(2));
    }

    #[test]
    fn test_cluster_centroid_from_string() {
        let cluster = ClusterRecord::from_row(row(json!({
            "cluster_id": 0, "size": 1, "centroid": "[0.1, 0.2]", "top_terms": null
        })))
        .unwrap();
        assert_eq!(cluster.centroid.len(), 2);
        assert_eq!(cluster.display_label(), "Cluster 0");
    }

    #[test]
    fn test_embedding_text_layout() {
        let tags = vec!["ui".to_string(), "safari".to_string()];
        assert_eq!(
            embedding_text("Login crash", "Button fails", "High", "Web", &tags),
            "Login crash Button fails High Web ui safari"
        );
        assert_eq!(
            embedding_text("Login crash", "", "Low", "Mobile", &[]),
            "Login crash  Low Mobile "
        );
    }

    #[test]
    fn test_percent_rounding() {
        assert_eq!(to_percent(0.912_345, 2), 91.23);
        assert_eq!(to_percent(0.912_345, 1), 91.2);
        assert_eq!(round_to(85.0, 1), 85.0);
    }
}
