//! HTTP client for a self-hosted Endee vector database.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{IndexStats, MetadataFilter, VectorIndex};
use crate::error::{Error, Result};
use crate::types::{EmbeddingVector, Row, SimilarityMatch, EMBEDDING_DIM};

const COLLABORATOR: &str = "endee";
const MAX_TOP_K: usize = 100;

pub struct EndeeIndex {
    base_url: String,
    api_key: Option<String>,
    index: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct IndexList {
    #[serde(default)]
    indexes: Vec<Value>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    matches: Vec<RawMatch>,
}

#[derive(Deserialize)]
struct RawMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<Row>,
}

impl EndeeIndex {
    pub fn new(base_url: &str, api_key: Option<String>, index: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            index: index.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Build a client and make sure the index exists (384 dims, cosine)
    pub async fn connect(base_url: &str, api_key: Option<String>, index: &str) -> Result<Self> {
        let client = Self::new(base_url, api_key, index);
        client.ensure_index().await?;
        Ok(client)
    }

    async fn ensure_index(&self) -> Result<()> {
        let resp = self.send(self.http.get(self.url("index/list"))).await?;
        let list: IndexList = resp.json().await.map_err(|e| Error::Decode {
            kind: "endee index list",
            message: e.to_string(),
        })?;

        let exists = list.indexes.iter().any(|entry| match entry {
            Value::String(name) => name == &self.index,
            Value::Object(obj) => obj.get("name").and_then(Value::as_str) == Some(self.index.as_str()),
            _ => false,
        });

        if exists {
            tracing::debug!("Endee index {} exists", self.index);
            match self.stats().await {
                Ok(IndexStats {
                    dimension: Some(dimension),
                    ..
                }) if dimension != EMBEDDING_DIM => {
                    return Err(Error::DimensionMismatch {
                        expected: EMBEDDING_DIM,
                        actual: dimension,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Could not read stats for {}: {e}", self.index),
            }
            return Ok(());
        }

        let body = json!({
            "name": self.index,
            "dimension": EMBEDDING_DIM,
            "metric": "cosine",
        });
        self.send(self.http.post(self.url("index/create")).json(&body))
            .await?;
        tracing::info!("Created Endee index {}", self.index);
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };
        let resp = request
            .send()
            .await
            .map_err(|e| Error::unavailable(COLLABORATOR, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::unavailable(
                COLLABORATOR,
                format!("HTTP {status}: {body}"),
            ));
        }
        Ok(resp)
    }
}

/// Pull a numeric field out of a loosely shaped stats document
fn stat_u64(stats: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| stats.get(*k).and_then(Value::as_u64))
}

#[async_trait]
impl VectorIndex for EndeeIndex {
    async fn upsert(&self, id: &str, vector: &EmbeddingVector, metadata: Row) -> Result<()> {
        let body = json!({
            "index": self.index,
            "vectors": [{
                "id": id,
                "values": vector.as_slice(),
                "metadata": metadata,
            }],
        });
        self.send(self.http.post(self.url("vector/upsert")).json(&body))
            .await?;
        tracing::debug!("Upserted vector {id}");
        Ok(())
    }

    async fn search(
        &self,
        vector: &EmbeddingVector,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SimilarityMatch>> {
        let mut body = json!({
            "index": self.index,
            "vector": vector.as_slice(),
            "top_k": top_k.clamp(1, MAX_TOP_K),
            "include_metadata": true,
        });
        if !filter.is_empty() {
            body["filter"] = serde_json::to_value(filter).unwrap_or(Value::Null);
        }

        let resp = self
            .send(self.http.post(self.url("vector/search")).json(&body))
            .await?;
        // A 200 with a body that is not a search result (proxy pages and the
        // like) means the service is not really answering
        let parsed: SearchResponse = resp.json().await.map_err(|e| {
            Error::unavailable(COLLABORATOR, format!("unreadable search response: {e}"))
        })?;

        let mut matches: Vec<SimilarityMatch> = parsed
            .matches
            .into_iter()
            .map(|m| SimilarityMatch {
                id: m.id,
                score: if m.score.is_finite() {
                    m.score.clamp(0.0, 1.0)
                } else {
                    0.0
                },
                metadata: m.metadata.unwrap_or_default(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let body = json!({ "index": self.index, "ids": ids });
        self.send(self.http.post(self.url("vector/delete")).json(&body))
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let resp = self
            .send(self.http.get(self.url(&format!("index/stats/{}", self.index))))
            .await?;
        let raw: Value = resp.json().await.map_err(|e| Error::Decode {
            kind: "endee stats",
            message: e.to_string(),
        })?;
        Ok(IndexStats {
            backend: "endee".into(),
            name: self.index.clone(),
            total_vectors: stat_u64(&raw, &["total_vectors", "vector_count", "count"]),
            dimension: stat_u64(&raw, &["dimension"]).map(|d| d as usize),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let index = EndeeIndex::new("http://localhost:8080/", None, "fixforge_bugs");
        assert_eq!(
            index.url("vector/search"),
            "http://localhost:8080/api/v1/vector/search"
        );
    }

    #[test]
    fn test_empty_api_key_ignored() {
        let index = EndeeIndex::new("http://localhost:8080", Some(String::new()), "x");
        assert!(index.api_key.is_none());
    }

    #[test]
    fn test_stat_fields() {
        let raw = json!({"vector_count": 12, "dimension": 384});
        assert_eq!(stat_u64(&raw, &["total_vectors", "vector_count"]), Some(12));
        assert_eq!(stat_u64(&raw, &["dimension"]), Some(384));
        assert_eq!(stat_u64(&raw, &["missing"]), None);
    }

    /// Serve one canned HTTP response on a local port
    async fn serve_once(content_type: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_search_html_body_is_unavailable() {
        let url = serve_once("text/html", "<html>proxy error</html>").await;
        let index = EndeeIndex::new(&url, None, "fixforge_bugs");
        let vector = EmbeddingVector::new(vec![0.1; EMBEDDING_DIM]).unwrap();
        let err = index
            .search(&vector, 3, &MetadataFilter::new())
            .await
            .unwrap_err();
        assert!(err.is_unavailable(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_search_parses_and_orders_matches() {
        let url = serve_once(
            "application/json",
            r#"{"matches":[{"id":"FF-1","score":0.7},{"id":"FF-2","score":0.9,"metadata":{"status":"Solved"}}]}"#,
        )
        .await;
        let index = EndeeIndex::new(&url, None, "fixforge_bugs");
        let vector = EmbeddingVector::new(vec![0.1; EMBEDDING_DIM]).unwrap();
        let hits = index
            .search(&vector, 3, &MetadataFilter::new())
            .await
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["FF-2", "FF-1"]);
        assert_eq!(hits[0].metadata["status"], json!("Solved"));
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_unavailable() {
        let err = EndeeIndex::connect("http://127.0.0.1:9", None, "x")
            .await
            .err()
            .unwrap();
        assert!(err.is_unavailable());
    }
}
